//! Pooled client for the inference engine.
//!
//! Generation goes through the engine's OpenAI-compatible surface; model
//! management uses its native endpoints. The two latency-hiding calls,
//! [`EngineClient::warmup_connection`] and [`EngineClient::preload_model`],
//! are best-effort: their failure costs cold-start latency, never
//! correctness.

use crate::api::{ModelEntry, TagsResponse};
use crate::core::config::EngineConfig;
use crate::core::constants::{
    HEALTH_TIMEOUT_SECS, LIST_MODELS_TIMEOUT_SECS, PRELOAD_TIMEOUT_SECS, WARMUP_TIMEOUT_SECS,
};
use crate::utils::url::construct_api_url;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("inference engine unreachable: {0}")]
    Unreachable(String),

    #[error("engine request failed: {0}")]
    Request(String),
}

pub struct EngineClient {
    client: reqwest::Client,
    config: EngineConfig,
    current_model: RwLock<Option<String>>,
    model_loaded: AtomicBool,
    connection_warmed: AtomicBool,
}

impl EngineClient {
    /// Builds the pooled HTTP client. Pool ceiling and keepalive come from
    /// configuration, not constants.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_connections)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .build()
            .map_err(|err| EngineError::Request(err.to_string()))?;

        Ok(Self {
            client,
            config,
            current_model: RwLock::new(None),
            model_loaded: AtomicBool::new(false),
            connection_warmed: AtomicBool::new(false),
        })
    }

    /// Shared pooled client for the generation path.
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub fn default_model(&self) -> Option<&str> {
        self.config.default_model.as_deref()
    }

    /// Forces the TCP/TLS handshake ahead of the first real request.
    /// Failure is logged and swallowed; the system works without it, just
    /// with a slower first request.
    pub async fn warmup_connection(&self) {
        if self.connection_warmed.load(Ordering::SeqCst) {
            return;
        }
        let url = construct_api_url(&self.config.base_url, "api/tags");
        let probe = tokio::time::timeout(
            Duration::from_secs(WARMUP_TIMEOUT_SECS),
            self.client.get(url).send(),
        )
        .await;
        match probe {
            Ok(Ok(_)) => {
                self.connection_warmed.store(true, Ordering::SeqCst);
                debug!("Engine connection warmed up");
            }
            Ok(Err(err)) => warn!(error = %err, "Engine warmup failed (non-critical)"),
            Err(_) => warn!("Engine warmup timed out (non-critical)"),
        }
    }

    /// True when the engine answers its listing endpoint.
    pub async fn check_connection(&self) -> bool {
        let url = construct_api_url(&self.config.base_url, "api/tags");
        matches!(
            tokio::time::timeout(
                Duration::from_secs(HEALTH_TIMEOUT_SECS),
                self.client.get(url).send(),
            )
            .await,
            Ok(Ok(response)) if response.status().is_success()
        )
    }

    /// Models installed on the engine.
    pub async fn list_models(&self) -> Result<Vec<ModelEntry>, EngineError> {
        let url = construct_api_url(&self.config.base_url, "api/tags");
        let response = tokio::time::timeout(
            Duration::from_secs(LIST_MODELS_TIMEOUT_SECS),
            self.client.get(url).send(),
        )
        .await
        .map_err(|_| EngineError::Unreachable("model listing timed out".to_string()))?
        .map_err(|err| EngineError::Unreachable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Request(format!(
                "model listing returned {}",
                response.status()
            )));
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|err| EngineError::Request(err.to_string()))?;
        Ok(tags.models)
    }

    /// Issues a one-token generation to force the named model resident in
    /// engine memory before real traffic arrives. Best-effort: a failure
    /// only affects cold-start latency.
    pub async fn preload_model(&self, model: &str) -> Result<(), EngineError> {
        let url = construct_api_url(&self.config.base_url, "api/generate");
        info!(model = %model, "Preloading model");
        let body = serde_json::json!({
            "model": model,
            "prompt": "Hi",
            "stream": false,
            "options": {"num_predict": 1}
        });
        let response = tokio::time::timeout(
            Duration::from_secs(PRELOAD_TIMEOUT_SECS),
            self.client.post(url).json(&body).send(),
        )
        .await
        .map_err(|_| EngineError::Unreachable("model preload timed out".to_string()))?
        .map_err(|err| EngineError::Unreachable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Request(format!(
                "model preload returned {}",
                response.status()
            )));
        }

        self.set_model(model);
        info!(model = %model, "Model resident");
        Ok(())
    }

    /// Records a model as the resident one without issuing a preload.
    pub fn set_model(&self, model: &str) {
        *self
            .current_model
            .write()
            .expect("model lock poisoned") = Some(model.to_string());
        self.model_loaded.store(true, Ordering::SeqCst);
    }

    pub fn current_model(&self) -> Option<String> {
        self.current_model
            .read()
            .expect("model lock poisoned")
            .clone()
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model_loaded.load(Ordering::SeqCst) && self.current_model().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> EngineClient {
        EngineClient::new(EngineConfig::new("http://localhost:11434"))
            .expect("client should build")
    }

    #[test]
    fn model_state_starts_cold() {
        let engine = client();
        assert!(!engine.is_model_loaded());
        assert!(engine.current_model().is_none());
    }

    #[test]
    fn set_model_marks_resident() {
        let engine = client();
        engine.set_model("llama3.2");
        assert!(engine.is_model_loaded());
        assert_eq!(engine.current_model().as_deref(), Some("llama3.2"));
    }

    #[tokio::test]
    async fn list_models_parses_tags_payload() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buffer = [0_u8; 1024];
            let _ = stream.read(&mut buffer).await;
            let body = serde_json::json!({
                "models": [
                    {"name": "llama3.2", "size": 2_000_000_000_u64},
                    {"name": "qwen2.5-coder"}
                ]
            })
            .to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream
                .write_all(response.as_bytes())
                .await
                .expect("write response");
        });

        let engine = EngineClient::new(EngineConfig::new(format!("http://{addr}")))
            .expect("client should build");
        let models = engine.list_models().await.expect("models should list");
        server.await.expect("server task");

        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "llama3.2");
        assert_eq!(models[0].size, Some(2_000_000_000));
    }

    #[tokio::test]
    async fn check_connection_is_false_when_engine_is_down() {
        // Reserved port with no listener behind it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let engine = EngineClient::new(EngineConfig::new(format!("http://{addr}")))
            .expect("client should build");
        assert!(!engine.check_connection().await);
    }
}
