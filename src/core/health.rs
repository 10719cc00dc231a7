//! Aggregated health view for the status surface.

use crate::core::engine::EngineClient;
use crate::mcp::manager::ConnectionManager;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub engine_connected: bool,
    pub current_model: Option<String>,
    pub model_loaded: bool,
    pub backends_ready: usize,
    pub tools_available: usize,
}

impl HealthReport {
    /// Probes the engine and snapshots backend state. `degraded` means the
    /// engine did not answer; tool backends being down never degrades the
    /// overall status since chat works without them.
    pub async fn gather(engine: &EngineClient, manager: &ConnectionManager) -> Self {
        let engine_connected = engine.check_connection().await;
        Self {
            status: if engine_connected { "healthy" } else { "degraded" },
            engine_connected,
            current_model: engine.current_model(),
            model_loaded: engine.is_model_loaded(),
            backends_ready: manager.ready_count().await,
            tools_available: manager.registry().snapshot().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{EngineConfig, ToolSettings};

    #[tokio::test]
    async fn unreachable_engine_reports_degraded() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let engine = EngineClient::new(EngineConfig::new(format!("http://{addr}")))
            .expect("engine should build");
        let manager = ConnectionManager::new(Vec::new(), ToolSettings::default());

        let report = HealthReport::gather(&engine, &manager).await;
        assert_eq!(report.status, "degraded");
        assert!(!report.engine_connected);
        assert!(!report.model_loaded);
        assert_eq!(report.backends_ready, 0);
        assert_eq!(report.tools_available, 0);

        let json = serde_json::to_value(&report).expect("report should serialize");
        assert_eq!(json["status"], "degraded");
    }
}
