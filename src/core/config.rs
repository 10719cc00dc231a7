//! Typed configuration consumed by the core.
//!
//! Loading and parsing (YAML files, environment variables) happen outside
//! this crate; the host hands fully formed values to the constructors here
//! and the core never re-reads environment state itself.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One configured tool backend.
///
/// Immutable after load except the `enabled` flag, which the connection
/// manager flips at runtime. Runtime toggles are never written back to the
/// configuration source; they last until the process restarts.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub transport: String,
    #[serde(default)]
    pub enabled: bool,
    pub description: Option<String>,
    #[serde(default)]
    pub config: ConnectionParams,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-backend override of the tool invocation deadline, in seconds.
    pub invoke_timeout_secs: Option<u64>,
}

/// Transport-specific connection parameters. Which fields are required
/// depends on the transport kind; `require_*` helpers enforce that at
/// connect time rather than at load time.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ConnectionParams {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub url: Option<String>,
    pub headers: Option<HashMap<String, String>>,
}

/// Supported tool-backend transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    HttpStream,
    Socket,
}

impl TransportKind {
    /// Resolves the transport kind from a backend's `type` field.
    pub fn from_config(config: &BackendConfig) -> Result<Self, String> {
        match config.transport.to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "http" | "http-stream" | "sse" => Ok(TransportKind::HttpStream),
            "socket" | "websocket" | "ws" => Ok(TransportKind::Socket),
            other => Err(format!("Unsupported backend transport: {}", other)),
        }
    }
}

pub fn require_stdio_command(config: &BackendConfig) -> Result<String, String> {
    config
        .config
        .command
        .clone()
        .ok_or_else(|| "Backend command is required for stdio transport.".to_string())
}

pub fn stdio_args(config: &BackendConfig) -> Vec<String> {
    config.config.args.clone().unwrap_or_default()
}

pub fn require_url(config: &BackendConfig) -> Result<String, String> {
    config
        .config
        .url
        .clone()
        .ok_or_else(|| "Backend url is required for http and socket transports.".to_string())
}

pub fn http_headers(config: &BackendConfig) -> HashMap<String, String> {
    config.config.headers.clone().unwrap_or_default()
}

/// Global limits for tool-backend handling. Every deadline the adapters
/// observe comes from here or from a per-backend override.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    /// Bound on connect + handshake for one backend, in seconds.
    pub connect_timeout_secs: u64,
    /// Default deadline for a single tool invocation, in seconds.
    pub invoke_timeout_secs: u64,
    /// How many backends may be connecting at once during startup.
    pub startup_concurrency: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            invoke_timeout_secs: 30,
            startup_concurrency: 3,
        }
    }
}

/// Connection parameters for the inference engine. Pool sizing is a
/// configuration ceiling, not a constant.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub default_model: Option<String>,
    pub max_idle_connections: usize,
    pub pool_idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl EngineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_model: None,
            max_idle_connections: 10,
            pool_idle_timeout_secs: 30,
            connect_timeout_secs: 2,
            request_timeout_secs: 120,
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_backend() -> BackendConfig {
        serde_json::from_value(serde_json::json!({
            "name": "calc",
            "type": "stdio",
            "enabled": true,
            "description": "calculator tools",
            "config": {"command": "calc-server", "args": ["--quiet"]},
            "env": {"CALC_MODE": "safe"}
        }))
        .expect("backend should parse")
    }

    #[test]
    fn parses_backend_record() {
        let backend = stdio_backend();
        assert_eq!(backend.name, "calc");
        assert_eq!(
            TransportKind::from_config(&backend),
            Ok(TransportKind::Stdio)
        );
        assert_eq!(require_stdio_command(&backend).as_deref(), Ok("calc-server"));
        assert_eq!(stdio_args(&backend), vec!["--quiet".to_string()]);
        assert_eq!(backend.env.get("CALC_MODE").map(String::as_str), Some("safe"));
    }

    #[test]
    fn transport_kind_accepts_aliases() {
        let mut backend = stdio_backend();
        for (alias, kind) in [
            ("http", TransportKind::HttpStream),
            ("HTTP-STREAM", TransportKind::HttpStream),
            ("socket", TransportKind::Socket),
            ("ws", TransportKind::Socket),
        ] {
            backend.transport = alias.to_string();
            assert_eq!(TransportKind::from_config(&backend), Ok(kind));
        }

        backend.transport = "carrier-pigeon".to_string();
        assert!(TransportKind::from_config(&backend).is_err());
    }

    #[test]
    fn enabled_defaults_to_false() {
        let backend: BackendConfig = serde_json::from_value(serde_json::json!({
            "name": "fs",
            "type": "http",
            "config": {"url": "http://localhost:9000/mcp"}
        }))
        .expect("backend should parse");
        assert!(!backend.enabled);
        assert_eq!(
            require_url(&backend).as_deref(),
            Ok("http://localhost:9000/mcp")
        );
        assert!(require_stdio_command(&backend).is_err());
    }
}
