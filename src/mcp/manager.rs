//! Supervises the configured tool backends and keeps the registry
//! consistent with their connection state.
//!
//! Connection attempts run out of line: startup connects for enabled
//! backends are spawned with bounded concurrency so one slow backend never
//! delays the rest of the system, and a toggle schedules its connect
//! without blocking the caller. Nothing here retries automatically; a
//! failed backend stays failed until an explicit re-enable or test.

use crate::core::config::{BackendConfig, ToolSettings};
use crate::mcp::error::TransportError;
use crate::mcp::events::BackendNotification;
use crate::mcp::registry::ToolRegistry;
use crate::mcp::transport::{self, ToolTransport};
use futures_util::{stream, StreamExt};
use rust_mcp_schema::{CallToolResult, Tool};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Connection lifecycle of one backend handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Disconnected => "disconnected",
            BackendStatus::Connecting => "connecting",
            BackendStatus::Ready => "ready",
            BackendStatus::Failed => "failed",
        }
    }
}

struct BackendHandle {
    config: BackendConfig,
    enabled: bool,
    status: BackendStatus,
    last_error: Option<String>,
    adapter: Option<Arc<dyn ToolTransport>>,
    tools: Vec<Tool>,
}

impl BackendHandle {
    fn new(config: BackendConfig) -> Self {
        let enabled = config.enabled;
        Self {
            config,
            enabled,
            status: BackendStatus::Disconnected,
            last_error: None,
            adapter: None,
            tools: Vec::new(),
        }
    }
}

/// Read-only backend snapshot for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct BackendView {
    pub name: String,
    #[serde(rename = "type")]
    pub transport: String,
    pub enabled: bool,
    pub status: &'static str,
    pub description: Option<String>,
    pub last_error: Option<String>,
    pub tool_count: usize,
}

pub struct ConnectionManager {
    backends: Mutex<HashMap<String, BackendHandle>>,
    /// Configured order; registry merges follow it so collision outcomes
    /// are stable and user-controlled rather than map-iteration artifacts.
    order: Vec<String>,
    registry: ToolRegistry,
    settings: ToolSettings,
    events: std::sync::Mutex<Option<mpsc::UnboundedSender<BackendNotification>>>,
}

impl ConnectionManager {
    pub fn new(configs: Vec<BackendConfig>, settings: ToolSettings) -> Self {
        let order: Vec<String> = configs
            .iter()
            .map(|config| config.name.to_ascii_lowercase())
            .collect();
        let backends = configs
            .into_iter()
            .map(|config| (config.name.to_ascii_lowercase(), BackendHandle::new(config)))
            .collect();
        Self {
            backends: Mutex::new(backends),
            order,
            registry: ToolRegistry::new(),
            settings,
            events: std::sync::Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Receiver for unsolicited push messages from socket backends. Must be
    /// called before connecting for the subscription to take effect, since
    /// adapters capture the sender when they are built.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BackendNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().expect("event sender lock poisoned") = Some(tx);
        rx
    }

    fn event_sender(&self) -> Option<mpsc::UnboundedSender<BackendNotification>> {
        self.events.lock().expect("event sender lock poisoned").clone()
    }

    /// Kicks off connection attempts for every enabled backend without
    /// blocking the caller.
    pub fn spawn_connect_enabled(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.connect_enabled().await;
        });
    }

    /// Connects every enabled backend with bounded concurrency and waits
    /// for all attempts to settle.
    pub async fn connect_enabled(&self) {
        let enabled: Vec<String> = {
            let backends = self.backends.lock().await;
            self.order
                .iter()
                .filter(|name| backends.get(*name).is_some_and(|handle| handle.enabled))
                .cloned()
                .collect()
        };

        stream::iter(enabled)
            .map(|name| async move {
                self.connect_backend(&name).await;
            })
            .buffer_unordered(self.settings.startup_concurrency)
            .collect::<Vec<_>>()
            .await;
    }

    /// Runs one connect attempt for the named backend: handshake, tool
    /// discovery, registry merge. Failures mark the handle failed and are
    /// not retried.
    pub async fn connect_backend(&self, name: &str) {
        let key = name.to_ascii_lowercase();
        let config = {
            let mut backends = self.backends.lock().await;
            let Some(handle) = backends.get_mut(&key) else {
                return;
            };
            if !handle.enabled {
                return;
            }
            handle.status = BackendStatus::Connecting;
            handle.last_error = None;
            handle.config.clone()
        };

        let connected = transport::connect(&config, &self.settings, self.event_sender()).await;

        match connected {
            Ok(adapter) => {
                let tools = match transport::list_all_tools(adapter.as_ref()).await {
                    Ok(tools) => tools,
                    Err(err) => {
                        adapter.close().await;
                        self.record_failure(&key, err.to_string()).await;
                        return;
                    }
                };

                let mut backends = self.backends.lock().await;
                let Some(handle) = backends.get_mut(&key) else {
                    return;
                };
                if !handle.enabled {
                    // Toggled off while the connect was in flight.
                    drop(backends);
                    adapter.close().await;
                    return;
                }
                info!(
                    backend = %config.name,
                    tools = tools.len(),
                    "Backend connected"
                );
                handle.adapter = Some(adapter);
                handle.tools = tools;
                handle.status = BackendStatus::Ready;
                handle.last_error = None;
                self.rebuild_registry(&backends);
            }
            Err(err) => {
                warn!(backend = %config.name, error = %err, "Backend connection failed");
                self.record_failure(&key, err.to_string()).await;
            }
        }
    }

    async fn record_failure(&self, key: &str, message: String) {
        let mut backends = self.backends.lock().await;
        if let Some(handle) = backends.get_mut(key) {
            handle.status = BackendStatus::Failed;
            handle.last_error = Some(message);
            handle.adapter = None;
            handle.tools.clear();
            self.rebuild_registry(&backends);
        }
    }

    /// Rebuilds the registry from every ready handle, in configured order.
    /// Callers hold the backend lock so the merge sees a consistent state.
    fn rebuild_registry(&self, backends: &HashMap<String, BackendHandle>) {
        let entries: Vec<(&str, &[Tool])> = self
            .order
            .iter()
            .filter_map(|name| backends.get(name))
            .filter(|handle| handle.status == BackendStatus::Ready)
            .map(|handle| (handle.config.name.as_str(), handle.tools.as_slice()))
            .collect();
        self.registry.rebuild(entries);
    }

    /// Flips a backend's enabled flag. The flip is runtime-only and is not
    /// written back to configuration, so it does not survive a restart.
    pub async fn toggle(self: &Arc<Self>, name: &str) -> Result<bool, String> {
        let key = name.to_ascii_lowercase();
        let target = {
            let backends = self.backends.lock().await;
            let Some(handle) = backends.get(&key) else {
                return Err(format!("Unknown backend: {name}"));
            };
            !handle.enabled
        };
        self.set_enabled(name, target).await
    }

    /// Sets a backend's enabled flag. Enabling schedules a connect attempt
    /// without blocking; disabling closes the adapter and withdraws its
    /// tools. Setting the flag to its current value is a no-op, so
    /// disabling twice equals disabling once.
    pub async fn set_enabled(self: &Arc<Self>, name: &str, enabled: bool) -> Result<bool, String> {
        let key = name.to_ascii_lowercase();
        let (changed, closing) = {
            let mut backends = self.backends.lock().await;
            let Some(handle) = backends.get_mut(&key) else {
                return Err(format!("Unknown backend: {name}"));
            };
            if handle.enabled == enabled {
                return Ok(enabled);
            }
            handle.enabled = enabled;
            let closing = if enabled {
                None
            } else {
                handle.status = BackendStatus::Disconnected;
                handle.last_error = None;
                handle.tools.clear();
                let adapter = handle.adapter.take();
                self.rebuild_registry(&backends);
                adapter
            };
            (true, closing)
        };

        if let Some(adapter) = closing {
            tokio::spawn(async move {
                adapter.close().await;
            });
        }
        if changed && enabled {
            let manager = Arc::clone(self);
            let key = key.clone();
            tokio::spawn(async move {
                manager.connect_backend(&key).await;
            });
        }
        debug!(backend = %name, enabled, "Backend toggled");
        Ok(enabled)
    }

    /// Probes a backend out of band: a fresh connection, handshake, and
    /// health check that never touches the managed handle, so a disabled or
    /// failed backend can be tested without side effects.
    pub async fn test_connection(&self, name: &str) -> Result<(), TransportError> {
        let config = {
            let backends = self.backends.lock().await;
            let Some(handle) = backends.get(&name.to_ascii_lowercase()) else {
                return Err(TransportError::unavailable(name, "unknown backend"));
            };
            handle.config.clone()
        };

        let adapter = transport::connect(&config, &self.settings, None).await?;
        let health = adapter.health_check().await;
        adapter.close().await;
        health
    }

    /// Current backend descriptors and statuses. Never performs I/O.
    pub async fn list_backends(&self) -> Vec<BackendView> {
        let backends = self.backends.lock().await;
        self.order
            .iter()
            .filter_map(|name| backends.get(name))
            .map(|handle| BackendView {
                name: handle.config.name.clone(),
                transport: handle.config.transport.clone(),
                enabled: handle.enabled,
                status: handle.status.as_str(),
                description: handle.config.description.clone(),
                last_error: handle.last_error.clone(),
                tool_count: handle.tools.len(),
            })
            .collect()
    }

    /// Count of backends currently ready.
    pub async fn ready_count(&self) -> usize {
        let backends = self.backends.lock().await;
        backends
            .values()
            .filter(|handle| handle.status == BackendStatus::Ready)
            .count()
    }

    /// Dispatches a tool call to its owning backend. A dead transport marks
    /// the handle failed and withdraws its tools; the error is returned to
    /// the caller, which reports it to the model as a tool-level failure
    /// rather than aborting the turn.
    pub async fn invoke_tool(
        &self,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, TransportError> {
        let snapshot = self.registry.snapshot();
        let Some(registered) = snapshot.get(tool_name) else {
            return Err(TransportError::ToolNotFound {
                backend: "unregistered".to_string(),
                tool: tool_name.to_string(),
            });
        };
        let backend = registered.backend.clone();
        let key = backend.to_ascii_lowercase();

        let adapter = {
            let backends = self.backends.lock().await;
            backends
                .get(&key)
                .filter(|handle| handle.status == BackendStatus::Ready)
                .and_then(|handle| handle.adapter.clone())
        };
        let Some(adapter) = adapter else {
            return Err(TransportError::unavailable(&backend, "backend not connected"));
        };

        let result = adapter.invoke_tool(tool_name, arguments).await;
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(backend = %backend, tool = %tool_name, "Transport died mid-call");
                self.record_failure(&key, err.to_string()).await;
            }
        }
        result
    }
}

#[cfg(test)]
impl ConnectionManager {
    /// Installs a ready handle the way a successful connect would, so tests
    /// can exercise dispatch without a real backend process.
    pub(crate) async fn install_test_backend(
        &self,
        name: &str,
        tools: Vec<Tool>,
        adapter: Arc<dyn ToolTransport>,
    ) {
        let mut backends = self.backends.lock().await;
        let handle = backends
            .get_mut(&name.to_ascii_lowercase())
            .expect("backend configured");
        handle.enabled = true;
        handle.status = BackendStatus::Ready;
        handle.adapter = Some(adapter);
        handle.tools = tools;
        self.rebuild_registry(&backends);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::MAX_TOOL_LIST;
    use crate::utils::test_utils::{
        backend_config, sample_tool as tool, FakeBehavior, FakeTransport,
    };

    /// Installs a ready fake handle the way a successful connect would.
    async fn install_ready(
        manager: &ConnectionManager,
        name: &str,
        tools: Vec<Tool>,
        fail_fatally: bool,
    ) {
        let behavior = if fail_fatally {
            FakeBehavior::DropConnection
        } else {
            FakeBehavior::Succeed
        };
        let adapter = Arc::new(FakeTransport::new(name, tools.clone(), behavior));
        manager.install_test_backend(name, tools, adapter).await;
    }

    #[tokio::test]
    async fn disabled_backends_are_not_connected_at_startup() {
        let manager = ConnectionManager::new(
            vec![backend_config("calc", false)],
            ToolSettings::default(),
        );
        manager.connect_enabled().await;

        let views = manager.list_backends().await;
        assert_eq!(views[0].status, "disconnected");
        assert!(views[0].last_error.is_none());
    }

    #[tokio::test]
    async fn failed_handshake_marks_backend_failed_and_registry_empty() {
        let manager = ConnectionManager::new(
            vec![backend_config("github", true)],
            ToolSettings {
                connect_timeout_secs: 2,
                ..ToolSettings::default()
            },
        );
        manager.connect_enabled().await;

        let views = manager.list_backends().await;
        assert_eq!(views[0].status, "failed");
        assert!(views[0].last_error.is_some());
        assert!(manager.registry().snapshot().is_empty());
    }

    #[tokio::test]
    async fn ready_backends_merge_into_registry() {
        let manager = ConnectionManager::new(
            vec![backend_config("calc", true), backend_config("fs", true)],
            ToolSettings::default(),
        );
        install_ready(&manager, "calc", vec![tool("add"), tool("multiply")], false).await;
        install_ready(&manager, "fs", vec![tool("read_file")], false).await;

        let snapshot = manager.registry().snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get("add").map(|t| t.backend.as_str()), Some("calc"));
        assert_eq!(
            snapshot.get("read_file").map(|t| t.backend.as_str()),
            Some("fs")
        );
    }

    #[tokio::test]
    async fn disabling_removes_exactly_its_tools() {
        let manager = Arc::new(ConnectionManager::new(
            vec![backend_config("calc", true), backend_config("fs", true)],
            ToolSettings::default(),
        ));
        install_ready(&manager, "calc", vec![tool("add")], false).await;
        install_ready(&manager, "fs", vec![tool("read_file")], false).await;

        let enabled = manager.toggle("calc").await.expect("toggle should succeed");
        assert!(!enabled);

        let snapshot = manager.registry().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("add").is_none());
        assert!(snapshot.get("read_file").is_some());
    }

    #[tokio::test]
    async fn double_disable_is_idempotent() {
        let manager = Arc::new(ConnectionManager::new(
            vec![backend_config("calc", true)],
            ToolSettings::default(),
        ));
        install_ready(&manager, "calc", vec![tool("add")], false).await;

        manager
            .set_enabled("calc", false)
            .await
            .expect("first disable");
        let first = manager.list_backends().await;
        manager
            .set_enabled("calc", false)
            .await
            .expect("second disable");
        let second = manager.list_backends().await;

        assert!(!first[0].enabled);
        assert_eq!(first[0].status, "disconnected");
        assert!(!second[0].enabled);
        assert_eq!(second[0].status, "disconnected");
        assert_eq!(first[0].tool_count, second[0].tool_count);
        assert!(manager.registry().snapshot().is_empty());
    }

    #[tokio::test]
    async fn unknown_backend_toggle_errors() {
        let manager = Arc::new(ConnectionManager::new(Vec::new(), ToolSettings::default()));
        assert!(manager.toggle("ghost").await.is_err());
    }

    #[tokio::test]
    async fn fatal_invoke_error_withdraws_backend_tools() {
        let manager = ConnectionManager::new(
            vec![backend_config("calc", true), backend_config("fs", true)],
            ToolSettings::default(),
        );
        install_ready(&manager, "calc", vec![tool("add")], true).await;
        install_ready(&manager, "fs", vec![tool("read_file")], false).await;

        let err = manager
            .invoke_tool("add", None)
            .await
            .expect_err("expected transport failure");
        assert!(err.is_fatal());

        let views = manager.list_backends().await;
        let calc = views.iter().find(|v| v.name == "calc").expect("calc view");
        assert_eq!(calc.status, "failed");

        let snapshot = manager.registry().snapshot();
        assert!(snapshot.get("add").is_none());
        assert!(snapshot.get("read_file").is_some());

        // The surviving backend still serves calls.
        assert!(manager.invoke_tool("read_file", None).await.is_ok());
    }

    #[tokio::test]
    async fn invoking_unknown_tool_reports_tool_not_found() {
        let manager = ConnectionManager::new(
            vec![backend_config("calc", true)],
            ToolSettings::default(),
        );
        install_ready(&manager, "calc", vec![tool("add")], false).await;

        let err = manager
            .invoke_tool("launch_missiles", None)
            .await
            .expect_err("expected unknown tool");
        assert!(matches!(err, TransportError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn registry_collision_respects_configured_order() {
        let manager = ConnectionManager::new(
            vec![backend_config("alpha", true), backend_config("beta", true)],
            ToolSettings::default(),
        );
        install_ready(&manager, "alpha", vec![tool("search")], false).await;
        install_ready(&manager, "beta", vec![tool("search")], false).await;

        let snapshot = manager.registry().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.get("search").map(|t| t.backend.as_str()),
            Some("beta")
        );
    }

    #[test]
    fn max_tool_list_guards_pagination() {
        assert!(MAX_TOOL_LIST >= 100);
    }
}
