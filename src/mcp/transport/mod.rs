//! Transport adapters for tool backends.
//!
//! Three connection kinds share one capability contract; callers hold an
//! `Arc<dyn ToolTransport>` and never branch on which variant is behind it.
//! Each adapter owns exactly one physical connection, synchronizes
//! internally, and reports failures through [`TransportError`] without
//! retrying on its own.

use crate::core::config::{BackendConfig, ToolSettings, TransportKind};
use crate::mcp::error::TransportError;
use crate::mcp::events::BackendNotification;
use async_trait::async_trait;
use rust_mcp_schema::{CallToolResult, ListToolsResult, Tool};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod http;
pub mod socket;
pub mod stdio;

/// Upper bound on tools accepted from one backend across all list pages.
pub const MAX_TOOL_LIST: usize = 100;

#[async_trait]
pub trait ToolTransport: Send + Sync {
    fn backend(&self) -> &str;

    /// Fetch one page of the backend's tool listing. Passing `None` starts
    /// a fresh listing and resets the adapter's known-tool set.
    async fn list_tools_page(
        &self,
        cursor: Option<String>,
    ) -> Result<ListToolsResult, TransportError>;

    async fn invoke_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, TransportError>;

    /// Protocol-level ping confirming the backend still answers.
    async fn health_check(&self) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Opens a connection for the configured transport kind and completes the
/// protocol handshake within the settings' connect timeout. A handshake
/// failure reports [`TransportError::BackendUnavailable`] and is never
/// retried here.
pub async fn connect(
    config: &BackendConfig,
    settings: &ToolSettings,
    events: Option<mpsc::UnboundedSender<BackendNotification>>,
) -> Result<Arc<dyn ToolTransport>, TransportError> {
    let kind = TransportKind::from_config(config)
        .map_err(|reason| TransportError::unavailable(&config.name, reason))?;
    let invoke_timeout = invoke_timeout(config, settings);
    match kind {
        TransportKind::Stdio => {
            let transport =
                stdio::StdioTransport::connect(config, settings, invoke_timeout).await?;
            Ok(transport as Arc<dyn ToolTransport>)
        }
        TransportKind::HttpStream => {
            let transport =
                http::HttpStreamTransport::connect(config, settings, invoke_timeout).await?;
            Ok(transport as Arc<dyn ToolTransport>)
        }
        TransportKind::Socket => {
            let transport =
                socket::SocketTransport::connect(config, settings, invoke_timeout, events).await?;
            Ok(transport as Arc<dyn ToolTransport>)
        }
    }
}

/// Per-backend invocation deadline, falling back to the global default.
pub fn invoke_timeout(config: &BackendConfig, settings: &ToolSettings) -> std::time::Duration {
    std::time::Duration::from_secs(
        config
            .invoke_timeout_secs
            .unwrap_or(settings.invoke_timeout_secs),
    )
}

/// Drains every page of a backend's tool listing, capped at
/// [`MAX_TOOL_LIST`] entries.
pub async fn list_all_tools(
    transport: &dyn ToolTransport,
) -> Result<Vec<Tool>, TransportError> {
    let mut list = transport.list_tools_page(None).await?;
    let mut tools = std::mem::take(&mut list.tools);
    let mut next_cursor = list.next_cursor.take();

    while tools.len() < MAX_TOOL_LIST {
        let Some(cursor) = next_cursor.take() else {
            break;
        };
        let mut page = transport.list_tools_page(Some(cursor)).await?;
        tools.append(&mut page.tools);
        next_cursor = page.next_cursor.take();
    }
    tools.truncate(MAX_TOOL_LIST);
    Ok(tools)
}

/// Outcome of one request/response exchange, before the caller maps it to
/// an operation-specific [`TransportError`].
pub(crate) enum RequestFailure {
    TimedOut,
    Closed,
    Other(String),
}

impl RequestFailure {
    pub(crate) fn into_invoke_error(
        self,
        backend: &str,
        tool: &str,
        deadline_secs: u64,
    ) -> TransportError {
        match self {
            RequestFailure::TimedOut => TransportError::InvocationTimeout {
                tool: tool.to_string(),
                seconds: deadline_secs,
            },
            RequestFailure::Closed => TransportError::closed(backend),
            RequestFailure::Other(message) => TransportError::backend(backend, message),
        }
    }

    pub(crate) fn into_backend_error(self, backend: &str) -> TransportError {
        match self {
            RequestFailure::TimedOut => {
                TransportError::backend(backend, "request timed out".to_string())
            }
            RequestFailure::Closed => TransportError::closed(backend),
            RequestFailure::Other(message) => TransportError::backend(backend, message),
        }
    }
}
