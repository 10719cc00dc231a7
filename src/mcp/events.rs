use rust_mcp_schema::schema_utils::ServerJsonrpcNotification;

/// Unsolicited push message from a socket backend, surfaced on the
/// connection manager's event channel rather than through `invoke_tool`.
#[derive(Debug, Clone)]
pub struct BackendNotification {
    pub backend: String,
    pub notification: ServerJsonrpcNotification,
}
