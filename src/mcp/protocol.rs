//! Tool-protocol payload helpers shared by all transports.

use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    CallToolResult, ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    ListToolsResult, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde_json::Value;

/// Handshake parameters identifying this client to a backend.
pub fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "palaver".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Palaver Tool Client".to_string()),
            description: Some("Palaver tool-transport runtime".to_string()),
            icons: Vec::new(),
            website_url: Some("https://github.com/permacommons/palaver".to_string()),
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

pub fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, String> {
    let value = parse_response_value(message)?;
    let result =
        serde_json::from_value::<InitializeResult>(value).map_err(|err| err.to_string())?;
    if result.protocol_version.trim().is_empty() {
        return Err("Unexpected initialize response.".to_string());
    }
    Ok(result)
}

pub fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, String> {
    parse_response(message)
}

pub fn parse_call_tool(message: ServerMessage) -> Result<CallToolResult, String> {
    parse_response(message)
}

fn parse_response<T: serde::de::DeserializeOwned>(message: ServerMessage) -> Result<T, String> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| err.to_string())
}

pub fn parse_response_value(message: ServerMessage) -> Result<Value, String> {
    match message {
        ServerMessage::Response(response) => {
            serde_json::to_value(&response.result).map_err(|err| err.to_string())
        }
        ServerMessage::Error(error) => Err(format_rpc_error(&error.error)),
        other => Err(format!("Unexpected server message: {other:?}")),
    }
}

pub fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("RPC error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()));
        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}

/// Flatten a tool-call result into the text handed back to the model as
/// tool output.
pub fn render_call_result(result: &CallToolResult) -> String {
    serde_json::to_string_pretty(result)
        .unwrap_or_else(|_| "Unable to serialize tool result.".to_string())
}
