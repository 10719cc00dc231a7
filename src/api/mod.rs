//! Wire payloads for the inference engine.
//!
//! The engine speaks the OpenAI-compatible chat completions surface for
//! generation and its native endpoints (`/api/tags`, `/api/generate`) for
//! model management. Request types serialize, response types deserialize;
//! nothing here performs I/O.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

#[derive(Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatToolDefinition>>,
}

#[derive(Deserialize)]
pub struct ChatResponseDelta {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChatToolCallDelta>>,
}

#[derive(Deserialize)]
pub struct ChatResponseChoice {
    pub delta: ChatResponseDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatResponseChoice>,
}

/// Streaming fragment of a tool call; the engine may split the id, name,
/// and argument text across several deltas sharing one index.
#[derive(Deserialize)]
pub struct ChatToolCallDelta {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub function: Option<ChatToolCallFunctionDelta>,
}

#[derive(Deserialize)]
pub struct ChatToolCallFunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Serialize, Clone)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatToolCallFunction,
}

#[derive(Serialize, Clone)]
pub struct ChatToolCallFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Serialize, Clone)]
pub struct ChatToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatToolFunction,
}

#[derive(Serialize, Clone)]
pub struct ChatToolFunction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

/// One installed model as reported by the engine's `/api/tags` listing.
#[derive(Deserialize, Serialize, Clone)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_omits_absent_tools() {
        let request = ChatRequest {
            model: "llama3.2".to_string(),
            messages: vec![ChatMessage::text("user", "hi")],
            stream: true,
            tools: None,
        };
        let json = serde_json::to_string(&request).expect("request should serialize");
        assert!(!json.contains("\"tools\""));
        assert!(!json.contains("tool_call_id"));
    }

    #[test]
    fn tool_call_delta_tolerates_partial_fragments() {
        let delta: ChatToolCallDelta =
            serde_json::from_str(r#"{"index":0,"function":{"arguments":"{\"a\":"}}"#)
                .expect("delta should parse");
        assert_eq!(delta.index, Some(0));
        assert!(delta.id.is_none());
        let function = delta.function.expect("function fragment");
        assert!(function.name.is_none());
        assert_eq!(function.arguments.as_deref(), Some("{\"a\":"));
    }

    #[test]
    fn tags_response_defaults_to_empty() {
        let tags: TagsResponse = serde_json::from_str("{}").expect("tags should parse");
        assert!(tags.models.is_empty());
    }
}
