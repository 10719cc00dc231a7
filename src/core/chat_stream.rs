//! Low-level streaming against the engine's chat completions endpoint.
//!
//! The spawned task parses server-sent events incrementally and forwards
//! [`StreamMessage`]s over a channel. The sequence is finite and
//! non-restartable; it always ends with either [`StreamMessage::Done`]
//! (generation finished) or [`StreamMessage::Failed`] (transport or API
//! failure), so callers can tell a complete answer from a truncated one.

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;

use crate::api::{ChatMessage, ChatRequest, ChatResponse, ChatToolDefinition};
use crate::utils::url::construct_api_url;

#[derive(Clone, Debug)]
pub enum StreamMessage {
    Chunk(String),
    ToolCall(ToolCallDelta),
    /// Generation ended normally; `finish_reason` is the engine's last
    /// reported reason (`stop`, `tool_calls`, ...).
    Done { finish_reason: Option<String> },
    /// The stream died before the engine finished.
    Failed(String),
}

/// Fragment of a streamed tool call. The engine may deliver the id, the
/// name, and slices of the argument text in separate deltas that share an
/// index.
#[derive(Clone, Debug)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

pub struct StreamParams {
    pub client: reqwest::Client,
    pub base_url: String,
    pub model: String,
    pub api_messages: Vec<ChatMessage>,
    pub tools: Option<Vec<ChatToolDefinition>>,
    pub cancel_token: tokio_util::sync::CancellationToken,
}

#[derive(Default)]
struct SseParser {
    finish_reason: Option<String>,
}

impl SseParser {
    /// Processes one SSE line; returns true when the stream is complete.
    fn push_line(&mut self, line: &str, tx: &mpsc::UnboundedSender<StreamMessage>) -> bool {
        let Some(payload) = extract_data_payload(line) else {
            return false;
        };

        if payload == "[DONE]" {
            let _ = tx.send(StreamMessage::Done {
                finish_reason: self.finish_reason.take(),
            });
            return true;
        }

        match serde_json::from_str::<ChatResponse>(payload) {
            Ok(response) => {
                if let Some(choice) = response.choices.into_iter().next() {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            let _ = tx.send(StreamMessage::Chunk(content));
                        }
                    }
                    if let Some(tool_calls) = choice.delta.tool_calls {
                        for delta in tool_calls {
                            let _ = tx.send(StreamMessage::ToolCall(ToolCallDelta {
                                index: delta.index.unwrap_or(0),
                                id: delta.id,
                                name: delta.function.as_ref().and_then(|f| f.name.clone()),
                                arguments: delta
                                    .function
                                    .as_ref()
                                    .and_then(|f| f.arguments.clone()),
                            }));
                        }
                    }
                    if let Some(reason) = choice.finish_reason {
                        self.finish_reason = Some(reason);
                    }
                }
                false
            }
            Err(_) => {
                if payload.trim().is_empty() {
                    return false;
                }
                let _ = tx.send(StreamMessage::Failed(format_api_error(payload)));
                true
            }
        }
    }
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "Engine error: <empty response>".to_string();
    }
    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value) {
            if !summary.is_empty() {
                return format!("Engine error: {}", summary);
            }
        }
    }
    format!("Engine error: {}", trimmed)
}

/// Starts one generation request and returns the channel its messages
/// arrive on. Cancelling the token stops the task pulling further bytes
/// and releases the request; nothing is sent after cancellation.
pub fn spawn_stream(params: StreamParams) -> mpsc::UnboundedReceiver<StreamMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let StreamParams {
            client,
            base_url,
            model,
            api_messages,
            tools,
            cancel_token,
        } = params;

        let request = ChatRequest {
            model,
            messages: api_messages,
            stream: true,
            tools,
        };

        tokio::select! {
            _ = run_stream(&client, &base_url, request, &tx, &cancel_token) => {}
            _ = cancel_token.cancelled() => {}
        }
    });
    rx
}

async fn run_stream(
    client: &reqwest::Client,
    base_url: &str,
    request: ChatRequest,
    tx: &mpsc::UnboundedSender<StreamMessage>,
    cancel_token: &tokio_util::sync::CancellationToken,
) {
    let chat_url = construct_api_url(base_url, "v1/chat/completions");
    let response = match client
        .post(chat_url)
        .header("Content-Type", "application/json")
        .json(&request)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            let _ = tx.send(StreamMessage::Failed(format_api_error(&err.to_string())));
            return;
        }
    };

    if !response.status().is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        let _ = tx.send(StreamMessage::Failed(format_api_error(&error_text)));
        return;
    }

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut parser = SseParser::default();

    while let Some(chunk) = stream.next().await {
        if cancel_token.is_cancelled() {
            return;
        }
        let chunk_bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx.send(StreamMessage::Failed(format!(
                    "Engine stream interrupted: {err}"
                )));
                return;
            }
        };
        buffer.extend_from_slice(&chunk_bytes);

        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let line = match std::str::from_utf8(&buffer[..newline_pos]) {
                Ok(s) => s.trim().to_string(),
                Err(_) => {
                    buffer.drain(..=newline_pos);
                    continue;
                }
            };
            buffer.drain(..=newline_pos);
            if parser.push_line(&line, tx) {
                return;
            }
        }
    }

    // Stream ended without the [DONE] marker. A recorded finish reason
    // still counts as a normal ending; anything else is a truncation.
    if parser.finish_reason.is_some() {
        let _ = tx.send(StreamMessage::Done {
            finish_reason: parser.finish_reason.take(),
        });
    } else {
        let _ = tx.send(StreamMessage::Failed(
            "Engine stream ended before generation finished.".to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(lines: &[&str]) -> Vec<StreamMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut parser = SseParser::default();
        for line in lines {
            if parser.push_line(line, &tx) {
                break;
            }
        }
        drop(tx);
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[test]
    fn parses_text_deltas_and_done() {
        let messages = collect(&[
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data:{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "data: [DONE]",
        ]);

        assert_eq!(messages.len(), 3);
        assert!(matches!(&messages[0], StreamMessage::Chunk(c) if c == "Hel"));
        assert!(matches!(&messages[1], StreamMessage::Chunk(c) if c == "lo"));
        assert!(matches!(
            &messages[2],
            StreamMessage::Done { finish_reason: Some(reason) } if reason == "stop"
        ));
    }

    #[test]
    fn parses_tool_call_fragments() {
        let messages = collect(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call-1","function":{"name":"add","arguments":"{\"a\""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":1}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "data: [DONE]",
        ]);

        assert_eq!(messages.len(), 3);
        match &messages[0] {
            StreamMessage::ToolCall(delta) => {
                assert_eq!(delta.index, 0);
                assert_eq!(delta.id.as_deref(), Some("call-1"));
                assert_eq!(delta.name.as_deref(), Some("add"));
                assert_eq!(delta.arguments.as_deref(), Some("{\"a\""));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
        assert!(matches!(
            &messages[2],
            StreamMessage::Done { finish_reason: Some(reason) } if reason == "tool_calls"
        ));
    }

    #[test]
    fn api_error_payload_fails_the_stream() {
        let messages = collect(&[r#"data: {"error":{"message":"model not found"}}"#]);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            StreamMessage::Failed(text) if text == "Engine error: model not found"
        ));
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let messages = collect(&["event: ping", ": keepalive", ""]);
        assert!(messages.is_empty());
    }

    #[test]
    fn error_formatting_collapses_whitespace() {
        let formatted =
            format_api_error(r#"{"error":{"message":"model  \n overloaded"}}"#);
        assert_eq!(formatted, "Engine error: model overloaded");
        assert_eq!(format_api_error("plain failure"), "Engine error: plain failure");
    }
}
