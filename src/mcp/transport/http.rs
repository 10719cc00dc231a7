//! HTTP event-stream transport: JSON-RPC over POST, with replies arriving
//! either as plain JSON bodies or as server-sent event streams.
//!
//! Replies on an event stream are correlated by request id because the
//! backend does not guarantee that concurrent invocations answer in call
//! order.

use crate::core::config::{http_headers, require_url, BackendConfig, ToolSettings};
use crate::mcp::error::TransportError;
use crate::mcp::protocol;
use crate::mcp::transport::{RequestFailure, ToolTransport};
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, ListToolsResult, PaginatedRequestParams, RequestId,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

const JSON_CONTENT_TYPE: &str = "application/json";
const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const SESSION_ID_HEADER: &str = "mcp-session-id";
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Splits raw SSE bytes into trimmed lines, carrying partial lines across
/// chunk boundaries.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line_bytes = &self.buffer[search_index..line_end];
            if let Ok(text) = std::str::from_utf8(line_bytes) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Reads an event stream until the reply matching `request_id` arrives,
/// skipping interleaved replies addressed to other in-flight requests.
async fn next_matching_sse_message(
    response: reqwest::Response,
    request_id: &RequestId,
) -> Result<ServerMessage, RequestFailure> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|_| RequestFailure::Closed)?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line)? {
                if message_matches(&message, request_id) {
                    return Ok(message);
                }
            }
        }
    }

    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line)? {
            if message_matches(&message, request_id) {
                return Ok(message);
            }
        }
    }

    Err(RequestFailure::Other(
        "event stream ended without a matching reply".to_string(),
    ))
}

fn decode_sse_line(line: &str) -> Result<Option<ServerMessage>, RequestFailure> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };
    if payload.is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<ServerMessage>(payload)
        .map(Some)
        .map_err(|err| RequestFailure::Other(err.to_string()))
}

fn message_matches(message: &ServerMessage, request_id: &RequestId) -> bool {
    match message {
        ServerMessage::Response(response) => &response.id == request_id,
        ServerMessage::Error(error) => error.id.as_ref() == Some(request_id),
        _ => false,
    }
}

pub struct HttpStreamTransport {
    backend: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    next_request_id: AtomicI64,
    known_tools: RwLock<HashSet<String>>,
    invoke_timeout: Duration,
    handshake_timeout: Duration,
}

impl HttpStreamTransport {
    /// Builds the pooled client and completes the protocol handshake within
    /// the connect timeout.
    pub async fn connect(
        config: &BackendConfig,
        settings: &ToolSettings,
        invoke_timeout: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let backend = config.name.clone();
        let url = require_url(config)
            .map_err(|reason| TransportError::unavailable(&backend, reason))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|err| TransportError::unavailable(&backend, err.to_string()))?;

        let transport = Arc::new(Self {
            backend: backend.clone(),
            url,
            headers: http_headers(config),
            client,
            session_id: Mutex::new(None),
            next_request_id: AtomicI64::new(0),
            known_tools: RwLock::new(HashSet::new()),
            invoke_timeout,
            handshake_timeout: Duration::from_secs(settings.connect_timeout_secs),
        });

        transport.handshake().await?;
        Ok(transport)
    }

    async fn handshake(&self) -> Result<(), TransportError> {
        let request = RequestFromClient::InitializeRequest(protocol::client_details());
        let response = tokio::time::timeout(self.handshake_timeout, self.send_request(request))
            .await
            .map_err(|_| TransportError::unavailable(&self.backend, "handshake timed out"))?
            .map_err(|failure| match failure {
                RequestFailure::Closed => {
                    TransportError::unavailable(&self.backend, "connection failed")
                }
                RequestFailure::TimedOut => {
                    TransportError::unavailable(&self.backend, "handshake timed out")
                }
                RequestFailure::Other(message) => {
                    TransportError::unavailable(&self.backend, message)
                }
            })?;
        protocol::parse_initialize_result(response)
            .map_err(|err| TransportError::unavailable(&self.backend, err))?;

        self.send_notification(NotificationFromClient::InitializedNotification(None))
            .await
            .map_err(|failure| failure.into_backend_error(&self.backend))?;
        debug!(backend = %self.backend, url = %self.url, "HTTP backend handshake complete");
        Ok(())
    }

    async fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = request
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("Accept", JSON_AND_SSE_ACCEPT);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(session_id) = self.session_id.lock().await.clone() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        request
    }

    async fn capture_session_id(&self, response: &reqwest::Response) {
        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self.session_id.lock().await = Some(session_id.to_string());
        }
    }

    async fn send_request(
        &self,
        request: RequestFromClient,
    ) -> Result<ServerMessage, RequestFailure> {
        let request_id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| RequestFailure::Other(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| RequestFailure::Other(err.to_string()))?;

        let request = self.apply_headers(self.client.post(&self.url)).await;
        let response = request
            .body(payload)
            .send()
            .await
            .map_err(|_| RequestFailure::Closed)?;
        if !response.status().is_success() {
            return Err(RequestFailure::Other(format!(
                "HTTP error: {}",
                response.status()
            )));
        }
        self.capture_session_id(&response).await;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            next_matching_sse_message(response, &request_id).await
        } else {
            let body = response
                .bytes()
                .await
                .map_err(|_| RequestFailure::Closed)?;
            serde_json::from_slice::<ServerMessage>(&body)
                .map_err(|err| RequestFailure::Other(err.to_string()))
        }
    }

    async fn send_notification(
        &self,
        notification: NotificationFromClient,
    ) -> Result<(), RequestFailure> {
        let message =
            ClientMessage::from_message(MessageFromClient::NotificationFromClient(notification), None)
                .map_err(|err| RequestFailure::Other(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| RequestFailure::Other(err.to_string()))?;

        let request = self.apply_headers(self.client.post(&self.url)).await;
        let response = request
            .body(payload)
            .send()
            .await
            .map_err(|_| RequestFailure::Closed)?;
        if !response.status().is_success() {
            return Err(RequestFailure::Other(format!(
                "HTTP error: {}",
                response.status()
            )));
        }
        self.capture_session_id(&response).await;
        Ok(())
    }

    async fn send_with_deadline(
        &self,
        request: RequestFromClient,
        deadline: Duration,
    ) -> Result<ServerMessage, RequestFailure> {
        match tokio::time::timeout(deadline, self.send_request(request)).await {
            Ok(result) => result,
            Err(_) => Err(RequestFailure::TimedOut),
        }
    }
}

#[async_trait]
impl ToolTransport for HttpStreamTransport {
    fn backend(&self) -> &str {
        &self.backend
    }

    async fn list_tools_page(
        &self,
        cursor: Option<String>,
    ) -> Result<ListToolsResult, TransportError> {
        let fresh_listing = cursor.is_none();
        let params = cursor.map(|cursor| PaginatedRequestParams {
            cursor: Some(cursor),
            meta: None,
        });
        let response = self
            .send_with_deadline(RequestFromClient::ListToolsRequest(params), self.invoke_timeout)
            .await
            .map_err(|failure| failure.into_backend_error(&self.backend))?;
        let list = protocol::parse_list_tools(response)
            .map_err(|err| TransportError::backend(&self.backend, err))?;

        let mut known = self.known_tools.write().await;
        if fresh_listing {
            known.clear();
        }
        known.extend(list.tools.iter().map(|tool| tool.name.clone()));
        Ok(list)
    }

    async fn invoke_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, TransportError> {
        {
            let known = self.known_tools.read().await;
            if !known.is_empty() && !known.contains(name) {
                return Err(TransportError::ToolNotFound {
                    backend: self.backend.clone(),
                    tool: name.to_string(),
                });
            }
        }

        let mut params = CallToolRequestParams::new(name);
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        let response = self
            .send_with_deadline(RequestFromClient::CallToolRequest(params), self.invoke_timeout)
            .await
            .map_err(|failure| {
                failure.into_invoke_error(&self.backend, name, self.invoke_timeout.as_secs())
            })?;
        protocol::parse_call_tool(response)
            .map_err(|err| TransportError::backend(&self.backend, err))
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        self.send_with_deadline(RequestFromClient::PingRequest(None), self.handshake_timeout)
            .await
            .map(|_| ())
            .map_err(|failure| failure.into_backend_error(&self.backend))
    }

    async fn close(&self) {
        // Connection pooling belongs to reqwest; dropping the last Arc
        // releases the idle connections.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_buffer_handles_chunk_boundaries() {
        let mut buffer = SseLineBuffer::default();
        assert_eq!(buffer.push(b"data: one\n\n"), vec!["data: one"]);
        assert_eq!(buffer.push(b"data: t"), Vec::<String>::new());
        assert_eq!(buffer.push(b"wo\n"), vec!["data: two"]);
        assert_eq!(buffer.finish(), Vec::<String>::new());
    }

    #[test]
    fn detects_event_stream_content_type() {
        assert!(is_event_stream_content_type("text/event-stream"));
        assert!(is_event_stream_content_type(
            "Text/Event-Stream; charset=UTF-8"
        ));
        assert!(!is_event_stream_content_type("application/json"));
    }

    #[test]
    fn extracts_sse_payload() {
        assert_eq!(sse_data_payload("data: {\"id\":1}"), Some("{\"id\":1}"));
        assert_eq!(sse_data_payload("event: ping"), None);
    }

    #[test]
    fn matching_skips_replies_for_other_requests() {
        let wanted = RequestId::Integer(7);
        let other: ServerMessage = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {"ok": true}
        }))
        .expect("message should parse");
        let mine: ServerMessage = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 7,
            "result": {"ok": true}
        }))
        .expect("message should parse");

        assert!(!message_matches(&other, &wanted));
        assert!(message_matches(&mine, &wanted));
    }
}
