//! Persistent-socket transport: one full-duplex WebSocket connection per
//! backend. Unlike the other variants the backend may push unsolicited
//! notifications at any time; those are forwarded on a secondary event
//! channel instead of being pulled through `invoke_tool`.

use crate::core::config::{require_url, BackendConfig, ToolSettings};
use crate::mcp::error::TransportError;
use crate::mcp::events::BackendNotification;
use crate::mcp::protocol;
use crate::mcp::transport::{RequestFailure, ToolTransport};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
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
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

pub struct SocketTransport {
    backend: String,
    sink: Mutex<WsSink>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    known_tools: RwLock<HashSet<String>>,
    invoke_timeout: Duration,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
}

impl SocketTransport {
    /// Opens the WebSocket and completes the protocol handshake within the
    /// connect timeout.
    pub async fn connect(
        config: &BackendConfig,
        settings: &ToolSettings,
        invoke_timeout: Duration,
        events: Option<mpsc::UnboundedSender<BackendNotification>>,
    ) -> Result<Arc<Self>, TransportError> {
        let backend = config.name.clone();
        let url = require_url(config)
            .map_err(|reason| TransportError::unavailable(&backend, reason))?;
        let handshake_timeout = Duration::from_secs(settings.connect_timeout_secs);

        debug!(backend = %backend, url = %url, "Opening socket backend");
        let (ws_stream, _response) =
            tokio::time::timeout(handshake_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::unavailable(&backend, "socket connect timed out"))?
            .map_err(|err| TransportError::unavailable(&backend, err.to_string()))?;
        let (sink, stream) = ws_stream.split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let transport = Arc::new(Self {
            backend: backend.clone(),
            sink: Mutex::new(sink),
            pending: pending.clone(),
            next_request_id: AtomicI64::new(0),
            known_tools: RwLock::new(HashSet::new()),
            invoke_timeout,
            handshake_timeout,
            shutdown: shutdown.clone(),
        });

        Self::spawn_reader(pending, stream, backend, events, shutdown);

        if let Err(err) = transport.handshake().await {
            transport.close().await;
            return Err(err);
        }
        Ok(transport)
    }

    fn spawn_reader(
        pending: PendingMap,
        mut stream: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        backend: String,
        events: Option<mpsc::UnboundedSender<BackendNotification>>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = stream.next() => message,
                };
                let Some(Ok(message)) = message else {
                    break;
                };
                match message {
                    Message::Text(text) => {
                        let Ok(server_message) = serde_json::from_str::<ServerMessage>(&text)
                        else {
                            continue;
                        };
                        match server_message {
                            ServerMessage::Response(ref response) => {
                                if let Some(tx) = pending.lock().await.remove(&response.id) {
                                    let _ = tx.send(server_message);
                                }
                            }
                            ServerMessage::Error(ref error) => {
                                if let Some(id) = error.id.clone() {
                                    if let Some(tx) = pending.lock().await.remove(&id) {
                                        let _ = tx.send(server_message);
                                    }
                                }
                            }
                            ServerMessage::Notification(notification) => {
                                debug!(backend = %backend, "Push notification from socket backend");
                                if let Some(tx) = events.as_ref() {
                                    let _ = tx.send(BackendNotification {
                                        backend: backend.clone(),
                                        notification,
                                    });
                                }
                            }
                            ServerMessage::Request(_) => {
                                debug!(backend = %backend, "Ignoring server-initiated request");
                            }
                        }
                    }
                    Message::Close(_) => break,
                    // Ping/pong and binary frames are not part of the tool
                    // protocol.
                    _ => {}
                }
            }
            pending.lock().await.clear();
        });
    }

    async fn handshake(&self) -> Result<(), TransportError> {
        let request = RequestFromClient::InitializeRequest(protocol::client_details());
        let response = self
            .send_request(request, self.handshake_timeout)
            .await
            .map_err(|failure| match failure {
                RequestFailure::TimedOut => {
                    TransportError::unavailable(&self.backend, "handshake timed out")
                }
                RequestFailure::Closed => TransportError::closed(&self.backend),
                RequestFailure::Other(message) => {
                    TransportError::unavailable(&self.backend, message)
                }
            })?;
        protocol::parse_initialize_result(response)
            .map_err(|err| TransportError::unavailable(&self.backend, err))?;
        self.send_notification(NotificationFromClient::InitializedNotification(None))
            .await
            .map_err(|failure| failure.into_backend_error(&self.backend))?;
        debug!(backend = %self.backend, "Socket backend handshake complete");
        Ok(())
    }

    async fn write_payload(&self, payload: String) -> Result<(), RequestFailure> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(payload.into()))
            .await
            .map_err(|_| RequestFailure::Closed)
    }

    async fn send_request(
        &self,
        request: RequestFromClient,
        deadline: Duration,
    ) -> Result<ServerMessage, RequestFailure> {
        let request_id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| RequestFailure::Other(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| RequestFailure::Other(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(failure) = self.write_payload(payload).await {
            self.pending.lock().await.remove(&request_id);
            return Err(failure);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(message)) => Ok(message),
            // The reader cleared the pending map: the socket is gone.
            Ok(Err(_)) => Err(RequestFailure::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(RequestFailure::TimedOut)
            }
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
        self.write_payload(payload).await
    }
}

#[async_trait]
impl ToolTransport for SocketTransport {
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
            .send_request(RequestFromClient::ListToolsRequest(params), self.invoke_timeout)
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
            .send_request(RequestFromClient::CallToolRequest(params), self.invoke_timeout)
            .await
            .map_err(|failure| {
                failure.into_invoke_error(&self.backend, name, self.invoke_timeout.as_secs())
            })?;
        protocol::parse_call_tool(response)
            .map_err(|err| TransportError::backend(&self.backend, err))
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        self.send_request(RequestFromClient::PingRequest(None), self.handshake_timeout)
            .await
            .map(|_| ())
            .map_err(|failure| failure.into_backend_error(&self.backend))
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
    }
}
