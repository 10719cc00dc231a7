//! Subprocess transport: one locally spawned tool server per backend,
//! speaking line-delimited JSON-RPC over the child's standard pipes.

use crate::core::config::{require_stdio_command, stdio_args, BackendConfig, ToolSettings};
use crate::mcp::error::TransportError;
use crate::mcp::protocol;
use crate::mcp::transport::{RequestFailure, ToolTransport};
use async_trait::async_trait;
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
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const STDIO_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

pub struct StdioTransport {
    backend: String,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    known_tools: RwLock<HashSet<String>>,
    invoke_timeout: Duration,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
}

impl StdioTransport {
    /// Launches the configured command and completes the protocol handshake
    /// within the connect timeout. The child's environment is the process
    /// environment with the backend's `env` entries merged on top.
    pub async fn connect(
        config: &BackendConfig,
        settings: &ToolSettings,
        invoke_timeout: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let backend = config.name.clone();
        let command = require_stdio_command(config)
            .map_err(|reason| TransportError::unavailable(&backend, reason))?;
        let args = stdio_args(config);
        debug!(backend = %backend, command = %command, args = ?args, "Starting stdio backend");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(config.env.clone())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| TransportError::unavailable(&backend, err.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::unavailable(&backend, "unable to retrieve stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::unavailable(&backend, "unable to retrieve stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::unavailable(&backend, "unable to retrieve stderr"))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let transport = Arc::new(Self {
            backend: backend.clone(),
            stdin: Mutex::new(stdin),
            pending: pending.clone(),
            next_request_id: AtomicI64::new(0),
            known_tools: RwLock::new(HashSet::new()),
            invoke_timeout,
            handshake_timeout: Duration::from_secs(settings.connect_timeout_secs),
            shutdown: shutdown.clone(),
        });

        Self::spawn_stdout_reader(pending.clone(), stdout, backend.clone());
        Self::spawn_stderr_drain(stderr);

        // Supervises the child: a close() cancels the token and kills the
        // process; either way the pending map is cleared so waiters observe
        // a closed transport instead of hanging.
        let supervisor_pending = pending.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.wait() => {}
                _ = shutdown.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
            supervisor_pending.lock().await.clear();
        });

        if let Err(err) = transport.handshake().await {
            transport.close().await;
            return Err(err);
        }

        Ok(transport)
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
        debug!(backend = %self.backend, "Stdio backend handshake complete");
        Ok(())
    }

    fn spawn_stdout_reader(pending: PendingMap, stdout: tokio::process::ChildStdout, backend: String) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let Ok(message) = serde_json::from_str::<ServerMessage>(&line) else {
                    continue;
                };
                match &message {
                    ServerMessage::Response(response) => {
                        if let Some(tx) = pending.lock().await.remove(&response.id) {
                            let _ = tx.send(message);
                        }
                    }
                    ServerMessage::Error(error) => {
                        if let Some(id) = error.id.as_ref() {
                            if let Some(tx) = pending.lock().await.remove(id) {
                                let _ = tx.send(message);
                            }
                        }
                    }
                    other => {
                        debug!(backend = %backend, message = ?other, "Ignoring unsolicited stdio message");
                    }
                }
            }
        });
    }

    fn spawn_stderr_drain(stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(_)) = reader.next_line().await {}
        });
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn write_payload(&self, payload: &str) -> Result<(), RequestFailure> {
        let mut stdin =
            match tokio::time::timeout(STDIO_WRITE_TIMEOUT, self.stdin.lock()).await {
                Ok(stdin) => stdin,
                Err(_) => return Err(RequestFailure::Other("stdin lock timed out".to_string())),
            };
        let write = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        match tokio::time::timeout(STDIO_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RequestFailure::Closed),
            Err(_) => Err(RequestFailure::Other("stdin write timed out".to_string())),
        }
    }

    async fn send_request(
        &self,
        request: RequestFromClient,
        deadline: Duration,
    ) -> Result<ServerMessage, RequestFailure> {
        let request_id = self.next_request_id();
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| RequestFailure::Other(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| RequestFailure::Other(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(failure) = self.write_payload(&payload).await {
            self.pending.lock().await.remove(&request_id);
            return Err(failure);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(message)) => Ok(message),
            // The supervisor cleared the pending map: the process is gone.
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
        self.write_payload(&payload).await
    }
}

#[async_trait]
impl ToolTransport for StdioTransport {
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
    }
}
