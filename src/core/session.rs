//! Lazily initialized chat session composing the engine client with the
//! tool registry.
//!
//! Initialization is single-flight: the first caller performs the work
//! while concurrent callers await the same attempt through a watch
//! channel. A failed attempt resets the barrier so a later call can retry
//! from scratch; a successful one is terminal for the session's lifetime.
//! A session bound to a different model is a new session.

use crate::api::{ChatMessage, ChatToolCall, ChatToolCallFunction};
use crate::core::chat_stream::{spawn_stream, StreamMessage, StreamParams, ToolCallDelta};
use crate::core::constants::{MAX_TOOL_ROUNDS, PROMPT_TOOL_LIMIT};
use crate::core::engine::EngineClient;
use crate::core::message::{ChatTurn, TurnRole};
use crate::mcp::manager::ConnectionManager;
use crate::mcp::protocol::render_call_result;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Event stream produced by [`AgentSession::stream`]. Strictly ordered
/// within one call; independent calls are unrelated.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Chunk(String),
    /// First invocation of a tool name within the turn; deduplicated.
    ToolUsed(String),
    Completed,
    Error(String),
}

/// Reply assembled by the non-streaming [`AgentSession::chat`] call.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub tools_used: Vec<String>,
}

struct SessionContext {
    model: String,
    system_prompt: String,
}

type InitResult = Result<Arc<SessionContext>, String>;

enum InitState {
    Idle,
    Running(watch::Receiver<Option<InitResult>>),
    Ready(Arc<SessionContext>),
}

pub struct AgentSession {
    engine: Arc<EngineClient>,
    manager: Arc<ConnectionManager>,
    init: Mutex<InitState>,
    init_runs: AtomicUsize,
    history: Mutex<Vec<ChatTurn>>,
}

impl AgentSession {
    pub fn new(engine: Arc<EngineClient>, manager: Arc<ConnectionManager>) -> Self {
        Self {
            engine,
            manager,
            init: Mutex::new(InitState::Idle),
            init_runs: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    pub async fn is_initialized(&self) -> bool {
        matches!(*self.init.lock().await, InitState::Ready(_))
    }

    /// Append-only transcript of completed turns.
    pub async fn history(&self) -> Vec<ChatTurn> {
        self.history.lock().await.clone()
    }

    #[cfg(test)]
    pub(crate) fn init_runs(&self) -> usize {
        self.init_runs.load(Ordering::SeqCst)
    }

    /// First caller runs the initialization; everyone arriving while it is
    /// in flight awaits the same outcome. Failure resets to idle.
    async fn ensure_initialized(&self) -> InitResult {
        let waiter = {
            let mut state = self.init.lock().await;
            let existing = match &*state {
                InitState::Ready(context) => return Ok(context.clone()),
                InitState::Running(rx) => Some(rx.clone()),
                InitState::Idle => None,
            };
            match existing {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = watch::channel(None);
                    *state = InitState::Running(rx);
                    drop(state);

                    let result = self.initialize().await;
                    let mut state = self.init.lock().await;
                    *state = match &result {
                        Ok(context) => InitState::Ready(context.clone()),
                        Err(_) => InitState::Idle,
                    };
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        };

        let mut rx = waiter;
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // The initializing task was torn down without publishing a
                // result; reset so the next call can start over.
                let mut state = self.init.lock().await;
                if matches!(*state, InitState::Running(_)) {
                    *state = InitState::Idle;
                }
                return Err("Session initialization was interrupted.".to_string());
            }
        }
    }

    async fn initialize(&self) -> InitResult {
        self.init_runs.fetch_add(1, Ordering::SeqCst);
        debug!("Initializing agent session");

        // Pre-pay the TCP handshake while we assemble the prompt; failure
        // here is non-fatal and only slows the first request.
        self.engine.warmup_connection().await;

        let model = self
            .engine
            .current_model()
            .or_else(|| self.engine.default_model().map(str::to_string))
            .ok_or_else(|| "No model selected; load a model first.".to_string())?;

        let system_prompt = self.build_system_prompt();
        Ok(Arc::new(SessionContext {
            model,
            system_prompt,
        }))
    }

    fn build_system_prompt(&self) -> String {
        let snapshot = self.manager.registry().snapshot();
        let names = snapshot.names_sorted();
        let tool_list = if names.is_empty() {
            "none".to_string()
        } else {
            let mut listed: Vec<&str> = names.iter().map(String::as_str).collect();
            listed.truncate(PROMPT_TOOL_LIMIT);
            listed.join(", ")
        };

        format!(
            "You are a helpful assistant. Be concise and clear.\n\
             Today's date: {}.\n\
             Available tools: {}.\n\
             Use tools when they help and explain results briefly.",
            Utc::now().format("%Y-%m-%d"),
            tool_list
        )
    }

    /// Forces initialization ahead of first use, then runs one throwaway
    /// streamed call discarding everything after the first chunk so the
    /// prompt template and tool schemas are built before real traffic.
    pub async fn warmup(&self) {
        let context = match self.ensure_initialized().await {
            Ok(context) => context,
            Err(err) => {
                warn!(error = %err, "Session warmup skipped");
                return;
            }
        };

        let cancel = CancellationToken::new();
        let snapshot = self.manager.registry().snapshot();
        let tools = (!snapshot.is_empty()).then(|| snapshot.tool_definitions());
        let mut rx = spawn_stream(StreamParams {
            client: self.engine.http().clone(),
            base_url: self.engine.base_url().to_string(),
            model: context.model.clone(),
            api_messages: vec![
                ChatMessage::text("system", &context.system_prompt),
                ChatMessage::text("user", "Hi"),
            ],
            tools,
            cancel_token: cancel.clone(),
        });

        // One message is enough; drop the rest of the generation.
        let _ = rx.recv().await;
        cancel.cancel();
        debug!("Session warmup complete");
    }

    /// Streams one chat turn. The receiver sees text deltas, deduplicated
    /// tool-used notices, and exactly one terminal `Completed` or `Error`.
    /// Dropping the receiver cancels the underlying generation.
    pub fn stream(
        self: &Arc<Self>,
        user_message: String,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run_turn(user_message, tx, cancel).await;
        });
        rx
    }

    /// Non-streaming convenience: drains a stream into one reply.
    pub async fn chat(self: &Arc<Self>, user_message: String) -> Result<ChatReply, String> {
        let cancel = CancellationToken::new();
        let mut rx = self.stream(user_message, cancel);
        let mut content = String::new();
        let mut tools_used = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Chunk(chunk) => content.push_str(&chunk),
                SessionEvent::ToolUsed(name) => tools_used.push(name),
                SessionEvent::Completed => return Ok(ChatReply { content, tools_used }),
                SessionEvent::Error(message) => return Err(message),
            }
        }
        Err("Chat stream ended unexpectedly.".to_string())
    }

    async fn run_turn(
        self: Arc<Self>,
        user_message: String,
        tx: mpsc::UnboundedSender<SessionEvent>,
        cancel: CancellationToken,
    ) {
        let context = match self.ensure_initialized().await {
            Ok(context) => context,
            Err(err) => {
                let _ = tx.send(SessionEvent::Error(err));
                return;
            }
        };

        // Working message list for this turn: system prompt, prior
        // user/assistant turns, then the new user message.
        let mut working: Vec<ChatMessage> =
            vec![ChatMessage::text("system", &context.system_prompt)];
        {
            let mut history = self.history.lock().await;
            for turn in history.iter() {
                match turn.role {
                    TurnRole::User | TurnRole::Assistant => {
                        working.push(ChatMessage::text(turn.role.as_str(), &turn.content));
                    }
                    // Tool turns are intra-turn artifacts; replaying them
                    // without their call stubs would break the protocol.
                    TurnRole::Tool => {}
                }
            }
            history.push(ChatTurn::user(user_message.clone()));
        }
        working.push(ChatMessage::text("user", &user_message));

        let mut assistant_text = String::new();
        let mut tools_used: Vec<String> = Vec::new();
        let mut rounds = 0;

        loop {
            let snapshot = self.manager.registry().snapshot();
            let tools = (!snapshot.is_empty()).then(|| snapshot.tool_definitions());
            let mut rx = spawn_stream(StreamParams {
                client: self.engine.http().clone(),
                base_url: self.engine.base_url().to_string(),
                model: context.model.clone(),
                api_messages: working.clone(),
                tools,
                cancel_token: cancel.clone(),
            });

            let mut round_text = String::new();
            let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
            let mut finish_reason: Option<String> = None;
            let mut finished = false;

            while let Some(message) = rx.recv().await {
                match message {
                    StreamMessage::Chunk(chunk) => {
                        assistant_text.push_str(&chunk);
                        round_text.push_str(&chunk);
                        if tx.send(SessionEvent::Chunk(chunk)).is_err() {
                            // Receiver gone: stop generating into the void.
                            cancel.cancel();
                            return;
                        }
                    }
                    StreamMessage::ToolCall(delta) => {
                        accumulate_tool_call(&mut pending, delta);
                    }
                    StreamMessage::Done { finish_reason: reason } => {
                        finish_reason = reason;
                        finished = true;
                        break;
                    }
                    StreamMessage::Failed(message) => {
                        let _ = tx.send(SessionEvent::Error(message));
                        return;
                    }
                }
            }

            if !finished {
                // The generation task exited without a terminal message;
                // that only happens on cancellation.
                return;
            }

            let wants_tools = finish_reason.as_deref() == Some("tool_calls");
            if wants_tools && !pending.is_empty() && rounds < MAX_TOOL_ROUNDS {
                rounds += 1;
                self.dispatch_tool_calls(
                    pending,
                    &mut working,
                    round_text,
                    &mut tools_used,
                    &tx,
                )
                .await;
                continue;
            }

            if tx.send(SessionEvent::Completed).is_err() {
                cancel.cancel();
            }
            let mut history = self.history.lock().await;
            history.push(ChatTurn::assistant(assistant_text, tools_used));
            return;
        }
    }

    /// Runs the accumulated tool calls and extends the working messages
    /// with their results so generation can resume. A failed call (timeout
    /// included) becomes a tool-level error message for the model; it never
    /// aborts the turn.
    async fn dispatch_tool_calls(
        &self,
        pending: BTreeMap<u32, PendingToolCall>,
        working: &mut Vec<ChatMessage>,
        round_text: String,
        tools_used: &mut Vec<String>,
        tx: &mpsc::UnboundedSender<SessionEvent>,
    ) {
        let mut call_stubs = Vec::new();
        let mut results = Vec::new();

        for (index, call) in pending {
            let Some(name) = call.name else {
                debug!(index, "Dropping tool call fragment without a name");
                continue;
            };
            let call_id = call.id.unwrap_or_else(|| format!("call-{index}"));

            if !tools_used.iter().any(|used| used == &name) {
                tools_used.push(name.clone());
                let _ = tx.send(SessionEvent::ToolUsed(name.clone()));
            }

            let outcome = match parse_arguments(&call.arguments) {
                Ok(arguments) => self
                    .manager
                    .invoke_tool(&name, arguments)
                    .await
                    .map(|result| render_call_result(&result))
                    .unwrap_or_else(|err| {
                        warn!(tool = %name, error = %err, "Tool call failed");
                        format!("Tool error: {err}")
                    }),
                Err(err) => format!("Tool error: invalid arguments: {err}"),
            };

            call_stubs.push(ChatToolCall {
                id: call_id.clone(),
                kind: "function".to_string(),
                function: ChatToolCallFunction {
                    name,
                    arguments: call.arguments,
                },
            });
            results.push((call_id, outcome));
        }

        working.push(ChatMessage {
            role: "assistant".to_string(),
            content: round_text,
            tool_call_id: None,
            tool_calls: (!call_stubs.is_empty()).then_some(call_stubs),
        });
        let mut history = self.history.lock().await;
        for (call_id, outcome) in results {
            history.push(ChatTurn::tool(outcome.clone()));
            working.push(ChatMessage {
                role: "tool".to_string(),
                content: outcome,
                tool_call_id: Some(call_id),
                tool_calls: None,
            });
        }
    }
}

/// Loads a different model and binds a fresh session to it. The old
/// session keeps streaming its in-flight turns; `Ready` is terminal per
/// session, so switching models means replacing the session.
pub async fn reload_with_model(
    engine: &Arc<EngineClient>,
    manager: &Arc<ConnectionManager>,
    model: &str,
) -> Result<Arc<AgentSession>, crate::core::engine::EngineError> {
    engine.preload_model(model).await?;
    let session = Arc::new(AgentSession::new(Arc::clone(engine), Arc::clone(manager)));
    session.warmup().await;
    Ok(session)
}

struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

fn accumulate_tool_call(pending: &mut BTreeMap<u32, PendingToolCall>, delta: ToolCallDelta) {
    let entry = pending.entry(delta.index).or_insert_with(|| PendingToolCall {
        id: None,
        name: None,
        arguments: String::new(),
    });
    if delta.id.is_some() {
        entry.id = delta.id;
    }
    if delta.name.is_some() {
        entry.name = delta.name;
    }
    if let Some(arguments) = delta.arguments {
        entry.arguments.push_str(&arguments);
    }
}

fn parse_arguments(raw: &str) -> Result<Option<Map<String, Value>>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<Map<String, Value>>(trimmed)
        .map(Some)
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{EngineConfig, ToolSettings};
    use crate::utils::test_utils::{backend_config, sample_tool, FakeBehavior, FakeTransport};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves scripted SSE bodies for consecutive chat completion posts.
    /// GET probes (warmup, health) receive an empty tags listing without
    /// consuming a scripted body.
    async fn spawn_mock_engine(responses: Vec<String>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let mut remaining = responses.into_iter();
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buffer = vec![0_u8; 16 * 1024];
                let mut read_total = 0;
                // Read until the whole request has arrived; requests here
                // are small enough to fit one buffer.
                let is_post = loop {
                    let Ok(read) = stream.read(&mut buffer[read_total..]).await else {
                        return;
                    };
                    read_total += read;
                    let text = String::from_utf8_lossy(&buffer[..read_total]);
                    if let Some(header_end) = text.find("\r\n\r\n") {
                        let content_length = text
                            .lines()
                            .find_map(|line| {
                                line.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|value| value.trim().parse::<usize>().unwrap_or(0))
                            })
                            .unwrap_or(0);
                        if read_total >= header_end + 4 + content_length {
                            break text.starts_with("POST");
                        }
                    }
                    if read == 0 {
                        return;
                    }
                };

                if !is_post {
                    let body = "{\"models\":[]}";
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    continue;
                }

                let Some(body) = remaining.next() else {
                    return;
                };
                let done = remaining.len() == 0;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                if done {
                    return;
                }
            }
        });
        addr
    }

    fn sse_text_completion(chunks: &[&str]) -> String {
        let mut body = String::new();
        for chunk in chunks {
            body.push_str(&format!(
                "data: {}\n\n",
                serde_json::json!({"choices":[{"delta":{"content":chunk}}]})
            ));
        }
        body.push_str("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n");
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn sse_tool_call(name: &str, arguments: &str) -> String {
        let mut body = String::new();
        body.push_str(&format!(
            "data: {}\n\n",
            serde_json::json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"call-1","function":{"name":name,"arguments":arguments}}
            ]}}]})
        ));
        body.push_str(
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        );
        body.push_str("data: [DONE]\n\n");
        body
    }

    async fn session_against(
        addr: std::net::SocketAddr,
        manager: Arc<ConnectionManager>,
    ) -> Arc<AgentSession> {
        let engine = Arc::new(
            EngineClient::new(
                EngineConfig::new(format!("http://{addr}")).with_default_model("llama3.2"),
            )
            .expect("engine should build"),
        );
        Arc::new(AgentSession::new(engine, manager))
    }

    fn empty_manager() -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(Vec::new(), ToolSettings::default()))
    }

    #[tokio::test]
    async fn streamed_deltas_assemble_into_history() {
        let addr = spawn_mock_engine(vec![sse_text_completion(&["Hel", "lo", " there"])]).await;
        let session = session_against(addr, empty_manager()).await;

        let mut rx = session.stream("hi".to_string(), CancellationToken::new());
        let mut text = String::new();
        let mut completed = false;
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Chunk(chunk) => text.push_str(&chunk),
                SessionEvent::Completed => {
                    completed = true;
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        assert!(completed);
        assert_eq!(text, "Hello there");

        let history = session.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, TurnRole::User);
        assert_eq!(history[1].role, TurnRole::Assistant);
        // Concatenated deltas equal the stored assistant turn.
        assert_eq!(history[1].content, text);
    }

    #[tokio::test]
    async fn concurrent_first_calls_initialize_once() {
        let addr = spawn_mock_engine(
            (0..8)
                .map(|_| sse_text_completion(&["ok"]))
                .collect::<Vec<_>>(),
        )
        .await;
        let session = session_against(addr, empty_manager()).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move {
                session.chat("hi".to_string()).await
            }));
        }
        for handle in handles {
            handle
                .await
                .expect("task should join")
                .expect("chat should succeed");
        }

        assert_eq!(session.init_runs(), 1);
    }

    #[tokio::test]
    async fn initialization_failure_is_retryable() {
        let addr = spawn_mock_engine(vec![sse_text_completion(&["ok"])]).await;
        let engine = Arc::new(
            EngineClient::new(EngineConfig::new(format!("http://{addr}")))
                .expect("engine should build"),
        );
        let session = Arc::new(AgentSession::new(engine.clone(), empty_manager()));

        // No default model and nothing resident: init must fail.
        let err = session.chat("hi".to_string()).await.expect_err("init fails");
        assert!(err.contains("No model selected"));
        assert!(!session.is_initialized().await);

        // A model arriving later lets the next call succeed from scratch.
        engine.set_model("llama3.2");
        let reply = session.chat("hi".to_string()).await.expect("chat succeeds");
        assert_eq!(reply.content, "ok");
        assert_eq!(session.init_runs(), 2);
    }

    #[tokio::test]
    async fn tool_calls_resume_generation_with_results() {
        let addr = spawn_mock_engine(vec![
            sse_tool_call("add", "{\"a\":1,\"b\":2}"),
            sse_text_completion(&["3"]),
        ])
        .await;

        let manager = Arc::new(ConnectionManager::new(
            vec![backend_config("calc", true)],
            ToolSettings::default(),
        ));
        let adapter = Arc::new(FakeTransport::new(
            "calc",
            vec![sample_tool("add")],
            FakeBehavior::Succeed,
        ));
        manager
            .install_test_backend("calc", vec![sample_tool("add")], adapter.clone())
            .await;

        let session = session_against(addr, manager).await;
        let reply = session
            .chat("add one and two".to_string())
            .await
            .expect("chat should succeed");

        assert_eq!(reply.content, "3");
        assert_eq!(reply.tools_used, vec!["add"]);
        assert_eq!(adapter.call_count(), 1);

        let history = session.history().await;
        let assistant = history.last().expect("assistant turn");
        assert_eq!(assistant.role, TurnRole::Assistant);
        assert_eq!(assistant.tools_invoked, vec!["add"]);
        assert!(history.iter().any(|turn| turn.role == TurnRole::Tool));
    }

    #[tokio::test]
    async fn tool_timeout_does_not_abort_the_turn() {
        let addr = spawn_mock_engine(vec![
            sse_tool_call("add", "{}"),
            sse_text_completion(&["the tool was unavailable"]),
        ])
        .await;

        let manager = Arc::new(ConnectionManager::new(
            vec![backend_config("calc", true)],
            ToolSettings::default(),
        ));
        let adapter = Arc::new(FakeTransport::new(
            "calc",
            vec![sample_tool("add")],
            FakeBehavior::TimeOut,
        ));
        manager
            .install_test_backend("calc", vec![sample_tool("add")], adapter)
            .await;

        let session = session_against(addr, manager).await;
        let reply = session
            .chat("add".to_string())
            .await
            .expect("turn should complete despite the timeout");
        assert_eq!(reply.content, "the tool was unavailable");
        assert_eq!(reply.tools_used, vec!["add"]);
    }

    #[tokio::test]
    async fn empty_registry_finishes_on_language_alone() {
        let addr = spawn_mock_engine(vec![sse_text_completion(&["no tools needed"])]).await;
        let session = session_against(addr, empty_manager()).await;
        let reply = session.chat("hello".to_string()).await.expect("chat ok");
        assert_eq!(reply.content, "no tools needed");
        assert!(reply.tools_used.is_empty());
    }

    #[tokio::test]
    async fn engine_failure_surfaces_as_error_event() {
        // Bind and immediately drop: connection refused.
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let session = session_against(addr, empty_manager()).await;
        let err = session
            .chat("hi".to_string())
            .await
            .expect_err("engine is down");
        assert!(err.starts_with("Engine error:"));
    }
}
