//! Frames a session's event stream into the wire records the client
//! consumes.
//!
//! The first record of every stream is the `processing` status event,
//! emitted before any upstream I/O so perceived latency stays bounded no
//! matter how slow the first token is. Everything after is forwarded with
//! no added buffering. An upstream error terminates the sequence with a
//! single `error` record; text already sent is not retracted.

use crate::core::session::{AgentSession, SessionEvent};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Response headers the routing layer must set so intermediary proxies do
/// not buffer partial output.
pub const STREAM_RESPONSE_HEADERS: [(&str, &str); 5] = [
    ("Cache-Control", "no-cache, no-transform"),
    ("Connection", "keep-alive"),
    ("X-Accel-Buffering", "no"),
    ("Content-Type", "text/event-stream; charset=utf-8"),
    ("Transfer-Encoding", "chunked"),
];

// Field order in these frames follows declaration order, which keeps the
// wire format byte-stable.
#[derive(Serialize)]
struct ProcessingFrame {
    status: &'static str,
    done: bool,
}

#[derive(Serialize)]
struct TextFrame<'a> {
    text: &'a str,
    done: bool,
}

#[derive(Serialize)]
struct ToolUsedFrame<'a> {
    tool_used: &'a str,
    done: bool,
}

#[derive(Serialize)]
struct DoneFrame<'a> {
    done: bool,
    chunks: usize,
    tools_used: &'a [String],
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    error: &'a str,
}

fn frame<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    format!("data: {}\n\n", json)
}

pub struct StreamPipeline;

impl StreamPipeline {
    /// Starts one streamed chat turn and returns the framed record
    /// stream. Cancel the token when the client disconnects: the pipeline
    /// stops pulling from the session and the generation request is
    /// released.
    pub fn run(
        session: &Arc<AgentSession>,
        user_message: String,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<String> {
        let events = session.stream(user_message, cancel.clone());
        Self::attach(events, cancel)
    }

    /// Frames an already-running event stream. The `processing` record is
    /// sent before this function returns, ahead of any upstream await.
    pub fn attach(
        events: mpsc::UnboundedReceiver<SessionEvent>,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(frame(&ProcessingFrame {
            status: "processing",
            done: false,
        }));

        tokio::spawn(async move {
            forward(events, tx, cancel).await;
        });
        rx
    }
}

async fn forward(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let mut chunks = 0_usize;
    let mut tools_used: Vec<String> = Vec::new();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        // Upstream ended without a terminal event: the turn was cancelled.
        let Some(event) = event else {
            return;
        };

        match event {
            SessionEvent::Chunk(text) => {
                if chunks == 0 {
                    debug!(
                        ttfc_ms = started.elapsed().as_millis() as u64,
                        "First chunk reached the pipeline"
                    );
                }
                chunks += 1;
                if tx
                    .send(frame(&TextFrame {
                        text: &text,
                        done: false,
                    }))
                    .is_err()
                {
                    // Client is gone; stop pulling further chunks.
                    cancel.cancel();
                    return;
                }
            }
            SessionEvent::ToolUsed(name) => {
                let sent = tx.send(frame(&ToolUsedFrame {
                    tool_used: &name,
                    done: false,
                }));
                tools_used.push(name);
                if sent.is_err() {
                    cancel.cancel();
                    return;
                }
            }
            SessionEvent::Completed => {
                let _ = tx.send(frame(&DoneFrame {
                    done: true,
                    chunks,
                    tools_used: &tools_used,
                }));
                return;
            }
            SessionEvent::Error(message) => {
                let _ = tx.send(frame(&ErrorFrame { error: &message }));
                return;
            }
        }
    }
}
