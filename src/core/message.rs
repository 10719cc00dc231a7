//! Conversation turns held by a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::Tool => "tool",
        }
    }
}

/// One turn of the conversation. The transcript is append-only for the
/// lifetime of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
    /// Distinct tool names invoked while producing this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_invoked: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content, Vec::new())
    }

    pub fn assistant(content: impl Into<String>, tools_invoked: Vec<String>) -> Self {
        Self::new(TurnRole::Assistant, content, tools_invoked)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Tool, content, Vec::new())
    }

    fn new(role: TurnRole, content: impl Into<String>, tools_invoked: Vec<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tools_invoked,
            timestamp: Utc::now(),
        }
    }
}
