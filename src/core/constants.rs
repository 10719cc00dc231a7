//! Shared timing constants for engine housekeeping calls.
//!
//! These bound best-effort maintenance traffic only; the user-facing
//! generation path takes its limits from [`crate::core::config`].

/// Connection warmup probe deadline, in seconds.
pub const WARMUP_TIMEOUT_SECS: u64 = 2;

/// Health probe deadline, in seconds.
pub const HEALTH_TIMEOUT_SECS: u64 = 3;

/// Model listing deadline, in seconds.
pub const LIST_MODELS_TIMEOUT_SECS: u64 = 5;

/// Model preload deadline, in seconds. Cold loads pull the model into
/// engine memory and can take a while.
pub const PRELOAD_TIMEOUT_SECS: u64 = 60;

/// Upper bound on tool rounds within one chat turn.
pub const MAX_TOOL_ROUNDS: usize = 4;

/// How many tools the system prompt enumerates before truncating.
pub const PROMPT_TOOL_LIMIT: usize = 20;
