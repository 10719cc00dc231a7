//! Failure taxonomy for tool-backend transports.

/// Errors an adapter can surface to the connection manager.
///
/// Adapters never retry on their own; retry policy belongs to the caller.
/// A single failed invocation leaves the connection usable, while
/// [`TransportError::TransportClosed`] signals that the whole handle is
/// dead and its tools must be withdrawn.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connect or handshake failed; the backend never became usable.
    #[error("backend `{backend}` unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The invoked tool name is unknown to this adapter.
    #[error("tool not found: `{tool}` on backend `{backend}`")]
    ToolNotFound { backend: String, tool: String },

    /// No reply arrived within the configured deadline.
    #[error("tool `{tool}` timed out after {seconds}s")]
    InvocationTimeout { tool: String, seconds: u64 },

    /// The backend answered with a protocol-level error.
    #[error("backend `{backend}` error: {message}")]
    BackendError { backend: String, message: String },

    /// The connection dropped mid-call.
    #[error("transport to backend `{backend}` closed")]
    TransportClosed { backend: String },
}

impl TransportError {
    pub fn unavailable(backend: &str, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.to_string(),
            reason: reason.into(),
        }
    }

    pub fn backend(backend: &str, message: impl Into<String>) -> Self {
        Self::BackendError {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn closed(backend: &str) -> Self {
        Self::TransportClosed {
            backend: backend.to_string(),
        }
    }

    /// True when the failure concerns the whole connection rather than one
    /// call.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportClosed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_closed_transports_are_fatal() {
        assert!(TransportError::closed("fs").is_fatal());
        assert!(!TransportError::unavailable("fs", "boom").is_fatal());
        assert!(!TransportError::InvocationTimeout {
            tool: "read_file".to_string(),
            seconds: 30,
        }
        .is_fatal());
    }

    #[test]
    fn display_names_the_backend() {
        let err = TransportError::backend("github", "bad token");
        assert_eq!(err.to_string(), "backend `github` error: bad token");
    }
}
