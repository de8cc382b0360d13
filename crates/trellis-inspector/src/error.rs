//! Error types for the inspector.

use thiserror::Error;

/// Result type for inspector operations.
pub type Result<T> = std::result::Result<T, InspectorError>;

/// Errors raised by debug sessions and the protocol endpoint.
#[derive(Debug, Error)]
pub enum InspectorError {
    /// Another inspector already owns the process-wide endpoint.
    #[error("An inspector is already active in this process")]
    AlreadyActive,

    /// The protocol endpoint could not bind.
    #[error("Failed to bind inspector on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The command needs a paused thread.
    #[error("Execution is not paused")]
    NotPaused,

    /// Unknown breakpoint id.
    #[error("Breakpoint {0} not found")]
    BreakpointNotFound(u32),

    /// The expression could not be compiled or raised an error.
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// The paused thread went away before answering.
    #[error("Paused thread is no longer reachable")]
    Disconnected,

    /// A protocol message was malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A source map could not be parsed.
    #[error("Invalid source map for {file}: {source}")]
    SourceMap {
        file: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            InspectorError::BreakpointNotFound(3).to_string(),
            "Breakpoint 3 not found"
        );
        assert_eq!(
            InspectorError::NotPaused.to_string(),
            "Execution is not paused"
        );
    }
}
