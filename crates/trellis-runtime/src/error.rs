//! Error types for producers and the router.

use thiserror::Error;
use trellis_types::HandlerError;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The router's event stream is gone.
    #[error("Event stream closed")]
    StreamClosed,

    /// The webhook listener could not bind.
    #[error("Failed to bind webhook listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A webhook `setup` hook failed; the update was aborted.
    #[error("Webhook setup failed for /webhook/{path}: {source}")]
    WebhookSetup {
        path: String,
        #[source]
        source: HandlerError,
    },

    /// Router lifecycle misuse.
    #[error("Router is {0}")]
    InvalidState(&'static str),

    /// Pub/sub transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
