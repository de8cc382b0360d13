//! Error types for dev sessions.

use thiserror::Error;

/// Result type for dev session operations.
pub type Result<T> = std::result::Result<T, DevError>;

#[derive(Debug, Error)]
pub enum DevError {
    /// The configured workflow does not exist in the namespace.
    #[error("Workflow '{workflow_id}' not found in namespace '{namespace}'")]
    WorkflowNotFound {
        workflow_id: String,
        namespace: String,
    },

    /// Providers used by the code have no usable configuration.
    #[error("Missing configuration for providers: {}", .0.join(", "))]
    MissingProviders(Vec<String>),

    /// The operation is not valid in the session's current state.
    #[error("Invalid session state: {0}")]
    InvalidState(&'static str),

    #[error("Failed to watch project: {0}")]
    Watch(String),

    /// Reading input from the terminal failed.
    #[error("Prompt failed: {0}")]
    Prompt(String),

    #[error(transparent)]
    Sandbox(#[from] trellis_sandbox::SandboxError),

    #[error(transparent)]
    Runtime(#[from] trellis_runtime::RuntimeError),

    #[error(transparent)]
    Client(#[from] trellis_client::ClientError),

    #[error(transparent)]
    Config(#[from] trellis_config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
