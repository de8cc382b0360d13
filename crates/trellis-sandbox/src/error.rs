//! Error types for the sandbox.

use thiserror::Error;

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur while loading or executing a project.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Error raised inside the Lua VM.
    #[error("Script error: {0}")]
    Lua(#[from] mlua::Error),

    /// The entry point is not part of the virtual project.
    #[error("Entry point not found in project: {0}")]
    EntryNotFound(String),

    /// A `require` could not be resolved.
    #[error("Module '{name}' not found{}", from.as_deref().map(|f| format!(" (required from {f})")).unwrap_or_default())]
    ModuleNotFound { name: String, from: Option<String> },

    /// Module evaluation did not produce a trigger array.
    #[error("No triggers auto-registered: module exports did not contain a trigger array")]
    NoTriggersRegistered,

    /// A trigger declaration was malformed.
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// A provider secret was read but is not configured.
    #[error("Missing secret '{name}' for provider {provider}")]
    MissingSecret { provider: String, name: String },

    /// Module evaluation ran past its instruction budget.
    #[error("Instruction budget of {0} exhausted during module evaluation")]
    BudgetExhausted(u64),

    /// A blocking execution task failed to complete.
    #[error("Execution task failed: {0}")]
    Join(String),
}

impl SandboxError {
    /// Convert into a Lua runtime error for raising inside host functions.
    pub fn into_lua(self) -> mlua::Error {
        match self {
            SandboxError::Lua(err) => err,
            other => mlua::Error::RuntimeError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_not_found_display() {
        let err = SandboxError::ModuleNotFound {
            name: "lib.util".into(),
            from: Some("main.lua".into()),
        };
        assert_eq!(
            err.to_string(),
            "Module 'lib.util' not found (required from main.lua)"
        );

        let err = SandboxError::ModuleNotFound {
            name: "x".into(),
            from: None,
        };
        assert_eq!(err.to_string(), "Module 'x' not found");
    }

    #[test]
    fn test_into_lua_keeps_message() {
        let err = SandboxError::MissingSecret {
            provider: "slack:default".into(),
            name: "bot_token".into(),
        }
        .into_lua();
        assert!(err.to_string().contains("bot_token"));
    }
}
