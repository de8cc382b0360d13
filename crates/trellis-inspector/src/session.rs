//! The narrow debugger surface the rest of Trellis talks to.
//!
//! Protocol adapters (the websocket endpoint, tests) drive a
//! [`DebugSession`]; the Lua-specific machinery lives behind it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use trellis_sandbox::ConsoleSink;

use crate::error::Result;

/// A breakpoint on `file:line`. Files are project-relative paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub id: u32,
    pub file: String,
    pub line: u32,
}

/// Where execution is paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Why execution paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseReason {
    Breakpoint,
    Step,
    Pause,
}

/// Session state changes pushed to protocol clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DebugNotification {
    Paused {
        reason: PauseReason,
        location: Location,
        #[serde(skip_serializing_if = "Option::is_none")]
        breakpoint: Option<u32>,
    },
    Resumed,
}

/// Debugger operations, completed asynchronously.
#[async_trait]
pub trait DebugSession: Send + Sync {
    async fn set_breakpoint(&self, file: &str, line: u32) -> Result<Breakpoint>;

    async fn remove_breakpoint(&self, id: u32) -> Result<()>;

    /// Continue until the next breakpoint.
    async fn resume(&self) -> Result<()>;

    /// Pause at the next executed line.
    async fn pause(&self) -> Result<()>;

    async fn step_over(&self) -> Result<()>;

    async fn step_into(&self) -> Result<()>;

    async fn step_out(&self) -> Result<()>;

    /// Evaluate `expression` in the paused frame. Locals shadow globals.
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value>;

    /// Forward script console output to `sink`.
    fn attach_console(&self, sink: Arc<dyn ConsoleSink>);

    fn subscribe(&self) -> broadcast::Receiver<DebugNotification>;

    /// Drop breakpoints and release any paused thread.
    fn detach(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_notification_shape() {
        let note = DebugNotification::Paused {
            reason: PauseReason::Breakpoint,
            location: Location {
                file: "main.lua".into(),
                line: 4,
            },
            breakpoint: Some(1),
        };
        assert_eq!(
            serde_json::to_value(&note).unwrap(),
            serde_json::json!({
                "event": "paused",
                "reason": "breakpoint",
                "location": {"file": "main.lua", "line": 4},
                "breakpoint": 1
            })
        );
        assert_eq!(
            serde_json::to_value(DebugNotification::Resumed).unwrap(),
            serde_json::json!({"event": "resumed"})
        );
    }
}
