//! Websocket JSON protocol spoken by the inspector endpoint.
//!
//! Clients send `{id, method, params}` and receive `{id, result}` or
//! `{id, error: {message}}`. Session events arrive as `{method, params}`
//! notifications. Method names follow the familiar `Domain.command` style.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use trellis_sandbox::ConsoleEntry;

use crate::error::{InspectorError, Result};
use crate::session::{DebugNotification, DebugSession};

/// Client request.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseError {
    pub message: String,
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ResponseError {
                message: message.into(),
            }),
        }
    }
}

/// Server-initiated message.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub method: &'static str,
    pub params: Value,
}

impl Notification {
    pub fn console(entry: &ConsoleEntry) -> Self {
        Self {
            method: "Runtime.consoleAPICalled",
            params: json!({
                "type": entry.level,
                "args": [{"type": "string", "value": entry.message}],
                "location": entry.location,
                "timestamp": entry.timestamp.timestamp_millis(),
            }),
        }
    }
}

impl From<&DebugNotification> for Notification {
    fn from(note: &DebugNotification) -> Self {
        match note {
            DebugNotification::Paused {
                reason,
                location,
                breakpoint,
            } => Self {
                method: "Debugger.paused",
                params: json!({
                    "reason": reason,
                    "location": location,
                    "hitBreakpoints": breakpoint.iter().collect::<Vec<_>>(),
                }),
            },
            DebugNotification::Resumed => Self {
                method: "Debugger.resumed",
                params: json!({}),
            },
        }
    }
}

/// A parsed request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    DebuggerEnable,
    RuntimeEnable,
    SetBreakpoint { file: String, line: u32 },
    RemoveBreakpoint { id: u32 },
    Resume,
    Pause,
    StepOver,
    StepInto,
    StepOut,
    Evaluate { expression: String },
}

#[derive(Deserialize)]
struct SetBreakpointParams {
    file: String,
    line: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveBreakpointParams {
    breakpoint_id: u32,
}

#[derive(Deserialize)]
struct EvaluateParams {
    expression: String,
}

fn params<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T> {
    serde_json::from_value(request.params.clone()).map_err(|e| {
        InspectorError::InvalidRequest(format!("bad params for {}: {e}", request.method))
    })
}

impl Command {
    pub fn parse(request: &Request) -> Result<Self> {
        Ok(match request.method.as_str() {
            "Debugger.enable" => Self::DebuggerEnable,
            "Runtime.enable" => Self::RuntimeEnable,
            "Debugger.setBreakpoint" => {
                let p: SetBreakpointParams = params(request)?;
                Self::SetBreakpoint {
                    file: p.file,
                    line: p.line,
                }
            }
            "Debugger.removeBreakpoint" => {
                let p: RemoveBreakpointParams = params(request)?;
                Self::RemoveBreakpoint {
                    id: p.breakpoint_id,
                }
            }
            "Debugger.resume" => Self::Resume,
            "Debugger.pause" => Self::Pause,
            "Debugger.stepOver" => Self::StepOver,
            "Debugger.stepInto" => Self::StepInto,
            "Debugger.stepOut" => Self::StepOut,
            "Runtime.evaluate" => {
                let p: EvaluateParams = params(request)?;
                Self::Evaluate {
                    expression: p.expression,
                }
            }
            other => {
                return Err(InspectorError::InvalidRequest(format!(
                    "unknown method '{other}'"
                )));
            }
        })
    }

    /// Run against `session`. `*.enable` commands are handled by the connection.
    pub async fn execute(self, session: &dyn DebugSession) -> Result<Value> {
        match self {
            Self::DebuggerEnable | Self::RuntimeEnable => Ok(json!({})),
            Self::SetBreakpoint { file, line } => {
                let bp = session.set_breakpoint(&file, line).await?;
                Ok(json!({"breakpointId": bp.id, "file": bp.file, "line": bp.line}))
            }
            Self::RemoveBreakpoint { id } => {
                session.remove_breakpoint(id).await?;
                Ok(json!({}))
            }
            Self::Resume => session.resume().await.map(|_| json!({})),
            Self::Pause => session.pause().await.map(|_| json!({})),
            Self::StepOver => session.step_over().await.map(|_| json!({})),
            Self::StepInto => session.step_into().await.map(|_| json!({})),
            Self::StepOut => session.step_out().await.map(|_| json!({})),
            Self::Evaluate { expression } => {
                let value = session.evaluate(&expression).await?;
                Ok(json!({"result": value}))
            }
        }
    }
}
