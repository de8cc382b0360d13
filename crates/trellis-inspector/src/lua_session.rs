//! [`DebugSession`] over the sandbox's line hook.
//!
//! The session is installed as the engine's [`LineObserver`]. When a line
//! matches a breakpoint, a step condition or a pause request, the executing
//! thread blocks inside the hook and services commands until it is told to
//! continue. Evaluation therefore runs on the paused thread, with the VM
//! lock already held.
//!
//! Handlers must run off the async runtime (the sandbox adapters use
//! `spawn_blocking`) since a paused thread blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};
use trellis_sandbox::mlua::{self, Debug, Function, Lua, LuaSerdeExt, Table, Value};
use trellis_sandbox::{Console, ConsoleSink, DEBUG_LIBRARY_KEY, LineObserver, normalize_path};

use crate::error::{InspectorError, Result};
use crate::session::{Breakpoint, DebugNotification, DebugSession, Location, PauseReason};

const NOTIFICATION_CAPACITY: usize = 64;
const MAX_FRAME_SCAN: i64 = 64;
const EVAL_CHUNK_NAME: &str = "=inspector";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stepping {
    None,
    Into,
    /// Pause at the next line whose stack depth is at most this.
    Over(usize),
    /// Pause at the next line whose stack depth is below this.
    Out(usize),
}

#[derive(Debug, Clone, Copy)]
enum Resume {
    Continue,
    StepInto,
    StepOver,
    StepOut,
}

enum PauseCommand {
    Resume(Resume),
    Evaluate {
        expression: String,
        reply: oneshot::Sender<Result<serde_json::Value>>,
    },
}

struct Paused {
    location: Location,
    commands: mpsc::UnboundedSender<PauseCommand>,
}

struct SessionState {
    breakpoints: Vec<Breakpoint>,
    stepping: Stepping,
    pause_requested: bool,
    paused: Option<Paused>,
}

/// Debug session for Lua states created by a [`SandboxEngine`](trellis_sandbox::SandboxEngine)
/// with this session as its line observer.
pub struct LuaDebugSession {
    console: Console,
    state: Mutex<SessionState>,
    notifications: broadcast::Sender<DebugNotification>,
    next_breakpoint: AtomicU32,
}

impl LuaDebugSession {
    pub fn new(console: Console) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Arc::new(Self {
            console,
            state: Mutex::new(SessionState {
                breakpoints: Vec::new(),
                stepping: Stepping::None,
                pause_requested: false,
                paused: None,
            }),
            notifications,
            next_breakpoint: AtomicU32::new(1),
        })
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.state.lock().breakpoints.clone()
    }

    pub fn paused_at(&self) -> Option<Location> {
        self.state.lock().paused.as_ref().map(|p| p.location.clone())
    }

    fn send_resume(&self, resume: Resume) -> Result<()> {
        let paused = self
            .state
            .lock()
            .paused
            .take()
            .ok_or(InspectorError::NotPaused)?;
        paused
            .commands
            .send(PauseCommand::Resume(resume))
            .map_err(|_| InspectorError::Disconnected)
    }

    /// Decide whether the line at `location` should pause, and why.
    fn pause_reason(&self, lua: &Lua, location: &Location) -> Option<(PauseReason, Option<u32>)> {
        let state = self.state.lock();
        if let Some(bp) = state
            .breakpoints
            .iter()
            .find(|b| b.file == location.file && b.line == location.line)
        {
            return Some((PauseReason::Breakpoint, Some(bp.id)));
        }
        if state.pause_requested {
            return Some((PauseReason::Pause, None));
        }
        let hit = match state.stepping {
            Stepping::None => false,
            Stepping::Into => true,
            Stepping::Over(depth) => stack_depth(lua) <= depth,
            Stepping::Out(depth) => stack_depth(lua) < depth,
        };
        hit.then_some((PauseReason::Step, None))
    }

    /// Block the executing thread until a resume command arrives.
    fn park(
        &self,
        lua: &Lua,
        chunk: &str,
        location: Location,
        reason: PauseReason,
        breakpoint: Option<u32>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            state.pause_requested = false;
            state.stepping = Stepping::None;
            state.paused = Some(Paused {
                location: location.clone(),
                commands: tx,
            });
        }
        info!(location = %location, ?reason, "Execution paused");
        let _ = self.notifications.send(DebugNotification::Paused {
            reason,
            location: location.clone(),
            breakpoint,
        });

        let depth = stack_depth(lua);
        while let Some(command) = rx.blocking_recv() {
            match command {
                PauseCommand::Evaluate { expression, reply } => {
                    let result = evaluate_in_frame(lua, chunk, location.line, &expression);
                    let _ = reply.send(result);
                }
                PauseCommand::Resume(resume) => {
                    self.state.lock().stepping = match resume {
                        Resume::Continue => Stepping::None,
                        Resume::StepInto => Stepping::Into,
                        Resume::StepOver => Stepping::Over(depth),
                        Resume::StepOut => Stepping::Out(depth),
                    };
                    break;
                }
            }
        }

        debug!(location = %location, "Execution resumed");
        let _ = self.notifications.send(DebugNotification::Resumed);
    }
}

impl LineObserver for LuaDebugSession {
    fn on_line(&self, lua: &Lua, debug: &Debug<'_>) -> mlua::Result<()> {
        let line = debug.curr_line();
        if line <= 0 {
            return Ok(());
        }
        let source = debug.source();
        // Only user files; the wrapper and inspector chunks use `=` names.
        let Some(chunk) = source.source.as_deref().filter(|s| s.starts_with('@')) else {
            return Ok(());
        };
        let location = Location {
            file: chunk[1..].to_string(),
            line: line as u32,
        };
        if let Some((reason, breakpoint)) = self.pause_reason(lua, &location) {
            self.park(lua, chunk, location, reason, breakpoint);
        }
        Ok(())
    }
}

#[async_trait]
impl DebugSession for LuaDebugSession {
    async fn set_breakpoint(&self, file: &str, line: u32) -> Result<Breakpoint> {
        let file = normalize_path(file).ok_or_else(|| {
            InspectorError::InvalidRequest(format!("bad breakpoint path '{file}'"))
        })?;
        if line == 0 {
            return Err(InspectorError::InvalidRequest("lines start at 1".into()));
        }
        let breakpoint = Breakpoint {
            id: self.next_breakpoint.fetch_add(1, Ordering::Relaxed),
            file,
            line,
        };
        self.state.lock().breakpoints.push(breakpoint.clone());
        debug!(id = breakpoint.id, file = %breakpoint.file, line, "Breakpoint set");
        Ok(breakpoint)
    }

    async fn remove_breakpoint(&self, id: u32) -> Result<()> {
        let mut state = self.state.lock();
        let before = state.breakpoints.len();
        state.breakpoints.retain(|b| b.id != id);
        if state.breakpoints.len() == before {
            return Err(InspectorError::BreakpointNotFound(id));
        }
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.send_resume(Resume::Continue)
    }

    async fn pause(&self) -> Result<()> {
        self.state.lock().pause_requested = true;
        Ok(())
    }

    async fn step_over(&self) -> Result<()> {
        self.send_resume(Resume::StepOver)
    }

    async fn step_into(&self) -> Result<()> {
        self.send_resume(Resume::StepInto)
    }

    async fn step_out(&self) -> Result<()> {
        self.send_resume(Resume::StepOut)
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value> {
        let commands = self
            .state
            .lock()
            .paused
            .as_ref()
            .map(|p| p.commands.clone())
            .ok_or(InspectorError::NotPaused)?;
        let (reply, response) = oneshot::channel();
        commands
            .send(PauseCommand::Evaluate {
                expression: expression.to_string(),
                reply,
            })
            .map_err(|_| InspectorError::Disconnected)?;
        response.await.map_err(|_| InspectorError::Disconnected)?
    }

    fn attach_console(&self, sink: Arc<dyn ConsoleSink>) {
        self.console.attach(sink);
    }

    fn subscribe(&self) -> broadcast::Receiver<DebugNotification> {
        self.notifications.subscribe()
    }

    fn detach(&self) {
        let mut state = self.state.lock();
        state.breakpoints.clear();
        state.stepping = Stepping::None;
        state.pause_requested = false;
        if let Some(paused) = state.paused.take() {
            let _ = paused.commands.send(PauseCommand::Resume(Resume::Continue));
        }
    }
}

fn stack_depth(lua: &Lua) -> usize {
    let mut depth = 0;
    while lua.inspect_stack(depth).is_some() {
        depth += 1;
    }
    depth
}

/// Evaluate `expression` with the paused frame's locals in scope.
fn evaluate_in_frame(
    lua: &Lua,
    chunk: &str,
    line: u32,
    expression: &str,
) -> Result<serde_json::Value> {
    let eval = || -> mlua::Result<serde_json::Value> {
        let env = lua.create_table()?;
        collect_locals(lua, chunk, line, &env)?;
        let meta = lua.create_table()?;
        meta.set("__index", lua.globals())?;
        env.set_metatable(Some(meta));

        let func = match lua
            .load(format!("return {expression}"))
            .set_name(EVAL_CHUNK_NAME)
            .set_environment(env.clone())
            .into_function()
        {
            Ok(func) => func,
            Err(_) => lua
                .load(expression)
                .set_name(EVAL_CHUNK_NAME)
                .set_environment(env)
                .into_function()?,
        };
        let value: Value = func.call(())?;
        Ok(render_value(lua, value))
    };
    eval().map_err(|e| InspectorError::Evaluation(e.to_string()))
}

/// Copy the locals of the frame executing `chunk:line` into `env`.
///
/// Frames are located by source and current line through the debug
/// library. Without it only globals are visible.
fn collect_locals(lua: &Lua, chunk: &str, line: u32, env: &Table<'_>) -> mlua::Result<()> {
    let Ok(debug_lib) = lua.named_registry_value::<Table>(DEBUG_LIBRARY_KEY) else {
        return Ok(());
    };
    let getinfo: Function = debug_lib.get("getinfo")?;
    let getlocal: Function = debug_lib.get("getlocal")?;

    for level in 1..MAX_FRAME_SCAN {
        let Value::Table(info) = getinfo.call::<_, Value>((level, "Sl"))? else {
            break;
        };
        let source: Option<String> = info.get("source")?;
        let current: Option<i64> = info.get("currentline")?;
        if source.as_deref() != Some(chunk) || current != Some(i64::from(line)) {
            continue;
        }
        for index in 1.. {
            let (name, value): (Option<String>, Value) = getlocal.call((level, index))?;
            let Some(name) = name else { break };
            // Internal slots such as "(for state)".
            if !name.starts_with('(') {
                env.set(name, value)?;
            }
        }
        break;
    }
    Ok(())
}

fn render_value(lua: &Lua, value: Value<'_>) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Function(_) | Value::Thread(_) | Value::UserData(_) | Value::LightUserData(_) => {
            serde_json::Value::String(format!("{}: {:p}", value.type_name(), value.to_pointer()))
        }
        other => {
            let type_name = other.type_name();
            lua.from_value(other)
                .unwrap_or_else(|_| serde_json::Value::String(format!("<{type_name}>")))
        }
    }
}
