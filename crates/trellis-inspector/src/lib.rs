//! Debugger bridge for Trellis dev sessions.
//!
//! - [`LuaDebugSession`]: breakpoints, stepping and evaluation over the
//!   sandbox's line hook, exposed through the [`DebugSession`] trait
//! - [`Inspector`]: the websocket protocol endpoint (default port 9229)
//! - [`ErrorEnricher`]: handler failure reports with source context

pub mod enrich;
pub mod error;
pub mod lua_session;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sourcemap;

pub use enrich::{CONTEXT_LINES, ErrorEnricher, Frame, parse_frames, source_context};
pub use error::{InspectorError, Result};
pub use lua_session::LuaDebugSession;
pub use protocol::{Command, Notification, Request, Response};
pub use server::{DEFAULT_INSPECT_PORT, Inspector};
pub use session::{Breakpoint, DebugNotification, DebugSession, Location, PauseReason};
pub use sourcemap::{OriginalPosition, SourceMapRegistry};
