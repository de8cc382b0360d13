//! Dev-mode orchestration for Trellis.
//!
//! [`DevSession`] ties the sandbox, the event router, the backend client
//! and the inspector together for a single local project and keeps the
//! running trigger set in step with the sources on disk.

pub mod error;
pub mod providers;
pub mod session;
pub mod source;
pub mod watcher;

pub use error::{DevError, Result};
pub use providers::{MissingProvider, Prompter, ProviderValidator, TerminalPrompter};
pub use session::{DevOptions, DevSession, SessionState};
pub use source::{ProjectFiles, ProjectSource};
pub use watcher::{EntryWatcher, ReloadSignal, WatcherHandle};
