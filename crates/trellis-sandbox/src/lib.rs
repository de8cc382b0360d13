//! Virtual project loading and sandboxed execution for Trellis workflows.
//!
//! A workflow is a set of Lua files held in memory. [`ProjectLoader`]
//! prepares them, [`SandboxEngine`] evaluates the entry file in a fresh,
//! hardened Lua state and returns every trigger registered through the
//! `trellis` host module.
//!
//! ```rust,ignore
//! let files: VirtualFs = [("main.lua", source)].into_iter().collect();
//! let project = ProjectLoader::new().prepare(VirtualProject::new(files, "main.lua"), configs)?;
//! let exports = SandboxEngine::new().execute(&project, &Registry::new())?;
//! ```

pub mod console;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod loader;
pub mod registry;
pub mod sdk;
pub mod vfs;
pub mod vm;

pub use console::{Console, ConsoleEntry, ConsoleLevel, ConsoleSink};
pub use engine::{
    DEBUG_LIBRARY_KEY, DEFAULT_INSTRUCTION_BUDGET, LineObserver, ModuleExports, SandboxEngine,
};
pub use error::{Result, SandboxError};
pub use handlers::{
    LuaFunctionRef, LuaHandler, LuaLifecycleHook, LuaValidator, handler_error_from_lua,
};
pub use loader::{PreparedProject, ProjectLoader, REGISTRY_MODULE, VirtualProject};
pub use registry::{Registry, WeakRegistry};
pub use vfs::{ModuleResolver, ResolvedModule, VfsResolver, VirtualFs, normalize_path};
pub use vm::LuaVm;

// Re-exported for line observers.
pub use mlua;
