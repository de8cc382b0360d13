//! Shared handle onto one execution cycle's Lua state.

use std::fmt;
use std::sync::{Arc, Weak};

use mlua::Lua;
use parking_lot::{Mutex, MutexGuard};

/// A Lua state shared between the engine and the handlers it produced.
///
/// The state stores a weak back-reference to its own handle so host
/// functions running inside it can hand out strong references to new
/// handlers without creating a cycle.
pub struct LuaVm {
    lua: Mutex<Lua>,
}

impl LuaVm {
    pub fn new(lua: Lua) -> Arc<Self> {
        let vm = Arc::new(Self {
            lua: Mutex::new(lua),
        });
        vm.lua.lock().set_app_data(Arc::downgrade(&vm));
        vm
    }

    /// Lock the state. Calls into the VM are serialised through this lock.
    pub fn lock(&self) -> MutexGuard<'_, Lua> {
        self.lua.lock()
    }

    /// Recover the handle from inside a host function.
    pub(crate) fn from_lua(lua: &Lua) -> mlua::Result<Arc<LuaVm>> {
        lua.app_data_ref::<Weak<LuaVm>>()
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| mlua::Error::RuntimeError("script VM handle is gone".into()))
    }
}

impl fmt::Debug for LuaVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaVm").finish_non_exhaustive()
    }
}
