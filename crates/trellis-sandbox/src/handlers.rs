//! Lua-backed implementations of the trigger handler seams.
//!
//! Each adapter keeps the Lua function in the VM registry plus a strong
//! handle to the VM. Calls run on the blocking pool: the VM is synchronous
//! and a debugger may park the calling thread at a breakpoint.

use std::sync::Arc;

use async_trait::async_trait;
use mlua::{Function, Lua, LuaSerdeExt, RegistryKey, Value};
use serde_json::Map;
use trellis_types::{
    HandlerContext, HandlerError, LifecycleContext, LifecycleHook, TriggerHandler,
    WebhookValidator,
};

use crate::vm::LuaVm;

/// A Lua function pinned in its VM's registry.
#[derive(Clone)]
pub struct LuaFunctionRef {
    vm: Arc<LuaVm>,
    key: Arc<RegistryKey>,
    label: Arc<str>,
}

impl LuaFunctionRef {
    /// Pin `func`, which must belong to the state guarded by `vm`.
    pub fn new<'lua>(
        vm: Arc<LuaVm>,
        lua: &'lua Lua,
        func: Function<'lua>,
        label: impl Into<Arc<str>>,
    ) -> mlua::Result<Self> {
        let key = lua.create_registry_value(func)?;
        Ok(Self {
            vm,
            key: Arc::new(key),
            label: label.into(),
        })
    }

    /// Pin `func` from inside a host function running on the VM.
    pub(crate) fn from_host<'lua>(
        lua: &'lua Lua,
        func: Function<'lua>,
        label: impl Into<Arc<str>>,
    ) -> mlua::Result<Self> {
        let vm = LuaVm::from_lua(lua)?;
        Self::new(vm, lua, func, label)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run `f` with the VM locked and the pinned function loaded.
    fn with_function<T>(
        &self,
        f: impl for<'lua> FnOnce(&'lua Lua, Function<'lua>) -> mlua::Result<T>,
    ) -> Result<T, HandlerError> {
        let guard = self.vm.lock();
        let lua: &Lua = &guard;
        lua.registry_value::<Function>(&self.key)
            .and_then(|func| f(lua, func))
            .map_err(|e| handler_error_from_lua(&e))
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, HandlerError>
where
    F: FnOnce() -> Result<T, HandlerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HandlerError::new(format!("handler task failed: {e}")))?
}

/// Convert a Lua error into a handler error, separating the traceback.
pub fn handler_error_from_lua(err: &mlua::Error) -> HandlerError {
    match err {
        mlua::Error::CallbackError { traceback, cause } => {
            let mut inner = handler_error_from_lua(cause);
            if inner.traceback.is_none() {
                inner.traceback = Some(traceback.clone());
            }
            inner
        }
        mlua::Error::RuntimeError(message) => split_traceback(message),
        other => split_traceback(&other.to_string()),
    }
}

fn split_traceback(text: &str) -> HandlerError {
    match text.find("\nstack traceback:") {
        Some(idx) => HandlerError::new(&text[..idx]).with_traceback(&text[idx + 1..]),
        None => HandlerError::new(text),
    }
}

/// Trigger handler backed by a Lua function `function(ctx, event)`.
pub struct LuaHandler(LuaFunctionRef);

impl LuaHandler {
    pub fn new(func: LuaFunctionRef) -> Self {
        Self(func)
    }
}

#[async_trait]
impl TriggerHandler for LuaHandler {
    async fn call(&self, ctx: HandlerContext, event: serde_json::Value) -> Result<(), HandlerError> {
        let func = self.0.clone();
        run_blocking(move || {
            func.with_function(|lua, f| {
                let ctx = lua.to_value(&ctx)?;
                let event = lua.to_value(&event)?;
                f.call::<_, ()>((ctx, event))
            })
        })
        .await
    }
}

/// Webhook validator backed by a Lua predicate `function(event) -> boolean`.
pub struct LuaValidator(LuaFunctionRef);

impl LuaValidator {
    pub fn new(func: LuaFunctionRef) -> Self {
        Self(func)
    }
}

#[async_trait]
impl WebhookValidator for LuaValidator {
    async fn validate(&self, event: &serde_json::Value) -> Result<bool, HandlerError> {
        let func = self.0.clone();
        let event = event.clone();
        run_blocking(move || {
            func.with_function(|lua, f| {
                let event = lua.to_value(&event)?;
                let verdict: Value = f.call(event)?;
                Ok(match verdict {
                    Value::Boolean(b) => b,
                    Value::Nil => false,
                    _ => true,
                })
            })
        })
        .await
    }
}

/// Lifecycle hook backed by `function(ctx)`.
///
/// `ctx.metadata` is a plain table; whatever it holds when the hook returns
/// is written back to the trigger's metadata.
pub struct LuaLifecycleHook(LuaFunctionRef);

impl LuaLifecycleHook {
    pub fn new(func: LuaFunctionRef) -> Self {
        Self(func)
    }
}

#[async_trait]
impl LifecycleHook for LuaLifecycleHook {
    async fn call(&self, ctx: LifecycleContext) -> Result<(), HandlerError> {
        let func = self.0.clone();
        run_blocking(move || {
            func.with_function(|lua, f| {
                let table = lua.create_table()?;
                table.set("url", ctx.url.as_str())?;
                table.set("path", ctx.path.as_str())?;
                table.set("method", ctx.method.as_str())?;
                let snapshot = serde_json::Value::Object(ctx.metadata.snapshot());
                table.set("metadata", lua.to_value(&snapshot)?)?;

                f.call::<_, ()>(table.clone())?;

                let written: Value = table.get("metadata")?;
                let values = match written {
                    Value::Nil => Map::new(),
                    other => match lua.from_value::<serde_json::Value>(other)? {
                        serde_json::Value::Object(map) => map,
                        _ => Map::new(),
                    },
                };
                ctx.metadata.replace(values);
                Ok(())
            })
        })
        .await
    }
}
