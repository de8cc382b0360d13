//! Sandboxed execution engine.
//!
//! Every call to [`SandboxEngine::execute`] builds a fresh Lua state,
//! strips it down to a safe subset, installs a `require` backed by the
//! project's [`ModuleResolver`](crate::ModuleResolver), and runs the entry
//! wrapper. Handlers registered during evaluation keep the state alive.
//!
//! # Hardening
//!
//! - `io`, `debug`, `dofile`, `loadfile`, `load` are removed
//! - `os` is reduced to `time`, `date`, `clock`
//! - `package.path` / `package.cpath` are emptied and searchers cleared
//! - module evaluation runs under an instruction budget

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use mlua::{
    AnyUserData, Debug, DebugEvent, HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, Table,
    Value,
};
use tracing::debug;
use trellis_types::{Trigger, UsedProvider};

use crate::console::{Console, ConsoleEntry, ConsoleLevel};
use crate::error::{Result, SandboxError};
use crate::loader::{PreparedProject, REGISTRY_MODULE, WRAPPER_CHUNK_NAME};
use crate::registry::Registry;
use crate::sdk::{self, TriggerHandle};
use crate::vm::LuaVm;

/// Default instruction budget for one module evaluation.
pub const DEFAULT_INSTRUCTION_BUDGET: u64 = 200_000_000;

/// Named registry slot holding the debug library when a line observer is attached.
pub const DEBUG_LIBRARY_KEY: &str = "trellis.debug";

const BUDGET_STEP: u32 = 10_000;
const HOST_MODULES_KEY: &str = "trellis.host_modules";
const REGISTRY_MODULE_KEY: &str = "trellis.registry_module";
const LOADED_KEY: &str = "trellis.loaded";

/// Receives a callback for every executed line. Used by debuggers.
///
/// The callback runs on the thread executing Lua and may block it.
pub trait LineObserver: Send + Sync {
    fn on_line(&self, lua: &Lua, debug: &Debug<'_>) -> mlua::Result<()>;
}

/// What a module evaluation produced.
pub struct ModuleExports {
    pub triggers: Vec<Arc<Trigger>>,
    pub providers: Vec<UsedProvider>,
    /// The state the handlers run on.
    pub vm: Arc<LuaVm>,
}

impl fmt::Debug for ModuleExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleExports")
            .field("triggers", &self.triggers)
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

/// Executes prepared projects in isolated Lua states.
#[derive(Clone)]
pub struct SandboxEngine {
    instruction_budget: u64,
    console: Console,
    observer: Option<Arc<dyn LineObserver>>,
}

impl Default for SandboxEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxEngine {
    pub fn new() -> Self {
        Self {
            instruction_budget: DEFAULT_INSTRUCTION_BUDGET,
            console: Console::new(),
            observer: None,
        }
    }

    pub fn with_instruction_budget(mut self, budget: u64) -> Self {
        self.instruction_budget = budget.max(u64::from(BUDGET_STEP));
        self
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    /// Attach a line observer. New states are created with the debug
    /// library stashed under [`DEBUG_LIBRARY_KEY`].
    pub fn with_line_observer(mut self, observer: Arc<dyn LineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Evaluate the project and collect its registrations.
    pub fn execute(&self, project: &PreparedProject, registry: &Registry) -> Result<ModuleExports> {
        let vm = LuaVm::new(self.create_state()?);
        let (triggers, providers) = {
            let lua = vm.lock();
            self.evaluate(&lua, project, registry)?
        };
        debug!(
            entry = project.entry(),
            triggers = triggers.len(),
            providers = providers.len(),
            "Module evaluation complete"
        );

        Ok(ModuleExports {
            triggers,
            providers,
            vm,
        })
    }

    fn evaluate(
        &self,
        lua: &Lua,
        project: &PreparedProject,
        registry: &Registry,
    ) -> Result<(Vec<Arc<Trigger>>, Vec<UsedProvider>)> {
        self.install_print(lua)?;
        install_require(lua, project, registry, &self.console)?;

        let exhausted = Arc::new(AtomicBool::new(false));
        self.install_evaluation_hook(lua, exhausted.clone());
        let result = lua
            .load(project.wrapper_source())
            .set_name(WRAPPER_CHUNK_NAME)
            .call::<_, Value>(());
        self.install_handler_hook(lua);

        // A caught budget error still ends the evaluation.
        if exhausted.load(Ordering::Relaxed) {
            return Err(SandboxError::BudgetExhausted(self.instruction_budget));
        }
        collect_exports(lua, result?, registry)
    }

    /// [`execute`](Self::execute) on the blocking pool.
    pub async fn execute_blocking(
        &self,
        project: PreparedProject,
        registry: Registry,
    ) -> Result<ModuleExports> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.execute(&project, &registry))
            .await
            .map_err(|e| SandboxError::Join(e.to_string()))?
    }

    fn create_state(&self) -> Result<Lua> {
        let lua = if self.observer.is_some() {
            // SAFETY: the debug library is moved from the globals into the
            // registry below and only the line observer reads it back.
            let lua = unsafe {
                Lua::unsafe_new_with(StdLib::ALL_SAFE | StdLib::DEBUG, LuaOptions::default())
            };
            let debug_lib: Value = lua.globals().get("debug")?;
            lua.set_named_registry_value(DEBUG_LIBRARY_KEY, debug_lib)?;
            lua
        } else {
            Lua::new()
        };
        harden_globals(&lua)?;
        Ok(lua)
    }

    fn install_print(&self, lua: &Lua) -> Result<()> {
        let console = self.console.clone();
        let print = lua.create_function(move |lua, args: mlua::MultiValue| {
            console.emit(
                ConsoleEntry::new(ConsoleLevel::Log, sdk::join_values(args))
                    .with_location(sdk::caller_location(lua)),
            );
            Ok(())
        })?;
        lua.globals().set("print", print)?;
        Ok(())
    }

    /// Count instructions while the module body runs. Once the budget is
    /// spent the hook fires on every instruction, so `pcall` cannot resume
    /// the script.
    fn install_evaluation_hook(&self, lua: &Lua, exhausted: Arc<AtomicBool>) {
        let budget = self.instruction_budget;
        let observer = self.observer.clone();
        let used = AtomicU64::new(0);
        let mut triggers = HookTriggers::new().every_nth_instruction(BUDGET_STEP);
        if observer.is_some() {
            triggers = triggers.every_line();
        }
        lua.set_hook(triggers, move |lua, debug| {
            match debug.event() {
                DebugEvent::Count => {
                    let total = used.fetch_add(u64::from(BUDGET_STEP), Ordering::Relaxed)
                        + u64::from(BUDGET_STEP);
                    if total > budget {
                        exhausted.store(true, Ordering::Relaxed);
                        lua.set_hook(HookTriggers::new().every_nth_instruction(1), move |_, _| {
                            Err(budget_error(budget))
                        });
                        return Err(budget_error(budget));
                    }
                }
                DebugEvent::Line => {
                    if let Some(observer) = &observer {
                        observer.on_line(lua, &debug)?;
                    }
                }
                _ => {}
            }
            Ok(())
        });
    }

    /// Handlers run without a budget; only the line observer stays attached.
    fn install_handler_hook(&self, lua: &Lua) {
        match &self.observer {
            Some(observer) => {
                let observer = observer.clone();
                lua.set_hook(HookTriggers::EVERY_LINE, move |lua, debug| {
                    observer.on_line(lua, &debug)
                });
            }
            None => lua.remove_hook(),
        }
    }
}

impl fmt::Debug for SandboxEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxEngine")
            .field("instruction_budget", &self.instruction_budget)
            .field("line_observer", &self.observer.is_some())
            .finish()
    }
}

fn budget_error(budget: u64) -> mlua::Error {
    mlua::Error::RuntimeError(format!("instruction budget of {budget} exhausted"))
}

fn harden_globals(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in ["io", "debug", "dofile", "loadfile", "load", "require"] {
        globals.set(name, Value::Nil)?;
    }

    let safe_os = lua.create_table()?;
    if let Value::Table(os) = globals.get::<_, Value>("os")? {
        for name in ["time", "date", "clock"] {
            safe_os.set(name, os.get::<_, Value>(name)?)?;
        }
    }
    globals.set("os", safe_os.clone())?;

    let loaded = lua.create_table()?;
    for name in ["string", "table", "math", "utf8", "coroutine"] {
        loaded.set(name, globals.get::<_, Value>(name)?)?;
    }
    loaded.set("os", safe_os)?;

    let package = lua.create_table()?;
    package.set("path", "")?;
    package.set("cpath", "")?;
    package.set("searchers", lua.create_table()?)?;
    package.set("loaded", loaded)?;
    globals.set("package", package)?;
    Ok(())
}

/// Install `require`: internal registry bridge, host modules, then user files.
fn install_require(
    lua: &Lua,
    project: &PreparedProject,
    registry: &Registry,
    console: &Console,
) -> Result<()> {
    lua.set_named_registry_value(HOST_MODULES_KEY, sdk::host_modules(lua, registry, console)?)?;
    lua.set_named_registry_value(
        REGISTRY_MODULE_KEY,
        sdk::registry_module(lua, registry, project.provider_configs().to_vec())?,
    )?;
    lua.set_named_registry_value(LOADED_KEY, lua.create_table()?)?;

    let resolver = project.resolver().clone();
    let require = lua.create_function(move |lua, name: String| {
        let caller = sdk::caller_chunk(lua);

        if name == REGISTRY_MODULE {
            if caller.as_deref() != Some(WRAPPER_CHUNK_NAME) {
                return Err(mlua::Error::RuntimeError(format!(
                    "module '{REGISTRY_MODULE}' is internal"
                )));
            }
            return lua.named_registry_value::<Value>(REGISTRY_MODULE_KEY);
        }

        let host: Table = lua.named_registry_value(HOST_MODULES_KEY)?;
        let host_module: Value = host.get(name.as_str())?;
        if !host_module.is_nil() {
            return Ok(host_module);
        }

        let from = caller.as_deref().and_then(|c| c.strip_prefix('@'));
        let module = resolver.resolve(from, &name).ok_or_else(|| {
            SandboxError::ModuleNotFound {
                name: name.clone(),
                from: from.map(str::to_string),
            }
            .into_lua()
        })?;

        let loaded: Table = lua.named_registry_value(LOADED_KEY)?;
        match loaded.get::<_, Value>(module.path.as_str())? {
            Value::Nil => {}
            Value::Boolean(false) => {
                return Err(mlua::Error::RuntimeError(format!(
                    "circular require of '{}'",
                    module.path
                )));
            }
            cached => return Ok(cached),
        }

        loaded.set(module.path.as_str(), false)?;
        let result = lua
            .load(&*module.source)
            .set_name(format!("@{}", module.path))
            .call::<_, Value>((name.as_str(), module.path.as_str()));
        match result {
            Ok(value) => {
                let stored = match value {
                    Value::Nil | Value::Boolean(false) => Value::Boolean(true),
                    other => other,
                };
                loaded.set(module.path.as_str(), stored.clone())?;
                Ok(stored)
            }
            Err(e) => {
                loaded.set(module.path.as_str(), Value::Nil)?;
                Err(e)
            }
        }
    })?;
    lua.globals().set("require", require)?;
    Ok(())
}

/// Read `default` (the trigger array) and `providers` from the wrapper's return value.
fn collect_exports(
    lua: &Lua,
    exports: Value<'_>,
    registry: &Registry,
) -> Result<(Vec<Arc<Trigger>>, Vec<UsedProvider>)> {
    let Value::Table(exports) = exports else {
        return Err(SandboxError::NoTriggersRegistered);
    };
    let Value::Table(list) = exports.get::<_, Value>("default")? else {
        return Err(SandboxError::NoTriggersRegistered);
    };

    let registered = registry.triggers();
    let mut triggers = Vec::new();
    for entry in list.sequence_values::<Value>() {
        let handle = match entry? {
            Value::UserData(ud) => handle_from_userdata(&ud)?,
            other => {
                return Err(SandboxError::InvalidTrigger(format!(
                    "export entry is a {}, not a trigger",
                    other.type_name()
                )));
            }
        };
        let trigger = registered
            .iter()
            .find(|t| t.id() == handle.id)
            .cloned()
            .ok_or_else(|| {
                SandboxError::InvalidTrigger(format!("trigger {} was not registered", handle.id))
            })?;
        triggers.push(trigger);
    }

    let providers = match exports.get::<_, Value>("providers")? {
        Value::Nil => Vec::new(),
        value => lua.from_value(value)?,
    };
    Ok((triggers, providers))
}

fn handle_from_userdata(ud: &AnyUserData<'_>) -> Result<TriggerHandle> {
    ud.borrow::<TriggerHandle>()
        .map(|h| h.clone())
        .map_err(|_| SandboxError::InvalidTrigger("export entry is not a trigger".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{ProjectLoader, VirtualProject};
    use crate::vfs::VirtualFs;
    use trellis_types::{ProviderConfig, TriggerKind};

    fn run(files: &[(&str, &str)], entry: &str) -> Result<ModuleExports> {
        run_with(SandboxEngine::new(), files, entry, Vec::new(), &Registry::new())
    }

    fn run_with(
        engine: SandboxEngine,
        files: &[(&str, &str)],
        entry: &str,
        configs: Vec<ProviderConfig>,
        registry: &Registry,
    ) -> Result<ModuleExports> {
        let fs: VirtualFs = files.iter().copied().collect();
        let prepared = ProjectLoader::new().prepare(VirtualProject::new(fs, entry), configs)?;
        engine.execute(&prepared, registry)
    }

    #[test]
    fn test_registers_each_trigger_kind() {
        let exports = run(
            &[(
                "main.lua",
                r#"
                local trellis = require("trellis")
                trellis.webhook { path = "/orders/", method = "put", handler = function() end }
                trellis.cron { expression = "*/5 * * * * *", handler = function() end }
                trellis.realtime { channel = "orders", messageType = "created", handler = function() end }
                "#,
            )],
            "main.lua",
        )
        .unwrap();

        let kinds: Vec<_> = exports.triggers.iter().map(|t| t.kind()).collect();
        assert_eq!(
            kinds,
            vec![TriggerKind::Webhook, TriggerKind::Cron, TriggerKind::Realtime]
        );
        let webhook = exports.triggers[0].as_webhook().unwrap();
        assert_eq!(webhook.path.as_deref(), Some("orders"));
        assert_eq!(webhook.method, "PUT");
        let realtime = exports.triggers[2].as_realtime().unwrap();
        assert_eq!(realtime.message_type.as_deref(), Some("created"));
    }

    #[test]
    fn test_modules_resolve_from_virtual_files() {
        let exports = run(
            &[
                (
                    "main.lua",
                    r#"
                    local routes = require("lib.routes")
                    local again = require("./lib/routes")
                    assert(routes == again, "module cache keyed by path")
                    routes.register()
                    "#,
                ),
                (
                    "lib/routes.lua",
                    r#"
                    local helper = require("./helper")
                    return {
                        register = function()
                            require("trellis").cron { expression = helper.every_minute, handler = function() end }
                        end,
                    }
                    "#,
                ),
                ("lib/helper.lua", r#"return { every_minute = "0 * * * * *" }"#),
            ],
            "main.lua",
        )
        .unwrap();
        assert_eq!(exports.triggers.len(), 1);
        assert_eq!(
            exports.triggers[0].as_cron().unwrap().expression,
            "0 * * * * *"
        );
    }

    #[test]
    fn test_host_filesystem_is_unreachable() {
        let err = run(&[("main.lua", r#"require("os_helpers")"#)], "main.lua").unwrap_err();
        assert!(err.to_string().contains("os_helpers"), "{err}");

        let exports = run(
            &[(
                "main.lua",
                r#"
                assert(io == nil)
                assert(debug == nil)
                assert(load == nil and loadfile == nil and dofile == nil)
                assert(os.execute == nil and os.getenv == nil)
                assert(type(os.time()) == "number")
                assert(package.path == "" and package.cpath == "")
                assert(package.loaded.io == nil)
                "#,
            )],
            "main.lua",
        )
        .unwrap();
        assert!(exports.triggers.is_empty());
    }

    #[test]
    fn test_registry_module_is_internal() {
        let err = run(
            &[("main.lua", r#"require("@trellis/registry")"#)],
            "main.lua",
        )
        .unwrap_err();
        assert!(err.to_string().contains("internal"), "{err}");
    }

    #[test]
    fn test_fresh_cycle_does_not_leak_registrations() {
        let registry = Registry::new();
        let files = [(
            "main.lua",
            r#"require("trellis").cron { expression = "* * * * * *", handler = function() end }"#,
        )];
        let first = run_with(SandboxEngine::new(), &files, "main.lua", Vec::new(), &registry).unwrap();
        let second = run_with(SandboxEngine::new(), &files, "main.lua", Vec::new(), &registry).unwrap();
        assert_eq!(first.triggers.len(), 1);
        assert_eq!(second.triggers.len(), 1);
        assert_eq!(registry.triggers().len(), 1);
        assert_ne!(first.triggers[0].id(), second.triggers[0].id());
    }

    #[test]
    fn test_provider_configs_injected_before_user_code() {
        let registry = Registry::new();
        let configs = vec![ProviderConfig {
            provider_type: "slack".into(),
            alias: "default".into(),
            config: serde_json::from_value(serde_json::json!({"bot_token": "xoxb-1"})).unwrap(),
        }];
        let exports = run_with(
            SandboxEngine::new(),
            &[(
                "main.lua",
                r#"
                local trellis = require("trellis")
                local slack = trellis.provider("slack", { secrets = { "bot_token" } })
                assert(slack.config.bot_token == "xoxb-1")
                assert(slack:secret("bot_token") == "xoxb-1")
                slack:webhook("onMessage", { channel_id = "C1" }, function() end)
                "#,
            )],
            "main.lua",
            configs,
            &registry,
        )
        .unwrap();

        assert_eq!(exports.providers.len(), 1);
        assert_eq!(exports.providers[0].provider_type, "slack");
        assert_eq!(exports.providers[0].secret_definitions[0].name, "bot_token");
        let meta = exports.triggers[0]
            .as_webhook()
            .unwrap()
            .provider_meta
            .clone()
            .unwrap();
        assert_eq!(meta.provider_alias, "default");
        assert_eq!(meta.trigger_type, "onMessage");
        assert_eq!(meta.input, serde_json::json!({"channel_id": "C1"}));
    }

    #[test]
    fn test_missing_secret_raises() {
        let err = run(
            &[(
                "main.lua",
                r#"require("trellis").provider("github"):secret("token")"#,
            )],
            "main.lua",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Missing secret 'token'"), "{err}");
    }

    #[test]
    fn test_used_providers_round_trip_through_bridge() {
        let registry = Registry::new();
        let fs: VirtualFs = [("main.lua", "")].into_iter().collect();
        let prepared = ProjectLoader::new()
            .prepare(VirtualProject::new(fs, "main.lua"), Vec::new())
            .unwrap();
        let engine = SandboxEngine::new();
        engine.execute(&prepared, &registry).unwrap();

        registry.track_provider_usage("jira", "default");
        registry.clear_used_providers();
        registry.track_provider_usage("slack", "default");
        assert_eq!(
            registry.used_providers(),
            vec![UsedProvider::new("slack", "default")]
        );
    }

    #[test]
    fn test_runaway_evaluation_is_stopped() {
        let engine = SandboxEngine::new().with_instruction_budget(100_000);
        let err = run_with(
            engine,
            &[("main.lua", "while true do end")],
            "main.lua",
            Vec::new(),
            &Registry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::BudgetExhausted(100_000)), "{err}");
    }

    #[test]
    fn test_budget_error_cannot_be_caught() {
        let engine = SandboxEngine::new().with_instruction_budget(100_000);
        let source = r#"
            while true do
                pcall(function() while true do end end)
            end
        "#;
        let err = run_with(engine, &[("main.lua", source)], "main.lua", Vec::new(), &Registry::new())
            .unwrap_err();
        assert!(matches!(err, SandboxError::BudgetExhausted(100_000)), "{err}");
    }

    #[test]
    fn test_budget_exhausted_even_when_module_swallows_error() {
        let engine = SandboxEngine::new().with_instruction_budget(100_000);
        let source = r#"
            local ok = pcall(function() while true do end end)
            return ok
        "#;
        let err = run_with(engine, &[("main.lua", source)], "main.lua", Vec::new(), &Registry::new())
            .unwrap_err();
        assert!(matches!(err, SandboxError::BudgetExhausted(100_000)), "{err}");
    }

    #[test]
    fn test_circular_require_is_reported() {
        let err = run(
            &[("main.lua", r#"require("a")"#), ("a.lua", r#"require("b")"#), ("b.lua", r#"require("a")"#)],
            "main.lua",
        )
        .unwrap_err();
        assert!(err.to_string().contains("circular require"), "{err}");
    }

    #[test]
    fn test_syntax_error_surfaces() {
        let err = run(&[("main.lua", "local = 1")], "main.lua").unwrap_err();
        assert!(matches!(err, SandboxError::Lua(_)));
    }

    #[tokio::test]
    async fn test_registered_handler_runs_after_evaluation() {
        let exports = run(
            &[(
                "main.lua",
                r#"
                local trellis = require("trellis")
                trellis.webhook {
                    handler = function(ctx, event)
                        if event.body.fail then error("requested failure") end
                    end,
                }
                "#,
            )],
            "main.lua",
        )
        .unwrap();
        let handler = exports.triggers[0].handler().clone();
        handler
            .call(Default::default(), serde_json::json!({"body": {"fail": false}}))
            .await
            .unwrap();
        let err = handler
            .call(Default::default(), serde_json::json!({"body": {"fail": true}}))
            .await
            .unwrap_err();
        assert!(err.message.contains("main.lua"), "{}", err.message);
        assert!(err.message.contains("requested failure"));
    }
}
