//! Host modules available to user code.
//!
//! `require("trellis")` is the only way user code reaches the host:
//!
//! ```lua
//! local trellis = require("trellis")
//!
//! trellis.webhook {
//!     path = "orders",
//!     method = "POST",
//!     validation = function(event) return event.headers["x-token"] == "s3cret" end,
//!     handler = function(ctx, event) trellis.log.info("order", event.body.id) end,
//! }
//!
//! trellis.cron { expression = "0 */5 * * * *", handler = function(ctx, event) end }
//! trellis.realtime { channel = "orders", messageType = "created", handler = function(ctx, event) end }
//!
//! local slack = trellis.provider("slack", { alias = "default", secrets = { "bot_token" } })
//! slack:webhook("onMessage", { channel_id = "C1" }, function(ctx, event) end)
//! ```
//!
//! `trellis.json` (also reachable as `require("trellis.json")`) provides
//! `encode`/`decode`; `trellis.env(name)` reads `TRELLIS_PUBLIC_*` variables.
//!
//! The engine also installs `@trellis/registry`, the internal bridge used by
//! the entry wrapper. It is not reachable from user files.

use std::sync::Arc;

use mlua::{
    Function, Lua, LuaSerdeExt, MetaMethod, MultiValue, Table, UserData, UserDataFields,
    UserDataMethods, Value,
};
use trellis_types::{
    DEFAULT_PROVIDER_ALIAS, ProviderConfig, ProviderMeta, SecretDefinition, Trigger, TriggerId,
    TriggerKind, UsedProvider, WebhookSpec, provider_key,
};

use crate::console::{Console, ConsoleEntry, ConsoleLevel};
use crate::error::SandboxError;
use crate::handlers::{LuaFunctionRef, LuaHandler, LuaLifecycleHook, LuaValidator};
use crate::registry::{Registry, WeakRegistry};

/// Names resolved to host modules before any user file.
pub const HOST_MODULES: &[&str] = &["trellis", "trellis.json"];

/// Only environment variables with this prefix are visible to user code.
pub const PUBLIC_ENV_PREFIX: &str = "TRELLIS_PUBLIC_";

fn runtime_error(message: impl Into<String>) -> mlua::Error {
    mlua::Error::RuntimeError(message.into())
}

fn live_registry(weak: &WeakRegistry) -> mlua::Result<Registry> {
    weak.upgrade()
        .ok_or_else(|| runtime_error("registrations are closed for this execution cycle"))
}

/// Lua-side view of a registered trigger.
#[derive(Debug, Clone)]
pub(crate) struct TriggerHandle {
    pub(crate) id: TriggerId,
    kind: TriggerKind,
    description: String,
}

impl From<&Trigger> for TriggerHandle {
    fn from(trigger: &Trigger) -> Self {
        Self {
            id: trigger.id(),
            kind: trigger.kind(),
            description: trigger.describe(),
        }
    }
}

impl UserData for TriggerHandle {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("type", |_, this| Ok(this.kind.as_str()));
        fields.add_field_method_get("id", |_, this| Ok(this.id.to_string()));
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(this.description.clone())
        });
    }
}

/// Object returned by `trellis.provider(type, opts)`.
struct ProviderHandle {
    provider_type: String,
    alias: String,
    config: Option<ProviderConfig>,
    registry: WeakRegistry,
}

impl ProviderHandle {
    fn secret(&self, name: &str) -> Result<String, SandboxError> {
        let value = self.config.as_ref().and_then(|c| c.config.get(name));
        match value {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            Some(serde_json::Value::Bool(b)) => Ok(b.to_string()),
            _ => Err(SandboxError::MissingSecret {
                provider: provider_key(&self.provider_type, &self.alias),
                name: name.to_string(),
            }),
        }
    }
}

impl UserData for ProviderHandle {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("type", |_, this| Ok(this.provider_type.clone()));
        fields.add_field_method_get("alias", |_, this| Ok(this.alias.clone()));
        fields.add_field_method_get("config", |lua, this| match &this.config {
            Some(config) => lua.to_value(&config.config),
            None => Ok(Value::Nil),
        });
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("secret", |_, this, name: String| {
            this.secret(&name).map_err(SandboxError::into_lua)
        });

        methods.add_method(
            "webhook",
            |lua, this, (trigger_type, input, handler, opts): (String, Value, Function, Option<Table>)| {
                let registry = live_registry(&this.registry)?;
                let input = match input {
                    Value::Nil => serde_json::Value::Object(Default::default()),
                    other => lua.from_value(other)?,
                };
                let meta = ProviderMeta {
                    provider_type: this.provider_type.clone(),
                    provider_alias: this.alias.clone(),
                    trigger_type,
                    input,
                };
                let spec = match &opts {
                    Some(opts) => webhook_spec(lua, opts)?,
                    None => WebhookSpec::new(),
                }
                .with_provider_meta(meta);
                let label = format!("{}:{} webhook", this.provider_type, this.alias);
                let handler = LuaFunctionRef::from_host(lua, handler, label)?;
                let trigger =
                    registry.register_trigger(Trigger::webhook(spec, Arc::new(LuaHandler::new(handler))));
                Ok(TriggerHandle::from(trigger.as_ref()))
            },
        );

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("provider {}:{}", this.provider_type, this.alias))
        });
    }
}

fn optional_function<'lua>(table: &Table<'lua>, key: &str) -> mlua::Result<Option<Function<'lua>>> {
    match table.get::<_, Value>(key)? {
        Value::Nil => Ok(None),
        Value::Function(f) => Ok(Some(f)),
        other => Err(runtime_error(format!(
            "'{key}' must be a function, got {}",
            other.type_name()
        ))),
    }
}

fn required_function<'lua>(table: &Table<'lua>, key: &str, what: &str) -> mlua::Result<Function<'lua>> {
    optional_function(table, key)?
        .ok_or_else(|| runtime_error(format!("{what}: '{key}' function is required")))
}

fn optional_string(table: &Table<'_>, keys: &[&str]) -> mlua::Result<Option<String>> {
    for key in keys {
        if let Some(value) = table.get::<_, Option<String>>(*key)? {
            if !value.trim().is_empty() {
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}

fn webhook_spec<'lua>(lua: &'lua Lua, opts: &Table<'lua>) -> mlua::Result<WebhookSpec> {
    let mut spec = WebhookSpec::new();
    if let Some(path) = optional_string(opts, &["path"])? {
        let trimmed = path.trim().trim_matches('/');
        if !trimmed.is_empty() {
            spec = spec.with_path(trimmed);
        }
    }
    if let Some(method) = optional_string(opts, &["method"])? {
        spec = spec.with_method(method.trim());
    }
    if let Some(f) = optional_function(opts, "validation")? {
        let f = LuaFunctionRef::from_host(lua, f, "webhook validation")?;
        spec = spec.with_validation(Arc::new(LuaValidator::new(f)));
    }
    if let Some(f) = optional_function(opts, "setup")? {
        let f = LuaFunctionRef::from_host(lua, f, "webhook setup")?;
        spec = spec.with_setup(Arc::new(LuaLifecycleHook::new(f)));
    }
    if let Some(f) = optional_function(opts, "teardown")? {
        let f = LuaFunctionRef::from_host(lua, f, "webhook teardown")?;
        spec = spec.with_teardown(Arc::new(LuaLifecycleHook::new(f)));
    }
    Ok(spec)
}

/// `secrets = { "token", { name = "key", description = "...", required = false } }`
fn secret_definitions(value: Value<'_>) -> mlua::Result<Vec<SecretDefinition>> {
    let table = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Table(table) => table,
        other => {
            return Err(runtime_error(format!(
                "provider: 'secrets' must be a table, got {}",
                other.type_name()
            )));
        }
    };
    let mut definitions = Vec::new();
    for entry in table.sequence_values::<Value>() {
        match entry? {
            Value::String(name) => definitions.push(SecretDefinition::new(name.to_str()?)),
            Value::Table(def) => {
                let name: String = def.get("name")?;
                definitions.push(SecretDefinition {
                    name,
                    description: def.get("description")?,
                    required: def.get::<_, Option<bool>>("required")?.unwrap_or(true),
                });
            }
            other => {
                return Err(runtime_error(format!(
                    "provider: secret entries must be strings or tables, got {}",
                    other.type_name()
                )));
            }
        }
    }
    Ok(definitions)
}

fn display_value(value: &Value<'_>) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().into_owned(),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()),
    }
}

pub(crate) fn join_values(args: MultiValue<'_>) -> String {
    args.into_iter()
        .map(|v| display_value(&v))
        .collect::<Vec<_>>()
        .join("\t")
}

/// `file:line` of the Lua function that called the current host function.
pub(crate) fn caller_location(lua: &Lua) -> Option<String> {
    let debug = lua.inspect_stack(1)?;
    let line = debug.curr_line();
    let source = debug.source();
    let file = source.short_src?;
    if line > 0 {
        Some(format!("{file}:{line}"))
    } else {
        Some(file.into_owned())
    }
}

/// Raw chunk name of the caller, e.g. `@lib/util.lua` or `=trellis:entry`.
pub(crate) fn caller_chunk(lua: &Lua) -> Option<String> {
    let debug = lua.inspect_stack(1)?;
    let source = debug.source();
    source.source.map(|s| s.into_owned())
}

fn json_module(lua: &Lua) -> mlua::Result<Table<'_>> {
    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|lua, value: Value| {
            let value: serde_json::Value = lua.from_value(value)?;
            serde_json::to_string(&value).map_err(mlua::Error::external)
        })?,
    )?;
    json.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let value: serde_json::Value =
                serde_json::from_str(&text).map_err(mlua::Error::external)?;
            lua.to_value(&value)
        })?,
    )?;
    Ok(json)
}

fn log_module<'lua>(lua: &'lua Lua, console: &Console) -> mlua::Result<Table<'lua>> {
    let log = lua.create_table()?;
    for (name, level) in [
        ("debug", ConsoleLevel::Debug),
        ("info", ConsoleLevel::Info),
        ("warn", ConsoleLevel::Warn),
        ("error", ConsoleLevel::Error),
    ] {
        let console = console.clone();
        let f = lua.create_function(move |lua, args: MultiValue| {
            console.emit(ConsoleEntry::new(level, join_values(args)).with_location(caller_location(lua)));
            Ok(())
        })?;
        log.set(name, f)?;
    }
    Ok(log)
}

fn trellis_module<'lua>(
    lua: &'lua Lua,
    registry: &Registry,
    console: &Console,
    json: Table<'lua>,
) -> mlua::Result<Table<'lua>> {
    let module = lua.create_table()?;

    let weak = registry.downgrade();
    module.set(
        "webhook",
        lua.create_function(move |lua, opts: Table| {
            let registry = live_registry(&weak)?;
            let handler = required_function(&opts, "handler", "webhook")?;
            let spec = webhook_spec(lua, &opts)?;
            let handler = LuaFunctionRef::from_host(lua, handler, "webhook")?;
            let trigger =
                registry.register_trigger(Trigger::webhook(spec, Arc::new(LuaHandler::new(handler))));
            Ok(TriggerHandle::from(trigger.as_ref()))
        })?,
    )?;

    let weak = registry.downgrade();
    module.set(
        "cron",
        lua.create_function(move |lua, opts: Table| {
            let registry = live_registry(&weak)?;
            let expression = optional_string(&opts, &["expression", "schedule"])?
                .ok_or_else(|| runtime_error("cron: 'expression' is required"))?;
            let handler = required_function(&opts, "handler", "cron")?;
            let handler = LuaFunctionRef::from_host(lua, handler, "cron")?;
            let trigger = registry.register_trigger(Trigger::cron(
                expression.trim(),
                Arc::new(LuaHandler::new(handler)),
            ));
            Ok(TriggerHandle::from(trigger.as_ref()))
        })?,
    )?;

    let weak = registry.downgrade();
    module.set(
        "realtime",
        lua.create_function(move |lua, opts: Table| {
            let registry = live_registry(&weak)?;
            let channel = optional_string(&opts, &["channel"])?
                .ok_or_else(|| runtime_error("realtime: 'channel' is required"))?;
            let message_type = optional_string(&opts, &["messageType", "message_type"])?;
            let handler = required_function(&opts, "handler", "realtime")?;
            let handler = LuaFunctionRef::from_host(lua, handler, "realtime")?;
            let trigger = registry.register_trigger(Trigger::realtime(
                channel,
                message_type,
                Arc::new(LuaHandler::new(handler)),
            ));
            Ok(TriggerHandle::from(trigger.as_ref()))
        })?,
    )?;

    let weak = registry.downgrade();
    module.set(
        "provider",
        lua.create_function(move |_, (provider_type, opts): (String, Option<Table>)| {
            let registry = live_registry(&weak)?;
            let (alias, secrets) = match &opts {
                Some(opts) => (
                    optional_string(opts, &["alias"])?,
                    secret_definitions(opts.get("secrets")?)?,
                ),
                None => (None, Vec::new()),
            };
            let alias = alias.unwrap_or_else(|| DEFAULT_PROVIDER_ALIAS.to_string());

            let mut used = UsedProvider::new(&provider_type, &alias);
            used.secret_definitions = secrets;
            registry.track_provider(used);

            let config = registry.provider_config(&provider_type, &alias);
            Ok(ProviderHandle {
                provider_type,
                alias,
                config,
                registry: weak.clone(),
            })
        })?,
    )?;

    module.set("log", log_module(lua, console)?)?;
    module.set("json", json)?;
    module.set(
        "env",
        lua.create_function(|_, name: String| {
            if !name.starts_with(PUBLIC_ENV_PREFIX) {
                return Err(runtime_error(format!(
                    "env: only {PUBLIC_ENV_PREFIX}* variables are readable, got '{name}'"
                )));
            }
            Ok(std::env::var(&name).ok())
        })?,
    )?;

    Ok(module)
}

/// Table of whitelisted host modules keyed by `require` name.
pub(crate) fn host_modules<'lua>(
    lua: &'lua Lua,
    registry: &Registry,
    console: &Console,
) -> mlua::Result<Table<'lua>> {
    let modules = lua.create_table()?;
    let json = json_module(lua)?;
    modules.set("trellis", trellis_module(lua, registry, console, json.clone())?)?;
    modules.set("trellis.json", json)?;
    Ok(modules)
}

/// The `@trellis/registry` bridge driven by the entry wrapper.
pub(crate) fn registry_module<'lua>(
    lua: &'lua Lua,
    registry: &Registry,
    provider_configs: Vec<ProviderConfig>,
) -> mlua::Result<Table<'lua>> {
    let module = lua.create_table()?;

    let weak = registry.downgrade();
    module.set(
        "clear",
        lua.create_function(move |_, ()| {
            live_registry(&weak)?.clear();
            Ok(())
        })?,
    )?;

    let weak = registry.downgrade();
    module.set(
        "inject_provider_configs",
        lua.create_function(move |_, ()| {
            live_registry(&weak)?.inject_provider_configs(provider_configs.clone());
            Ok(())
        })?,
    )?;

    let weak = registry.downgrade();
    module.set(
        "track_provider_usage",
        lua.create_function(move |_, (provider_type, alias): (String, Option<String>)| {
            let alias = alias.unwrap_or_else(|| DEFAULT_PROVIDER_ALIAS.to_string());
            live_registry(&weak)?.track_provider_usage(&provider_type, &alias);
            Ok(())
        })?,
    )?;

    let weak = registry.downgrade();
    module.set(
        "clear_used_providers",
        lua.create_function(move |_, ()| {
            live_registry(&weak)?.clear_used_providers();
            Ok(())
        })?,
    )?;

    let weak = registry.downgrade();
    module.set(
        "used_providers",
        lua.create_function(move |lua, ()| lua.to_value(&live_registry(&weak)?.used_providers()))?,
    )?;

    let weak = registry.downgrade();
    module.set(
        "export",
        lua.create_function(move |lua, ()| {
            let registry = live_registry(&weak)?;
            let triggers = registry.triggers();
            let handles =
                lua.create_sequence_from(triggers.iter().map(|t| TriggerHandle::from(t.as_ref())))?;
            let exports = lua.create_table()?;
            exports.set("default", handles.clone())?;
            exports.set("triggers", handles)?;
            exports.set("providers", lua.to_value(&registry.used_providers())?)?;
            Ok(exports)
        })?,
    )?;

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua_with_sdk(registry: &Registry) -> Lua {
        let lua = Lua::new();
        {
            let modules = host_modules(&lua, registry, &Console::new()).unwrap();
            let trellis: Table = modules.get("trellis").unwrap();
            lua.globals().set("trellis", trellis).unwrap();
        }
        lua
    }

    #[test]
    fn test_secret_definitions_forms() {
        let lua = Lua::new();
        let value: Value = lua
            .load(r#"return { "bot_token", { name = "team", required = false, description = "Team id" } }"#)
            .eval()
            .unwrap();
        let defs = secret_definitions(value).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "bot_token");
        assert!(defs[0].required);
        assert_eq!(defs[1].description.as_deref(), Some("Team id"));
        assert!(!defs[1].required);
    }

    #[test]
    fn test_secret_lookup() {
        let handle = ProviderHandle {
            provider_type: "slack".into(),
            alias: "default".into(),
            config: Some(ProviderConfig {
                provider_type: "slack".into(),
                alias: "default".into(),
                config: serde_json::from_value(serde_json::json!({"bot_token": "xoxb", "empty": ""}))
                    .unwrap(),
            }),
            registry: Registry::new().downgrade(),
        };
        assert_eq!(handle.secret("bot_token").unwrap(), "xoxb");
        assert!(matches!(
            handle.secret("empty"),
            Err(SandboxError::MissingSecret { .. })
        ));
        assert!(matches!(
            handle.secret("absent"),
            Err(SandboxError::MissingSecret { .. })
        ));
    }

    #[test]
    fn test_env_is_limited_to_public_prefix() {
        let registry = Registry::new();
        let lua = lua_with_sdk(&registry);
        let err = lua
            .load(r#"return trellis.env("HOME")"#)
            .eval::<Option<String>>()
            .unwrap_err();
        assert!(err.to_string().contains(PUBLIC_ENV_PREFIX));

        let missing: Option<String> = lua
            .load(r#"return trellis.env("TRELLIS_PUBLIC_SURELY_UNSET_VAR")"#)
            .eval()
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let registry = Registry::new();
        let lua = lua_with_sdk(&registry);
        let id: i64 = lua
            .load(r#"return trellis.json.decode(trellis.json.encode({ id = 7 })).id"#)
            .eval()
            .unwrap();
        assert_eq!(id, 7);
    }

    #[test]
    fn test_display_value() {
        let lua = Lua::new();
        let s = lua.create_string("hi").unwrap();
        assert_eq!(display_value(&Value::String(s)), "hi");
        assert_eq!(display_value(&Value::Nil), "nil");
        assert_eq!(display_value(&Value::Integer(3)), "3");
    }
}
