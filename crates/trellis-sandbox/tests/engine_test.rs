//! Integration tests for SandboxEngine.

use std::sync::Arc;

use parking_lot::Mutex;
use trellis_sandbox::mlua::{Debug, Lua, Table};
use trellis_sandbox::{
    ConsoleEntry, ConsoleLevel, ConsoleSink, DEBUG_LIBRARY_KEY, LineObserver, ModuleExports,
    ProjectLoader, Registry, SandboxEngine, SandboxError, VirtualFs, VirtualProject,
};
use trellis_types::{HandlerContext, LifecycleContext, WebhookMetadata};

fn project(files: &[(&str, &str)]) -> trellis_sandbox::PreparedProject {
    let fs: VirtualFs = files.iter().copied().collect();
    ProjectLoader::new()
        .prepare(VirtualProject::new(fs, "main.lua"), Vec::new())
        .expect("prepare failed")
}

fn execute(engine: &SandboxEngine, files: &[(&str, &str)]) -> ModuleExports {
    engine
        .execute(&project(files), &Registry::new())
        .expect("execution failed")
}

#[derive(Default)]
struct Collect(Mutex<Vec<ConsoleEntry>>);

impl ConsoleSink for Collect {
    fn emit(&self, entry: &ConsoleEntry) {
        self.0.lock().push(entry.clone());
    }
}

#[derive(Default)]
struct LineRecorder {
    lines: Mutex<Vec<(String, i32)>>,
    saw_debug_library: Mutex<bool>,
}

impl LineObserver for LineRecorder {
    fn on_line(&self, lua: &Lua, debug: &Debug<'_>) -> trellis_sandbox::mlua::Result<()> {
        let source = debug.source();
        if let Some(src) = source.short_src {
            self.lines.lock().push((src.into_owned(), debug.curr_line()));
        }
        if lua.named_registry_value::<Table>(DEBUG_LIBRARY_KEY).is_ok() {
            *self.saw_debug_library.lock() = true;
        }
        Ok(())
    }
}

#[test]
fn test_print_and_log_reach_console_sinks() {
    let engine = SandboxEngine::new();
    let sink = Arc::new(Collect::default());
    engine.console().attach(sink.clone());

    execute(
        &engine,
        &[(
            "main.lua",
            "print('hello', 42)\nrequire('trellis').log.warn('careful')\n",
        )],
    );

    let entries = sink.0.lock();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].level, ConsoleLevel::Log);
    assert_eq!(entries[0].message, "hello\t42");
    assert_eq!(entries[0].location.as_deref(), Some("main.lua:1"));
    assert_eq!(entries[1].level, ConsoleLevel::Warn);
    assert_eq!(entries[1].message, "careful");
}

#[tokio::test]
async fn test_webhook_validation_and_lifecycle_hooks() {
    let exports = execute(
        &SandboxEngine::new(),
        &[(
            "main.lua",
            r#"
            local trellis = require("trellis")
            trellis.webhook {
                path = "github",
                validation = function(event) return event.headers["x-token"] == "s3cret" end,
                setup = function(ctx) ctx.metadata.hook_id = 7 end,
                teardown = function(ctx) ctx.metadata.hook_id = nil end,
                handler = function(ctx, event) end,
            }
            "#,
        )],
    );

    let spec = exports.triggers[0].as_webhook().unwrap().clone();
    let validator = spec.validation.clone().unwrap();
    assert!(
        validator
            .validate(&serde_json::json!({"headers": {"x-token": "s3cret"}}))
            .await
            .unwrap()
    );
    assert!(
        !validator
            .validate(&serde_json::json!({"headers": {}}))
            .await
            .unwrap()
    );

    let metadata = WebhookMetadata::new();
    let ctx = LifecycleContext {
        url: "http://localhost:3000/webhook/github".into(),
        path: "github".into(),
        method: "POST".into(),
        metadata: metadata.clone(),
    };
    spec.setup.clone().unwrap().call(ctx.clone()).await.unwrap();
    assert_eq!(metadata.get("hook_id"), Some(serde_json::json!(7)));
    spec.teardown.clone().unwrap().call(ctx).await.unwrap();
    assert_eq!(metadata.get("hook_id"), None);
}

#[tokio::test]
async fn test_missing_secret_raised_when_handler_reads_it() {
    let exports = execute(
        &SandboxEngine::new(),
        &[(
            "main.lua",
            r#"
            local trellis = require("trellis")
            local github = trellis.provider("github", { alias = "work" })
            trellis.cron {
                expression = "0 * * * * *",
                handler = function(ctx, event) return github:secret("token") end,
            }
            "#,
        )],
    );

    let err = exports.triggers[0]
        .handler()
        .call(HandlerContext::new(), serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(err.message.contains("Missing secret 'token'"), "{}", err.message);
    assert!(err.message.contains("github:work"), "{}", err.message);
}

#[tokio::test]
async fn test_execute_blocking_runs_off_the_runtime() {
    let exports = SandboxEngine::new()
        .execute_blocking(
            project(&[(
                "main.lua",
                r#"require("trellis").realtime { channel = "orders", handler = function() end }"#,
            )]),
            Registry::new(),
        )
        .await
        .unwrap();
    assert_eq!(exports.triggers.len(), 1);
    assert_eq!(exports.triggers[0].as_realtime().unwrap().channel, "orders");
}

#[test]
fn test_line_observer_sees_user_lines() {
    let recorder = Arc::new(LineRecorder::default());
    let engine = SandboxEngine::new().with_line_observer(recorder.clone());

    execute(
        &engine,
        &[(
            "main.lua",
            "local a = 1\nlocal b = a + 1\nassert(debug == nil)\n",
        )],
    );

    let lines = recorder.lines.lock();
    assert!(lines.contains(&("main.lua".to_string(), 1)));
    assert!(lines.contains(&("main.lua".to_string(), 2)));
    assert!(*recorder.saw_debug_library.lock());
}

#[test]
fn test_missing_entry_is_rejected() {
    let fs: VirtualFs = [("lib.lua", "return {}")].into_iter().collect();
    let err = ProjectLoader::new()
        .prepare(VirtualProject::new(fs, "main.lua"), Vec::new())
        .unwrap_err();
    assert!(matches!(err, SandboxError::EntryNotFound(_)));
}

#[test]
fn test_invalid_trigger_declaration_is_rejected() {
    let err = SandboxEngine::new()
        .execute(
            &project(&[("main.lua", r#"require("trellis").cron { handler = function() end }"#)]),
            &Registry::new(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("expression"), "{err}");
}
