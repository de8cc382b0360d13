//! Handler, validator, and lifecycle-hook seams.
//!
//! User code is opaque to the runtime: it only ever sees these traits. The
//! sandbox supplies Lua-backed implementations; tests and embedders can use
//! the closure adapters at the bottom of this module.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Context map handed to every handler invocation. Empty for now.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerContext(Map<String, Value>);

impl HandlerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Failure raised by user code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Script stack traceback, when the failure came out of the sandbox.
    pub traceback: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

/// The function bound to a trigger.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn call(&self, ctx: HandlerContext, event: Value) -> Result<(), HandlerError>;
}

/// Webhook request validation. `Ok(false)` and `Err(_)` are both rejections.
#[async_trait]
pub trait WebhookValidator: Send + Sync {
    async fn validate(&self, event: &Value) -> Result<bool, HandlerError>;
}

/// Webhook `setup` / `teardown` hook.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn call(&self, ctx: LifecycleContext) -> Result<(), HandlerError>;
}

/// Scratch space shared between a webhook's `setup` and `teardown` hooks.
///
/// Cloning yields another handle onto the same map.
#[derive(Clone, Default)]
pub struct WebhookMetadata(Arc<Mutex<Map<String, Value>>>);

impl WebhookMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.0.lock().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.0.lock().clone()
    }

    pub fn replace(&self, values: Map<String, Value>) {
        *self.0.lock() = values;
    }
}

impl fmt::Debug for WebhookMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WebhookMetadata").field(&*self.0.lock()).finish()
    }
}

/// Argument passed to lifecycle hooks.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    /// Externally reachable URL of the webhook.
    pub url: String,
    /// Path below `/webhook`, without leading slash.
    pub path: String,
    pub method: String,
    pub metadata: WebhookMetadata,
}

impl LifecycleContext {
    /// JSON view handed to script hooks. Metadata is a snapshot.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "url": self.url,
            "path": self.path,
            "method": self.method,
            "metadata": Value::Object(self.metadata.snapshot()),
        })
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TriggerHandler for FnHandler<F>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn call(&self, ctx: HandlerContext, event: Value) -> Result<(), HandlerError> {
        (self.0)(ctx, event).await
    }
}

/// Wrap an async closure as a [`TriggerHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TriggerHandler>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnValidator<F>(F);

#[async_trait]
impl<F> WebhookValidator for FnValidator<F>
where
    F: Fn(&Value) -> Result<bool, HandlerError> + Send + Sync,
{
    async fn validate(&self, event: &Value) -> Result<bool, HandlerError> {
        (self.0)(event)
    }
}

/// Wrap a synchronous predicate as a [`WebhookValidator`].
pub fn validator_fn<F>(f: F) -> Arc<dyn WebhookValidator>
where
    F: Fn(&Value) -> Result<bool, HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnValidator(f))
}

struct FnHook<F>(F);

#[async_trait]
impl<F, Fut> LifecycleHook for FnHook<F>
where
    F: Fn(LifecycleContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn call(&self, ctx: LifecycleContext) -> Result<(), HandlerError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`LifecycleHook`].
pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn LifecycleHook>
where
    F: Fn(LifecycleContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHook(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |_ctx, event| {
            let counter = counter.clone();
            async move {
                assert_eq!(event["n"], 1);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        handler
            .call(HandlerContext::new(), serde_json::json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validator_fn() {
        let validator = validator_fn(|event| Ok(event.get("ok").is_some()));
        assert!(validator.validate(&serde_json::json!({"ok": 1})).await.unwrap());
        assert!(!validator.validate(&serde_json::json!({})).await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_shared_between_clones() {
        let metadata = WebhookMetadata::new();
        let ctx = LifecycleContext {
            url: "http://localhost/webhook/a".into(),
            path: "a".into(),
            method: "POST".into(),
            metadata: metadata.clone(),
        };
        let hook = hook_fn(|ctx: LifecycleContext| async move {
            ctx.metadata.set("remote_id", serde_json::json!("wh_1"));
            Ok(())
        });
        hook.call(ctx).await.unwrap();
        assert_eq!(metadata.get("remote_id"), Some(serde_json::json!("wh_1")));
    }

    #[test]
    fn test_lifecycle_context_value() {
        let metadata = WebhookMetadata::new();
        metadata.set("k", serde_json::json!(1));
        let ctx = LifecycleContext {
            url: "u".into(),
            path: "p".into(),
            method: "POST".into(),
            metadata,
        };
        let value = ctx.to_value();
        assert_eq!(value["url"], "u");
        assert_eq!(value["metadata"]["k"], 1);
    }

    #[test]
    fn test_handler_error_display() {
        let err = HandlerError::new("boom").with_traceback("stack");
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.traceback.as_deref(), Some("stack"));
    }

    #[test]
    fn test_handler_context_is_empty_object() {
        assert_eq!(HandlerContext::new().into_value(), serde_json::json!({}));
    }
}
