//! Trigger declarations captured from user code.
//!
//! A [`Trigger`] binds an external stimulus (webhook, cron tick, realtime
//! message) to a handler. Triggers are immutable once registered; a reload
//! produces an entirely new set.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::handler::{LifecycleHook, TriggerHandler, WebhookValidator};
use crate::provider::ProviderMeta;

/// HTTP method a webhook trigger answers to when none is declared.
pub const DEFAULT_WEBHOOK_METHOD: &str = "POST";

/// The three trigger variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Webhook,
    Cron,
    Realtime,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Cron => "cron",
            Self::Realtime => "realtime",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier assigned when a trigger is registered. Only used for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerId(Uuid);

impl TriggerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Webhook-specific trigger fields.
#[derive(Clone)]
pub struct WebhookSpec {
    /// Explicit path below `/webhook`. A random path is generated at bind time when absent.
    pub path: Option<String>,
    /// Upper-cased HTTP method.
    pub method: String,
    /// Request validation. `false` or an error rejects the request with 401.
    pub validation: Option<Arc<dyn WebhookValidator>>,
    /// Invoked once the webhook URL is known, before traffic is accepted.
    pub setup: Option<Arc<dyn LifecycleHook>>,
    /// Invoked when the trigger disappears from the active set.
    pub teardown: Option<Arc<dyn LifecycleHook>>,
    /// Provider routing metadata for webhooks delivered over the dev channel.
    pub provider_meta: Option<ProviderMeta>,
}

impl Default for WebhookSpec {
    fn default() -> Self {
        Self {
            path: None,
            method: DEFAULT_WEBHOOK_METHOD.to_string(),
            validation: None,
            setup: None,
            teardown: None,
            provider_meta: None,
        }
    }
}

impl WebhookSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_method(mut self, method: impl AsRef<str>) -> Self {
        self.method = method.as_ref().to_uppercase();
        self
    }

    pub fn with_validation(mut self, validation: Arc<dyn WebhookValidator>) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_setup(mut self, setup: Arc<dyn LifecycleHook>) -> Self {
        self.setup = Some(setup);
        self
    }

    pub fn with_teardown(mut self, teardown: Arc<dyn LifecycleHook>) -> Self {
        self.teardown = Some(teardown);
        self
    }

    pub fn with_provider_meta(mut self, meta: ProviderMeta) -> Self {
        self.provider_meta = Some(meta);
        self
    }
}

impl fmt::Debug for WebhookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSpec")
            .field("path", &self.path)
            .field("method", &self.method)
            .field("validation", &self.validation.is_some())
            .field("setup", &self.setup.is_some())
            .field("teardown", &self.teardown.is_some())
            .field("provider_meta", &self.provider_meta)
            .finish()
    }
}

/// Cron trigger fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    /// Six-field (seconds resolution) cron expression. Five-field expressions are accepted too.
    pub expression: String,
}

/// Realtime (pub/sub) trigger fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeSpec {
    pub channel: String,
    pub message_type: Option<String>,
}

impl RealtimeSpec {
    /// Exact channel equality plus optional message type equality.
    pub fn matches(&self, channel: &str, message_type: Option<&str>) -> bool {
        if self.channel != channel {
            return false;
        }
        match &self.message_type {
            None => true,
            Some(expected) => message_type == Some(expected.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TriggerSpec {
    Webhook(WebhookSpec),
    Cron(CronSpec),
    Realtime(RealtimeSpec),
}

/// A registered trigger.
#[derive(Clone)]
pub struct Trigger {
    id: TriggerId,
    spec: TriggerSpec,
    handler: Arc<dyn TriggerHandler>,
}

impl Trigger {
    pub fn new(spec: TriggerSpec, handler: Arc<dyn TriggerHandler>) -> Self {
        Self {
            id: TriggerId::new(),
            spec,
            handler,
        }
    }

    pub fn webhook(spec: WebhookSpec, handler: Arc<dyn TriggerHandler>) -> Self {
        Self::new(TriggerSpec::Webhook(spec), handler)
    }

    pub fn cron(expression: impl Into<String>, handler: Arc<dyn TriggerHandler>) -> Self {
        Self::new(
            TriggerSpec::Cron(CronSpec {
                expression: expression.into(),
            }),
            handler,
        )
    }

    pub fn realtime(
        channel: impl Into<String>,
        message_type: Option<String>,
        handler: Arc<dyn TriggerHandler>,
    ) -> Self {
        Self::new(
            TriggerSpec::Realtime(RealtimeSpec {
                channel: channel.into(),
                message_type,
            }),
            handler,
        )
    }

    pub fn id(&self) -> TriggerId {
        self.id
    }

    pub fn kind(&self) -> TriggerKind {
        match &self.spec {
            TriggerSpec::Webhook(_) => TriggerKind::Webhook,
            TriggerSpec::Cron(_) => TriggerKind::Cron,
            TriggerSpec::Realtime(_) => TriggerKind::Realtime,
        }
    }

    pub fn spec(&self) -> &TriggerSpec {
        &self.spec
    }

    pub fn handler(&self) -> &Arc<dyn TriggerHandler> {
        &self.handler
    }

    pub fn as_webhook(&self) -> Option<&WebhookSpec> {
        match &self.spec {
            TriggerSpec::Webhook(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_cron(&self) -> Option<&CronSpec> {
        match &self.spec {
            TriggerSpec::Cron(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_realtime(&self) -> Option<&RealtimeSpec> {
        match &self.spec {
            TriggerSpec::Realtime(spec) => Some(spec),
            _ => None,
        }
    }

    /// One-line human description, e.g. `webhook POST /orders`.
    pub fn describe(&self) -> String {
        match &self.spec {
            TriggerSpec::Webhook(spec) => {
                let path = spec.path.as_deref().unwrap_or("<generated>");
                match &spec.provider_meta {
                    Some(meta) => format!(
                        "webhook {} {} ({}:{} {})",
                        spec.method,
                        path,
                        meta.provider_type,
                        meta.provider_alias,
                        meta.trigger_type
                    ),
                    None => format!("webhook {} {}", spec.method, path),
                }
            }
            TriggerSpec::Cron(spec) => format!("cron \"{}\"", spec.expression),
            TriggerSpec::Realtime(spec) => match &spec.message_type {
                Some(kind) => format!("realtime {} [{}]", spec.channel, kind),
                None => format!("realtime {}", spec.channel),
            },
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn noop() -> Arc<dyn TriggerHandler> {
        handler_fn(|_ctx, _event| async { Ok(()) })
    }

    #[test]
    fn test_webhook_spec_defaults_to_post() {
        let spec = WebhookSpec::new();
        assert_eq!(spec.method, "POST");
        assert!(spec.path.is_none());
    }

    #[test]
    fn test_with_method_uppercases() {
        let spec = WebhookSpec::new().with_method("put");
        assert_eq!(spec.method, "PUT");
    }

    #[test]
    fn test_trigger_kind_accessors() {
        let cron = Trigger::cron("*/5 * * * * *", noop());
        assert_eq!(cron.kind(), TriggerKind::Cron);
        assert!(cron.as_cron().is_some());
        assert!(cron.as_webhook().is_none());

        let rt = Trigger::realtime("orders", None, noop());
        assert_eq!(rt.kind(), TriggerKind::Realtime);
        assert_eq!(rt.describe(), "realtime orders");
    }

    #[test]
    fn test_each_trigger_gets_a_fresh_id() {
        let a = Trigger::cron("* * * * * *", noop());
        let b = Trigger::cron("* * * * * *", noop());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_realtime_matching() {
        let any = RealtimeSpec {
            channel: "orders".into(),
            message_type: None,
        };
        assert!(any.matches("orders", None));
        assert!(any.matches("orders", Some("created")));
        assert!(!any.matches("invoices", None));

        let filtered = RealtimeSpec {
            channel: "orders".into(),
            message_type: Some("created".into()),
        };
        assert!(filtered.matches("orders", Some("created")));
        assert!(!filtered.matches("orders", Some("deleted")));
        assert!(!filtered.matches("orders", None));
    }

    #[test]
    fn test_describe_webhook_with_provider() {
        let spec = WebhookSpec::new().with_provider_meta(ProviderMeta {
            provider_type: "slack".into(),
            provider_alias: "default".into(),
            trigger_type: "onMessage".into(),
            input: serde_json::json!({}),
        });
        let trigger = Trigger::webhook(spec, noop());
        assert_eq!(
            trigger.describe(),
            "webhook POST <generated> (slack:default onMessage)"
        );
    }
}
