//! Normalized events flowing from producers to the router.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::trigger::Trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Webhook,
    Cron,
    Realtime,
    /// Provider webhook tunnelled through the per-workflow dev channel.
    ProviderWebhook,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Cron => "cron",
            Self::Realtime => "realtime",
            Self::ProviderWebhook => "provider_webhook",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to an event once the router finished with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers invoked.
    pub matched: usize,
    /// Handlers that returned an error.
    pub failed: usize,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// An event published into the stream.
///
/// `trigger` is set when the producer identified the target itself (webhook
/// path, cron timer). Otherwise the router searches the current trigger set.
pub struct Event {
    pub kind: EventKind,
    pub trigger: Option<Arc<Trigger>>,
    pub data: Value,
    /// Completion notification for producers that wait on dispatch.
    pub ack: Option<oneshot::Sender<DispatchOutcome>>,
}

impl Event {
    pub fn targeted(kind: EventKind, trigger: Arc<Trigger>, data: Value) -> Self {
        Self {
            kind,
            trigger: Some(trigger),
            data,
            ack: None,
        }
    }

    pub fn broadcast(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            trigger: None,
            data,
            ack: None,
        }
    }

    pub fn with_ack(mut self, ack: oneshot::Sender<DispatchOutcome>) -> Self {
        self.ack = Some(ack);
        self
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("trigger", &self.trigger.as_ref().map(|t| t.id()))
            .field("data", &self.data)
            .field("ack", &self.ack.is_some())
            .finish()
    }
}

/// Payload of a cron firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronEventData {
    pub scheduled_time: DateTime<Utc>,
    pub actual_time: DateTime<Utc>,
    pub scheduled_time_ms: i64,
    pub actual_time_ms: i64,
}

impl CronEventData {
    pub fn new(scheduled: DateTime<Utc>, actual: DateTime<Utc>) -> Self {
        Self {
            scheduled_time: scheduled,
            actual_time: actual,
            scheduled_time_ms: scheduled.timestamp_millis(),
            actual_time_ms: actual.timestamp_millis(),
        }
    }

    /// Actual minus scheduled, in milliseconds.
    pub fn drift_ms(&self) -> i64 {
        self.actual_time_ms - self.scheduled_time_ms
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,
}

/// A message delivered on the workflow-events channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub channel: String,
    #[serde(default)]
    pub context: RealtimeContext,
}

/// Normalized inbound webhook request handed to validation and handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub method: String,
    pub path: String,
    pub headers: Map<String, Value>,
    pub query: Map<String, Value>,
    /// Parsed JSON body, or the raw text as a string when it is not JSON.
    pub body: Value,
    pub received_at: DateTime<Utc>,
}
