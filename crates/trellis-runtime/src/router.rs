//! Event router.
//!
//! Owns the event stream, the producers and the authoritative trigger list.
//! A dispatcher task takes events off the stream in order and spawns one
//! dispatch per event, so slow handlers never hold up other triggers.
//! Handler failures are logged here and go no further.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trellis_types::{
    DispatchOutcome, ErrorReporter, Event, EventContext, EventKind, HandlerContext, HandlerError,
    Trigger, TriggerId,
};

use crate::error::{Result, RuntimeError};
use crate::producer::Producer;
use crate::realtime::ProviderDelivery;
use crate::stream::{EventReceiver, EventStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Uninitialized,
    Running,
    Stopped,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

type SharedTriggers = Arc<RwLock<Vec<Arc<Trigger>>>>;
type SharedReporter = Arc<RwLock<Option<Arc<dyn ErrorReporter>>>>;

pub struct EventRouter {
    state: RouterState,
    producers: Vec<Box<dyn Producer>>,
    triggers: SharedTriggers,
    reporter: SharedReporter,
    stream: EventStream,
    receiver: Option<EventReceiver>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        let (stream, receiver) = EventStream::channel();
        Self {
            state: RouterState::Uninitialized,
            producers: Vec::new(),
            triggers: Arc::new(RwLock::new(Vec::new())),
            reporter: Arc::new(RwLock::new(None)),
            stream,
            receiver: Some(receiver),
            dispatcher: None,
        }
    }

    pub fn with_producer(mut self, producer: Box<dyn Producer>) -> Self {
        self.producers.push(producer);
        self
    }

    /// Route handler failures through `reporter`. Without one only the message is logged.
    pub fn set_error_reporter(&self, reporter: Option<Arc<dyn ErrorReporter>>) {
        *self.reporter.write() = reporter;
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    pub fn triggers(&self) -> Vec<Arc<Trigger>> {
        self.triggers.read().clone()
    }

    /// Publishing handle onto the router's stream.
    pub fn stream(&self) -> EventStream {
        self.stream.clone()
    }

    /// Webhook URLs reported by the producers, keyed by trigger.
    pub fn webhook_urls(&self) -> HashMap<TriggerId, String> {
        self.producers
            .iter()
            .flat_map(|p| p.webhook_urls())
            .collect()
    }

    pub async fn start(&mut self, triggers: Vec<Arc<Trigger>>) -> Result<()> {
        if self.state != RouterState::Uninitialized {
            return Err(RuntimeError::InvalidState("already started"));
        }
        let Some(receiver) = self.receiver.take() else {
            return Err(RuntimeError::InvalidState("already started"));
        };

        self.dispatcher = Some(tokio::spawn(run_dispatcher(
            receiver,
            self.triggers.clone(),
            self.reporter.clone(),
        )));
        self.state = RouterState::Running;

        for trigger in &triggers {
            debug!(trigger = %trigger.id().short(), "{}", trigger.describe());
        }
        info!(
            triggers = triggers.len(),
            producers = self.producers.len(),
            "Event router started"
        );
        self.fan_out(triggers).await
    }

    pub async fn update_triggers(&mut self, triggers: Vec<Arc<Trigger>>) -> Result<()> {
        if self.state != RouterState::Running {
            return Err(RuntimeError::InvalidState("not running"));
        }
        info!(triggers = triggers.len(), "Updating triggers");
        self.fan_out(triggers).await
    }

    /// Every producer sees the update even when an earlier one fails; the first error is returned.
    async fn fan_out(&mut self, triggers: Vec<Arc<Trigger>>) -> Result<()> {
        *self.triggers.write() = triggers.clone();

        let mut first_error = None;
        for producer in &mut self.producers {
            if let Err(e) = producer.update_triggers(&triggers, self.stream.clone()).await {
                error!(producer = producer.name(), error = %e, "Producer update failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every producer. In-flight handlers are left to finish.
    pub async fn stop(&mut self) {
        if self.state == RouterState::Stopped {
            return;
        }
        for producer in &mut self.producers {
            if let Err(e) = producer.stop().await {
                warn!(producer = producer.name(), error = %e, "Producer stop failed");
            }
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        self.receiver = None;
        self.state = RouterState::Stopped;
        info!("Event router stopped");
    }
}

async fn run_dispatcher(
    mut receiver: EventReceiver,
    triggers: SharedTriggers,
    reporter: SharedReporter,
) {
    while let Some(event) = receiver.recv().await {
        let current = triggers.read().clone();
        let reporter = reporter.read().clone();
        tokio::spawn(async move {
            let Event {
                kind,
                trigger,
                data,
                ack,
            } = event;
            let outcome = dispatch(kind, trigger, data, &current, reporter).await;
            if let Some(ack) = ack {
                let _ = ack.send(outcome);
            }
        });
    }
}

/// Realtime triggers listening on the message's channel and type.
pub fn match_realtime(triggers: &[Arc<Trigger>], message: &Value) -> Vec<Arc<Trigger>> {
    let Some(channel) = message.get("channel").and_then(Value::as_str) else {
        return Vec::new();
    };
    let message_type = message.get("type").and_then(Value::as_str);
    triggers
        .iter()
        .filter(|t| {
            t.as_realtime()
                .is_some_and(|spec| spec.matches(channel, message_type))
        })
        .cloned()
        .collect()
}

/// Webhook triggers whose provider metadata equals the delivery's.
pub fn match_provider(triggers: &[Arc<Trigger>], delivery: &ProviderDelivery) -> Vec<Arc<Trigger>> {
    triggers
        .iter()
        .filter(|t| {
            t.as_webhook()
                .and_then(|spec| spec.provider_meta.as_ref())
                .is_some_and(|meta| *meta == delivery.trigger_metadata)
        })
        .cloned()
        .collect()
}

/// Resolve targets and run every handler concurrently.
pub async fn dispatch(
    kind: EventKind,
    trigger: Option<Arc<Trigger>>,
    data: Value,
    triggers: &[Arc<Trigger>],
    reporter: Option<Arc<dyn ErrorReporter>>,
) -> DispatchOutcome {
    let (targets, data) = match (trigger, kind) {
        (Some(trigger), _) => (vec![trigger], data),
        (None, EventKind::Realtime) => {
            let targets = match_realtime(triggers, &data);
            if targets.is_empty() {
                debug!(channel = ?data.get("channel"), "No realtime trigger for message");
            }
            (targets, data)
        }
        (None, EventKind::ProviderWebhook) => {
            let delivery: ProviderDelivery = match serde_json::from_value(data) {
                Ok(delivery) => delivery,
                Err(e) => {
                    warn!(error = %e, "Malformed provider delivery");
                    return DispatchOutcome::default();
                }
            };
            let targets = match_provider(triggers, &delivery);
            if targets.is_empty() {
                let meta = &delivery.trigger_metadata;
                warn!(
                    provider_type = %meta.provider_type,
                    provider_alias = %meta.provider_alias,
                    trigger_type = %meta.trigger_type,
                    "No local trigger for provider webhook"
                );
            }
            (targets, delivery.data)
        }
        (None, other) => {
            warn!(kind = %other, "Event without target dropped");
            return DispatchOutcome::default();
        }
    };

    let invocations = targets.into_iter().map(|trigger| {
        let data = data.clone();
        let reporter = reporter.clone();
        async move { invoke(kind, trigger, data, reporter).await }
    });
    let results = join_all(invocations).await;

    DispatchOutcome {
        matched: results.len(),
        failed: results.iter().filter(|ok| !**ok).count(),
    }
}

/// Run one handler on its own task. Returns whether it succeeded.
async fn invoke(
    kind: EventKind,
    trigger: Arc<Trigger>,
    data: Value,
    reporter: Option<Arc<dyn ErrorReporter>>,
) -> bool {
    let started = Instant::now();
    let handler = trigger.handler().clone();
    let result = tokio::spawn(async move { handler.call(HandlerContext::new(), data).await })
        .await
        .unwrap_or_else(|e| Err(HandlerError::new(format!("handler task failed: {e}"))));
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(()) => {
            info!(
                trigger = %trigger.id().short(),
                kind = %trigger.kind(),
                event = %kind,
                elapsed_ms,
                "Handler completed"
            );
            true
        }
        Err(e) => {
            let message = match &reporter {
                Some(reporter) => reporter.report(
                    &e,
                    &EventContext {
                        event_kind: kind,
                        trigger_kind: trigger.kind(),
                        trigger_id: trigger.id(),
                    },
                ),
                None => e.message.clone(),
            };
            error!(
                trigger = %trigger.id().short(),
                kind = %trigger.kind(),
                event = %kind,
                elapsed_ms,
                "Handler failed: {message}"
            );
            false
        }
    }
}
