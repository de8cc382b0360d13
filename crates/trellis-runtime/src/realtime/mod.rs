//! Realtime producer.
//!
//! Holds up to two long-lived subscriptions:
//!
//! - `workflow-events:<namespace>` carries [`RealtimeMessage`]s, published
//!   as broadcast [`EventKind::Realtime`] events. The router matches them
//!   by channel and message type.
//! - `dev:<workflow_id>` (only with a workflow id) carries provider webhook
//!   deliveries tunnelled from the backend, published as broadcast
//!   [`EventKind::ProviderWebhook`] events and matched on provider metadata.
//!
//! Subscriptions are opened on the first update and kept until `stop`;
//! later updates only swap the stream they publish into.

pub mod transport;
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_types::{Event, EventKind, ProviderMeta, RealtimeMessage, Trigger};

use crate::error::Result;
use crate::producer::Producer;
use crate::stream::EventStream;

pub use transport::{MemoryTransport, PubSubTransport, Subscription};
pub use websocket::{WebSocketTransport, backoff_delay};

pub fn workflow_events_channel(namespace: &str) -> String {
    format!("workflow-events:{namespace}")
}

pub fn dev_channel(workflow_id: &str) -> String {
    format!("dev:{workflow_id}")
}

/// A provider webhook delivered over the dev channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDelivery {
    pub trigger_metadata: ProviderMeta,
    /// The provider's webhook request, handed to the handler as its event.
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub namespace: String,
    pub workflow_id: Option<String>,
}

type SharedStream = Arc<RwLock<Option<EventStream>>>;

pub struct RealtimeProducer {
    config: RealtimeConfig,
    transport: Arc<dyn PubSubTransport>,
    stream: SharedStream,
    tasks: Vec<JoinHandle<()>>,
}

impl RealtimeProducer {
    pub fn new(config: RealtimeConfig, transport: Arc<dyn PubSubTransport>) -> Self {
        Self {
            config,
            transport,
            stream: Arc::new(RwLock::new(None)),
            tasks: Vec::new(),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        !self.tasks.is_empty()
    }

    async fn subscribe_all(&mut self) -> Result<()> {
        let channel = workflow_events_channel(&self.config.namespace);
        let sub = self.transport.subscribe(&channel).await?;
        self.tasks
            .push(tokio::spawn(forward_workflow_events(sub, self.stream.clone())));
        info!(channel = %channel, "Subscribed to workflow events");

        if let Some(workflow_id) = &self.config.workflow_id {
            let channel = dev_channel(workflow_id);
            let sub = self.transport.subscribe(&channel).await?;
            self.tasks
                .push(tokio::spawn(forward_provider_deliveries(sub, self.stream.clone())));
            info!(channel = %channel, "Subscribed to dev channel");
        }
        Ok(())
    }
}

fn publish(stream: &SharedStream, event: Event) -> bool {
    match stream.read().as_ref() {
        Some(stream) => stream.publish(event).is_ok(),
        None => true,
    }
}

async fn forward_workflow_events(mut sub: Subscription, stream: SharedStream) {
    while let Some(message) = sub.next().await {
        let message: RealtimeMessage = match serde_json::from_value(message) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = sub.channel(), error = %e, "Malformed realtime message");
                continue;
            }
        };
        debug!(channel = %message.channel, message_type = ?message.message_type, "Realtime message");
        let Ok(data) = serde_json::to_value(&message) else {
            continue;
        };
        if !publish(&stream, Event::broadcast(EventKind::Realtime, data)) {
            return;
        }
    }
}

async fn forward_provider_deliveries(mut sub: Subscription, stream: SharedStream) {
    while let Some(message) = sub.next().await {
        if let Err(e) = serde_json::from_value::<ProviderDelivery>(message.clone()) {
            warn!(channel = sub.channel(), error = %e, "Malformed provider delivery");
            continue;
        }
        if !publish(&stream, Event::broadcast(EventKind::ProviderWebhook, message)) {
            return;
        }
    }
}

#[async_trait]
impl Producer for RealtimeProducer {
    fn name(&self) -> &'static str {
        "realtime"
    }

    async fn update_triggers(
        &mut self,
        _triggers: &[Arc<Trigger>],
        stream: EventStream,
    ) -> Result<()> {
        *self.stream.write() = Some(stream);
        if !self.is_subscribed() {
            self.subscribe_all().await?;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.stream.write().take();
        self.transport.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(workflow_id: Option<&str>) -> RealtimeConfig {
        RealtimeConfig {
            namespace: "acme".into(),
            workflow_id: workflow_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_subscribes_once_across_updates() {
        let transport = MemoryTransport::new();
        let mut producer = RealtimeProducer::new(config(Some("wf_1")), Arc::new(transport.clone()));
        let (stream, _rx) = EventStream::channel();

        producer.update_triggers(&[], stream.clone()).await.unwrap();
        producer.update_triggers(&[], stream).await.unwrap();

        assert_eq!(transport.subscriber_count("workflow-events:acme"), 1);
        assert_eq!(transport.subscriber_count("dev:wf_1"), 1);
    }

    #[tokio::test]
    async fn test_no_dev_channel_without_workflow() {
        let transport = MemoryTransport::new();
        let mut producer = RealtimeProducer::new(config(None), Arc::new(transport.clone()));
        let (stream, _rx) = EventStream::channel();
        producer.update_triggers(&[], stream).await.unwrap();
        assert_eq!(transport.subscriber_count("workflow-events:acme"), 1);
        assert_eq!(transport.subscriber_count("dev:wf_1"), 0);
    }

    #[tokio::test]
    async fn test_messages_published_as_broadcast_events() {
        let transport = MemoryTransport::new();
        let mut producer = RealtimeProducer::new(config(Some("wf_1")), Arc::new(transport.clone()));
        let (stream, mut rx) = EventStream::channel();
        producer.update_triggers(&[], stream).await.unwrap();

        transport.publish(
            "workflow-events:acme",
            json!({"type": "created", "channel": "orders", "payload": {"id": 1}}),
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Realtime);
        assert!(event.trigger.is_none());
        assert_eq!(event.data["channel"], "orders");

        transport.publish("workflow-events:acme", json!({"no_channel": true}));
        transport.publish(
            "dev:wf_1",
            json!({
                "trigger_metadata": {
                    "provider_type": "slack",
                    "provider_alias": "default",
                    "trigger_type": "onMessage",
                    "input": {}
                },
                "data": {"text": "hi"}
            }),
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ProviderWebhook);
        assert_eq!(event.data["data"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_update_swaps_stream_without_resubscribing() {
        let transport = MemoryTransport::new();
        let mut producer = RealtimeProducer::new(config(None), Arc::new(transport.clone()));
        let (first, mut first_rx) = EventStream::channel();
        producer.update_triggers(&[], first).await.unwrap();
        let (second, mut second_rx) = EventStream::channel();
        producer.update_triggers(&[], second).await.unwrap();

        transport.publish("workflow-events:acme", json!({"channel": "orders"}));
        assert!(second_rx.recv().await.is_some());
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let transport = MemoryTransport::new();
        let mut producer = RealtimeProducer::new(config(None), Arc::new(transport.clone()));
        let (stream, _rx) = EventStream::channel();
        producer.update_triggers(&[], stream).await.unwrap();
        producer.stop().await.unwrap();
        producer.stop().await.unwrap();
        assert!(!producer.is_subscribed());
        assert_eq!(transport.subscriber_count("workflow-events:acme"), 0);
    }
}
