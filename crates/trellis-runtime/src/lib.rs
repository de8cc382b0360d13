//! Event producers and the event router.
//!
//! Producers turn external stimuli into [`trellis_types::Event`]s and publish
//! them into an [`EventStream`]. The [`EventRouter`] owns the stream and the
//! current trigger set, matches events to handlers and logs the outcome.

pub mod cron;
pub mod error;
pub mod producer;
pub mod realtime;
pub mod router;
pub mod stream;
pub mod webhook;

pub use cron::CronProducer;
pub use error::{Result, RuntimeError};
pub use producer::Producer;
pub use realtime::{
    MemoryTransport, ProviderDelivery, PubSubTransport, RealtimeConfig, RealtimeProducer,
    Subscription, WebSocketTransport, dev_channel, workflow_events_channel,
};
pub use router::{EventRouter, RouterState, dispatch};
pub use stream::{EventReceiver, EventStream};
pub use webhook::{
    Binding, DEFAULT_WEBHOOK_HOST, DEFAULT_WEBHOOK_PORT, WebhookConfig, WebhookError,
    WebhookProducer,
};
