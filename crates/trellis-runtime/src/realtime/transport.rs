//! Pub/sub transport seam and an in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Result, RuntimeError};

/// Messages arriving on one channel.
///
/// A subscription outlives reconnects of the underlying transport; the
/// transport re-subscribes on its own and keeps feeding the same handle.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<Value>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the transport is closed.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Drop the connection and end every subscription. Idempotent.
    async fn close(&self);
}

/// Process-local transport. Used in tests and when no backend is configured.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    closed: bool,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to every live subscriber of `channel`. Returns how many received it.
    pub fn publish(&self, channel: &str, message: Value) -> usize {
        let mut state = self.inner.lock();
        let Some(subscribers) = state.subscribers.get_mut(channel) else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        subscribers.len()
    }

    /// Live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(channel)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(RuntimeError::Transport("transport closed".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(channel, rx))
    }

    async fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_fan_out() {
        let transport = MemoryTransport::new();
        let mut a = transport.subscribe("orders").await.unwrap();
        let mut b = transport.subscribe("orders").await.unwrap();

        assert_eq!(transport.publish("orders", json!({"n": 1})), 2);
        assert_eq!(transport.publish("invoices", json!({})), 0);
        assert_eq!(a.next().await, Some(json!({"n": 1})));
        assert_eq!(b.next().await, Some(json!({"n": 1})));
        assert_eq!(a.channel(), "orders");
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let transport = MemoryTransport::new();
        let mut sub = transport.subscribe("orders").await.unwrap();
        transport.close().await;
        transport.close().await;

        assert_eq!(sub.next().await, None);
        assert!(transport.subscribe("orders").await.is_err());
    }
}
