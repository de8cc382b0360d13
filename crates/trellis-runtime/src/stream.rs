//! The router's inbound event stream.

use tokio::sync::mpsc;
use trellis_types::Event;

use crate::error::{Result, RuntimeError};

/// Receiving half, owned by the router.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Publishing handle handed to producers.
///
/// Unbounded: producers publish from request handlers and timers and must
/// never wait on the router. Events from one producer keep their order.
#[derive(Debug, Clone)]
pub struct EventStream {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventStream {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: Event) -> Result<()> {
        self.tx.send(event).map_err(|_| RuntimeError::StreamClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::EventKind;

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let (stream, mut rx) = EventStream::channel();
        for n in 0..3 {
            stream
                .publish(Event::broadcast(EventKind::Realtime, serde_json::json!(n)))
                .unwrap();
        }
        for n in 0..3 {
            assert_eq!(rx.recv().await.unwrap().data, serde_json::json!(n));
        }
    }

    #[test]
    fn test_publish_after_close_fails() {
        let (stream, rx) = EventStream::channel();
        drop(rx);
        assert!(stream.is_closed());
        assert!(matches!(
            stream.publish(Event::broadcast(EventKind::Cron, serde_json::Value::Null)),
            Err(RuntimeError::StreamClosed)
        ));
    }
}
