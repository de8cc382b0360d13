//! The producer seam.

use std::sync::Arc;

use async_trait::async_trait;
use trellis_types::{Trigger, TriggerId};

use crate::error::Result;
use crate::stream::EventStream;

/// A source of live events.
///
/// Both operations are idempotent. `update_triggers` fully replaces the
/// previous trigger set; `stop` releases sockets, timers and subscriptions
/// but does not cancel handlers already running.
#[async_trait]
pub trait Producer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn update_triggers(
        &mut self,
        triggers: &[Arc<Trigger>],
        stream: EventStream,
    ) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    /// Externally reachable URLs of bound webhook triggers.
    fn webhook_urls(&self) -> Vec<(TriggerId, String)> {
        Vec::new()
    }
}
