//! Seam for rendering handler failures.

use crate::event::EventKind;
use crate::handler::HandlerError;
use crate::trigger::{TriggerId, TriggerKind};

/// Where a handler failure happened.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub event_kind: EventKind,
    pub trigger_kind: TriggerKind,
    pub trigger_id: TriggerId,
}

/// Turns a handler failure into a diagnostic report.
///
/// Implementations must be side-effect free; the router only logs the
/// returned text.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &HandlerError, context: &EventContext) -> String;
}
