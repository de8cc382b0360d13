//! Shared types for the Trellis local development runtime.
//!
//! The sandbox produces [`Trigger`]s and [`UsedProvider`]s, the event
//! producers turn external stimuli into [`Event`]s, and the router matches
//! the two. Everything that crosses a crate boundary lives here.

pub mod event;
pub mod handler;
pub mod provider;
pub mod report;
pub mod trigger;

pub use event::{
    CronEventData, DispatchOutcome, Event, EventKind, RealtimeContext, RealtimeMessage,
    WebhookRequest,
};
pub use handler::{
    HandlerContext, HandlerError, LifecycleContext, LifecycleHook, TriggerHandler,
    WebhookMetadata, WebhookValidator, handler_fn, hook_fn, validator_fn,
};
pub use provider::{
    DEFAULT_PROVIDER_ALIAS, ProviderConfig, ProviderMeta, SecretDefinition, UsedProvider,
    provider_key,
};
pub use report::{ErrorReporter, EventContext};
pub use trigger::{
    CronSpec, DEFAULT_WEBHOOK_METHOD, RealtimeSpec, Trigger, TriggerId, TriggerKind, TriggerSpec,
    WebhookSpec,
};
