//! Client for the Trellis backend.
//!
//! The dev runtime only needs four calls: resolve a workflow, fetch and
//! save provider configuration, and publish the local trigger set. They
//! sit behind the [`Backend`] trait so the orchestrator can be tested
//! without a server.

pub mod client;
pub mod error;
pub mod types;

pub use client::{Backend, BackendClient, ClientBuilder, merge_config};
pub use error::{ClientError, Result};
pub use types::{SyncDevTriggersRequest, SyncDevTriggersResponse, TriggerSummary, Workflow};
