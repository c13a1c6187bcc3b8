//! # Grainstore Core
//!
//! Pure logic for a per-entity ("grain") event store: partitioned event log,
//! derived projection, optimistic concurrency, at-least-once reactor
//! dispatch, and declarative retention.
//!
//! This crate depends on nothing but the [`backend::RowStore`] trait — it
//! never assumes a specific wide-column database. Storage drivers
//! (`grainstore-memory`, `grainstore-sled`) implement that trait; this crate
//! implements everything above it.
//!
//! ## Core Concepts
//!
//! - **Grain**: one logical entity, backed by one backend partition
//!   ([`ids::GrainId`]).
//! - **Stream**: a named, type-filtered sub-channel of events within a grain
//!   ([`ids::StreamName`]).
//! - **Projection**: the grain's current derived state, rebuilt by folding
//!   events in sequence order.
//! - **Reactor**: a side-effect handler dispatched at-least-once per matching
//!   event ([`reactor::Reactor`]).
//! - **Retention**: declarative policies that prune event rows after they can
//!   no longer affect the projection or pending reactors.

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod backend;
pub mod codec;
pub mod error;
pub mod event;
pub mod ids;
pub mod processor;
pub mod projection;
pub mod query;
pub mod reactor;
pub mod registry;
pub mod retention;
pub mod save;

/// Commonly used types, re-exported for `use grainstore_core::prelude::*;`.
pub mod prelude {
    pub use crate::backend::{Action, BackendError, Row, RowKeyRange, RowStore, TransactionOutcome};
    pub use crate::error::StoreError;
    pub use crate::event::{Event, EventEnvelope, EventRecord};
    pub use crate::ids::{EventId, GrainId, Sequence, StreamName, VersionToken};
    pub use crate::processor::{Handler, HandlerContext};
    pub use crate::projection::ProjectionMeta;
    pub use crate::reactor::{Reactor, ReactorId, ReactorState, ReactorStatus};
    pub use crate::registry::{StreamDef, StreamRegistry, StreamRegistryBuilder};
    pub use crate::retention::RetentionPolicy;
}
