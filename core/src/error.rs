//! Error taxonomy (§7).
//!
//! Every kind below is a distinct, structured variant — never a bare string
//! — so callers can match on it instead of parsing messages.

use crate::ids::{GrainId, Sequence, StreamName};
use thiserror::Error;

/// Errors the save coordinator (§4.3) and query engine (§4.2) can surface to
/// a caller. Best-effort paths (reactor-status updates after a successful
/// primary save, retention deletes) never produce these; they log-and-continue
/// internally (§7).
#[derive(Error, Debug)]
pub enum StoreError {
    /// The projection's CAS precondition failed: another writer updated this
    /// grain's projection row since the caller last loaded it. The caller
    /// should reload via the query engine and retry, with an
    /// application-level retry cap (§5 "the core does not loop internally").
    #[error("concurrency conflict on grain {grain_id}: expected version missing or stale")]
    ConcurrencyConflict {
        /// The grain whose projection CAS failed.
        grain_id: GrainId,
    },

    /// An insert-if-absent for a new event row collided with an existing row
    /// at the same key. Indicates a re-save after partial success or a
    /// mis-assigned sequence; a reload will reconcile.
    #[error(
        "duplicate event on grain {grain_id}, stream {stream_name}, sequence {sequence}"
    )]
    DuplicateEvent {
        /// The grain being saved.
        grain_id: GrainId,
        /// The stream the colliding event was written to.
        stream_name: StreamName,
        /// The sequence number that collided.
        sequence: Sequence,
    },

    /// The save would exceed the backend's transaction size limit even after
    /// the coordinator's batch-packing pass (§4.3 step 2-3). The caller must
    /// split the save into smaller `apply` calls.
    #[error("save for grain {grain_id} exceeds max_batch_size ({action_count} actions, limit {limit})")]
    TooLarge {
        /// The grain being saved.
        grain_id: GrainId,
        /// Number of actions the primary batch would have required.
        action_count: usize,
        /// The configured `max_batch_size`.
        limit: usize,
    },

    /// A retryable backend error (timeout, throttling). The caller may retry
    /// the whole operation.
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    /// A non-retryable backend error (auth, schema mismatch, quota
    /// exhaustion).
    #[error("fatal backend error: {0}")]
    FatalBackend(String),

    /// A row could not be decoded. Read paths never return this to a
    /// caller directly — events are skipped and the projection falls back to
    /// its type default (§4.1); this variant exists for callers of the codec
    /// directly (e.g. backend implementations reporting why a row was
    /// skipped, via logging).
    #[error("malformed row: {0}")]
    MalformedRow(String),

    /// A stream registry or retention policy was invalid at configuration
    /// build time: contradictory retention dimensions, duplicate stream
    /// names, or duplicate reactor ids within an entity (§4.4, §4.7).
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl StoreError {
    /// True if retrying the same operation unchanged might succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientBackend(_))
    }
}
