//! Backend contract (§6): the row store abstraction every storage driver
//! (`grainstore-memory`, `grainstore-sled`, ...) implements.
//!
//! The core crate depends only on this trait. It never assumes a specific
//! wide-column database; `RowStore` is the "wide-column key-value store
//! whose transactional unit is a single partition" from spec.md §1.

use crate::ids::{GrainId, VersionToken};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Backend-level errors (§6, narrower than [`crate::error::StoreError`]).
/// The save coordinator maps these onto the §7 taxonomy.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// A `replace_cas` action's version token didn't match the row's current
    /// token.
    #[error("precondition failed")]
    PreconditionFailed,
    /// An `insert_if_absent` action collided with an existing row.
    #[error("conflict: row already exists")]
    Conflict,
    /// A retryable backend failure (timeout, throttling).
    #[error("transient backend error: {0}")]
    Transient(String),
    /// A non-retryable backend failure (auth, schema, quota).
    #[error("fatal backend error: {0}")]
    Fatal(String),
}

/// A row as read from the backend: raw key/attribute bytes plus the CAS
/// witness the backend attached on read.
#[derive(Clone, Debug)]
pub struct Row {
    /// The row key, as laid out by the partition codec (§4.1).
    pub row_key: Vec<u8>,
    /// Opaque attribute bytes (msgpack/bincode-encoded by the codec).
    pub value: Vec<u8>,
    /// Backend-set write timestamp, used by `max_age` server-side filters
    /// and by retention's `max_age` dimension.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// CAS witness.
    pub version_token: VersionToken,
}

/// A single action within a `submit_transaction` call (§6).
#[derive(Clone, Debug)]
pub enum Action {
    /// Insert a row only if no row currently exists at `row_key`. Used for
    /// new event rows (§4.3): collisions raise [`BackendError::Conflict`].
    InsertIfAbsent {
        /// Target row key.
        row_key: Vec<u8>,
        /// Encoded row attributes.
        value: Vec<u8>,
    },
    /// Insert-or-overwrite, unconditionally. Used only where no prior
    /// version is observed (first-ever projection write for a grain).
    Upsert {
        /// Target row key.
        row_key: Vec<u8>,
        /// Encoded row attributes.
        value: Vec<u8>,
    },
    /// Replace an existing row only if its current version token matches.
    /// Used for the projection CAS and reactor-status rewrites (§4.3):
    /// mismatches raise [`BackendError::PreconditionFailed`].
    ReplaceCas {
        /// Target row key.
        row_key: Vec<u8>,
        /// Encoded row attributes.
        value: Vec<u8>,
        /// Expected current version token.
        expected: VersionToken,
    },
    /// Delete a row, optionally only if its version token matches. Used by
    /// retention sweeps (§4.4), which pass `None` since a stale delete
    /// target (already-deleted row) is a benign no-op.
    Delete {
        /// Target row key.
        row_key: Vec<u8>,
        /// Expected current version token, if the delete should be
        /// conditional.
        expected: Option<VersionToken>,
    },
}

/// Result of a successful `submit_transaction` call: the fresh version
/// tokens assigned to every row the transaction wrote (in submission order),
/// omitting deletes.
#[derive(Clone, Debug, Default)]
pub struct TransactionOutcome {
    /// Fresh version tokens, one per non-delete action, in submission order.
    pub version_tokens: Vec<VersionToken>,
}

/// A row-key range for a `query` call: `[start, end)`. `end = None` means
/// unbounded (to the end of the partition).
#[derive(Clone, Debug)]
pub struct RowKeyRange {
    /// Inclusive lower bound.
    pub start: Vec<u8>,
    /// Exclusive upper bound, or `None` for unbounded.
    pub end: Option<Vec<u8>>,
}

/// The backend contract (§6).
///
/// Every transactional unit is a single partition, identified by a
/// [`GrainId`]. Implementations must guarantee atomicity within one
/// `submit_transaction` call up to `max_batch_size` actions (a design
/// constant fixed at the call site, not baked into this trait — see
/// §9 Design Notes).
pub trait RowStore: Send + Sync {
    /// Fetch a single row by key, or `None` if absent.
    fn get<'a>(
        &'a self,
        partition: &'a GrainId,
        row_key: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Option<Row>, BackendError>> + Send + 'a>>;

    /// Stream rows within `range`, ordered by ascending row key.
    fn query<'a>(
        &'a self,
        partition: &'a GrainId,
        range: RowKeyRange,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Row>, BackendError>> + Send + 'a>>;

    /// Atomically apply `actions` to `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::PreconditionFailed`] if any `ReplaceCas`
    /// action's token is stale, [`BackendError::Conflict`] if any
    /// `InsertIfAbsent` action's key is occupied, or a transient/fatal
    /// error per the backend's own classification.
    fn submit_transaction<'a>(
        &'a self,
        partition: &'a GrainId,
        actions: Vec<Action>,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionOutcome, BackendError>> + Send + 'a>>;
}

/// Design constant (§4.3, §9): the backend-imposed transaction size limit for
/// the reference backends in this workspace. Callers constructing an
/// `EngineConfig` may override it for other backends; the core never
/// hardcodes it beyond this default.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
