//! Reactor state machine (§4.5).
//!
//! A reactor is a side-effect handler invoked per matching event with
//! at-least-once delivery. Each event tracks one [`ReactorState`] per reactor
//! that ever matched it (§3 invariant 5); the state transitions monotonically
//! toward a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Identifier for a reactor, unique within a single entity type's registry
/// (§4.7).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReactorId(String);

impl ReactorId {
    /// Construct a reactor id from application-controlled input.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a single reactor's progress against a single event (§3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactorStatus {
    /// Not yet dispatched, or dispatched and failed with attempts remaining.
    Pending,
    /// Currently being dispatched; `react` is in flight.
    InProgress,
    /// Terminal: `react` returned successfully.
    CompleteSuccessful,
    /// Terminal: `react` failed `max_attempts` times.
    CompleteFailed,
}

impl ReactorStatus {
    /// True for either terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::CompleteSuccessful | Self::CompleteFailed)
    }
}

/// Per-event, per-reactor progress record (§3 `ReactorState`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReactorState {
    /// Which reactor this state belongs to.
    pub reactor_id: ReactorId,
    /// Number of `react` attempts made so far.
    pub attempts: u32,
    /// Current status.
    pub status: ReactorStatus,
    /// When this state last changed.
    pub last_update: DateTime<Utc>,
}

impl ReactorState {
    /// The initial state for an event a reactor matches on first save
    /// (§4.5 "Initial on first save").
    #[must_use]
    pub fn initial(reactor_id: ReactorId, now: DateTime<Utc>) -> Self {
        Self {
            reactor_id,
            attempts: 0,
            status: ReactorStatus::Pending,
            last_update: now,
        }
    }

    /// Mark this event's dispatch as in flight, just before `react` is
    /// invoked (§4.5 "marks them `in_progress`, invokes `react`").
    pub fn record_in_progress(&mut self, now: DateTime<Utc>) {
        self.status = ReactorStatus::InProgress;
        self.last_update = now;
    }

    /// Apply a successful `react` outcome.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.status = ReactorStatus::CompleteSuccessful;
        self.last_update = now;
    }

    /// Apply a failed `react` outcome, incrementing `attempts` and deciding
    /// whether the state remains retryable (§4.5 "attempts += 1; if attempts
    /// < max_attempts, remain pending ... else complete_failed").
    pub fn record_failure(&mut self, max_attempts: u32, now: DateTime<Utc>) {
        self.attempts += 1;
        self.status = if self.attempts < max_attempts {
            ReactorStatus::Pending
        } else {
            ReactorStatus::CompleteFailed
        };
        self.last_update = now;
    }
}

/// Error returned by a reactor's `react` invocation.
#[derive(Error, Debug)]
#[error("reactor failed: {0}")]
pub struct ReactorError(pub String);

/// A side-effect handler invoked per matching event (§4.5, §4.7).
///
/// `matches` is a membership check against the event's `event_type` tag
/// (§4.7 Design Notes item 1) rather than a runtime type query. `react`
/// receives a sequence-ordered batch of consecutive matching events the
/// engine has chosen to coalesce into one dispatch (§4.5 "Batching").
///
/// The explicit `Pin<Box<dyn Future>>` return (rather than `impl Future`)
/// keeps this trait dyn-compatible, since the registry stores reactors as
/// `Box<dyn Reactor<E>>`.
pub trait Reactor<E, P>: Send + Sync {
    /// This reactor's identifier, unique within the owning entity's registry.
    fn id(&self) -> &ReactorId;

    /// Whether this reactor is interested in `event`.
    fn matches(&self, event: &E) -> bool;

    /// The maximum number of attempts before a failing event's state becomes
    /// terminal (`complete_failed`). Defaults to 5.
    fn max_attempts(&self) -> u32 {
        5
    }

    /// Dispatch a batch of matching events, in sequence order, against the
    /// current projection.
    fn react<'a>(
        &'a self,
        batch: &'a [E],
        projection: &'a P,
    ) -> Pin<Box<dyn Future<Output = Result<(), ReactorError>> + Send + 'a>>;
}
