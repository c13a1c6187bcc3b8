//! Projection metadata (§3, §4.6).
//!
//! A grain's projection is a single derived value, rebuilt by folding the
//! grain's events in sequence order. Unlike a cross-process CQRS read model,
//! it lives in the same partition as the events it was derived from and is
//! updated synchronously, in the same transaction as the events that produce
//! it (§4.3).

use crate::ids::{Sequence, VersionToken};
use chrono::{DateTime, Utc};

/// A grain's projection, paired with the bookkeeping the save coordinator and
/// query engine need (§3 invariant 2, 3).
#[derive(Clone, Debug)]
pub struct ProjectionMeta<P> {
    /// The current derived state.
    pub data: P,
    /// Next sequence number to assign on this grain's partition.
    pub next_sequence: Sequence,
    /// Number of event rows currently retained in this grain's partition
    /// (§3). May temporarily overstate the true row count when a retention
    /// sweep's deletes are still in flight (§4.3 "best-effort"), converging
    /// once a later save's sweep succeeds.
    pub event_count: u64,
    /// When the projection was last written.
    pub timestamp: DateTime<Utc>,
    /// CAS witness for the projection row, observed on load and required on
    /// save (§4.3 "optimistic concurrency").
    pub version_token: VersionToken,
}

impl<P> ProjectionMeta<P> {
    /// The projection for a grain with no prior projection row: the type's
    /// default value, a zero sequence, and no CAS witness (§4.6 "absent
    /// projection row decodes as the type default").
    pub fn fresh(default: P) -> Self {
        Self {
            data: default,
            next_sequence: Sequence::ZERO,
            event_count: 0,
            timestamp: Utc::now(),
            version_token: VersionToken::from_generation(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Clone, Debug, PartialEq)]
    struct Counter(u64);

    #[test]
    fn fresh_projection_starts_at_zero_sequence() {
        let meta = ProjectionMeta::fresh(Counter::default());
        assert_eq!(meta.next_sequence, Sequence::ZERO);
        assert_eq!(meta.event_count, 0);
        assert_eq!(meta.data, Counter(0));
    }
}
