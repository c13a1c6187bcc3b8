//! Shared test harness for the grain event store: a deterministic clock, a
//! reusable event/projection/stream fixture, and `proptest` strategies for
//! generating event sequences against that fixture.

use chrono::{DateTime, Utc};

/// Deterministic time for reproducible tests.
pub mod clock {
    use super::{DateTime, Utc};

    /// Always returns the same instant it was built with.
    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Build a clock fixed at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }

        /// The fixed instant.
        #[must_use]
        pub const fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// A clock fixed at 2025-01-01 00:00:00 UTC.
    ///
    /// # Panics
    ///
    /// Never in practice: the hardcoded timestamp is valid RFC 3339.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

pub use clock::{FixedClock, test_clock};

/// A minimal event, projection, and single-stream registry reused across
/// property and end-to-end tests (§8), so test crates don't each hand-roll
/// their own toy stream.
pub mod fixtures {
    use grainstore_core::ids::StreamName;
    use grainstore_core::processor::{Handler, HandlerContext};
    use grainstore_core::registry::{StreamDef, StreamRegistry, StreamRegistryBuilder};
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;

    /// An opaque counter bump; the simplest event that still exercises
    /// folding and sequencing.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub enum CounterEvent {
        /// Add this amount to the running total.
        Added(u64),
    }

    impl grainstore_core::event::Event for CounterEvent {
        fn event_type(&self) -> &'static str {
            "CounterEvent.Added.v1"
        }
    }

    /// Running total and applied-event tally, for asserting §8 invariants
    /// 1-3 (sequencing, no lost or reordered events) and 7 (idempotent
    /// replay).
    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct CounterProjection {
        /// Sum of every `Added` amount folded in so far.
        pub total: u64,
        /// Count of events folded in so far.
        pub applied: u64,
    }

    struct CounterHandler;

    impl Handler<CounterEvent, CounterProjection> for CounterHandler {
        fn handle<'a>(
            &'a self,
            event: &'a CounterEvent,
            projection: &'a CounterProjection,
            _ctx: &'a mut HandlerContext<'_, CounterEvent>,
        ) -> Pin<Box<dyn Future<Output = CounterProjection> + Send + 'a>> {
            let CounterEvent::Added(amount) = event;
            let next = CounterProjection {
                total: projection.total + amount,
                applied: projection.applied + 1,
            };
            Box::pin(async move { next })
        }
    }

    /// A single-stream registry binding [`CounterEvent`] to
    /// [`CounterProjection`] under `stream_name`.
    ///
    /// # Panics
    ///
    /// Panics if `stream_name` is empty or contains the reserved row-key
    /// separator (§3) — test-only, callers control the name.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn counter_registry(
        stream_name: &str,
    ) -> Arc<StreamRegistry<CounterEvent, CounterProjection>> {
        let stream = StreamDef::new(
            StreamName::new(stream_name).expect("valid stream name"),
            HashSet::from(["CounterEvent.Added.v1"]),
        )
        .with_handler(Arc::new(CounterHandler));
        Arc::new(
            StreamRegistryBuilder::new()
                .stream(stream)
                .build()
                .expect("single-stream registry is always valid"),
        )
    }
}

/// `proptest` strategies generating [`fixtures::CounterEvent`] sequences and
/// grain ids, shared by the property tests enumerated in §8.
pub mod strategies {
    use super::fixtures::CounterEvent;
    use grainstore_core::ids::GrainId;
    use proptest::prelude::*;

    /// A single event, amount bounded so sums stay well under `u64::MAX`
    /// across realistic batch sizes.
    pub fn counter_event() -> impl Strategy<Value = CounterEvent> {
        (0u64..1000).prop_map(CounterEvent::Added)
    }

    /// A batch of `1..=max_len` events, as submitted together in one `apply`
    /// call (§4.6).
    pub fn counter_event_batch(max_len: usize) -> impl Strategy<Value = Vec<CounterEvent>> {
        proptest::collection::vec(counter_event(), 1..=max_len)
    }

    /// Several independently-submitted batches against the same grain, for
    /// exercising sequential `apply` calls (§8 invariant 1: sequence numbers
    /// are strictly increasing and never reused).
    pub fn counter_event_batches(
        max_batches: usize,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<Vec<CounterEvent>>> {
        proptest::collection::vec(counter_event_batch(max_len), 1..=max_batches)
    }

    /// An arbitrary, nonempty, ASCII grain id.
    pub fn grain_id() -> impl Strategy<Value = GrainId> {
        "[a-z][a-z0-9-]{0,15}".prop_map(GrainId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_is_stable() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[tokio::test]
    async fn counter_registry_folds_events() {
        use fixtures::{CounterEvent, counter_registry};
        use grainstore_core::ids::GrainId;
        use grainstore_core::processor::{self, ProjectionWriteIntent};
        use grainstore_memory::MemoryRowStore;
        use std::sync::Arc;

        let store: Arc<dyn grainstore_core::backend::RowStore> = Arc::new(MemoryRowStore::new());
        let registry = counter_registry("counts");
        let mut projection = Default::default();

        let outcome = processor::apply(
            store.as_ref(),
            &GrainId::new("g1"),
            registry.as_ref(),
            &mut projection,
            grainstore_core::ids::Sequence::ZERO,
            0,
            ProjectionWriteIntent::Insert,
            vec![CounterEvent::Added(3), CounterEvent::Added(4)],
            grainstore_core::backend::DEFAULT_MAX_BATCH_SIZE,
        )
        .await
        .unwrap();

        assert_eq!(projection.total, 7);
        assert_eq!(projection.applied, 2);
        assert_eq!(outcome.new_event_version_tokens.len(), 2);
    }
}
