//! Property tests against the §8 invariants, using the strategies in
//! `grainstore_testing::strategies`.

use grainstore_core::backend::DEFAULT_MAX_BATCH_SIZE;
use grainstore_core::ids::{Sequence, StreamName};
use grainstore_core::processor::{self, ProjectionWriteIntent};
use grainstore_core::query::{self, QueryOptions};
use grainstore_core::retention::RetentionPolicy;
use grainstore_memory::MemoryRowStore;
use grainstore_testing::fixtures::{CounterEvent, CounterProjection, counter_registry};
use grainstore_testing::strategies;
use proptest::prelude::*;
use std::collections::HashSet;

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Runtime::new().unwrap().block_on(fut)
}

proptest! {
    /// Invariant 1: after a successful `apply` on a fresh grain, the
    /// persisted events equal the input batch in order, and the projection
    /// equals the left-fold of the handler over that batch from the
    /// type default.
    #[test]
    fn invariant1_apply_persists_in_order_and_folds_projection(
        grain in strategies::grain_id(),
        batch in strategies::counter_event_batch(20),
    ) {
        block_on(async {
            let store = MemoryRowStore::new();
            let grain_id = &grain;
            let registry = counter_registry("counts");
            let mut projection = CounterProjection::default();

            processor::apply(
                &store,
                &grain_id,
                registry.as_ref(),
                &mut projection,
                Sequence::ZERO,
                0,
                ProjectionWriteIntent::Insert,
                batch.clone(),
                DEFAULT_MAX_BATCH_SIZE,
            )
            .await
            .unwrap();

            let events = query::load_events(&store, &grain_id, None, &QueryOptions::default())
                .await
                .unwrap();
            prop_assert_eq!(events.len(), batch.len());
            for (i, record) in events.iter().enumerate() {
                prop_assert_eq!(record.sequence, Sequence::new(i as u64));
                prop_assert_eq!(record.event_type.as_str(), "CounterEvent.Added.v1");
            }

            let expected_total: u64 = batch.iter().map(|CounterEvent::Added(a)| *a).sum();
            prop_assert_eq!(projection.total, expected_total);
            prop_assert_eq!(projection.applied as usize, batch.len());
            Ok(())
        })?;
    }

    /// Invariant 2: sequence numbers assigned across a partition are unique
    /// and strictly increasing, across any number of independently-submitted
    /// batches against the same grain.
    #[test]
    fn invariant2_sequences_strictly_increasing_no_duplicates(
        grain in strategies::grain_id(),
        batches in strategies::counter_event_batches(6, 8),
    ) {
        block_on(async {
            let store = MemoryRowStore::new();
            let grain_id = &grain;
            let registry = counter_registry("counts");
            let mut state = processor::load::<CounterProjection>(&store, &grain_id).await.unwrap();

            for batch in &batches {
                let mut projection = state.data.clone();
                let intent = if state.next_sequence.value() == 0 && state.event_count == 0 {
                    ProjectionWriteIntent::Insert
                } else {
                    ProjectionWriteIntent::Cas(state.version_token.clone())
                };
                processor::apply(
                    &store,
                    &grain_id,
                    registry.as_ref(),
                    &mut projection,
                    state.next_sequence,
                    state.event_count,
                    intent,
                    batch.clone(),
                    DEFAULT_MAX_BATCH_SIZE,
                )
                .await
                .unwrap();
                state = processor::load::<CounterProjection>(&store, &grain_id).await.unwrap();
            }

            let events = query::load_events(&store, &grain_id, None, &QueryOptions::default())
                .await
                .unwrap();
            let mut seen = HashSet::new();
            let mut prev: Option<Sequence> = None;
            for record in &events {
                prop_assert!(seen.insert(record.sequence), "duplicate sequence {:?}", record.sequence);
                if let Some(prev_seq) = prev {
                    prop_assert!(record.sequence > prev_seq, "sequence out of order");
                }
                prev = Some(record.sequence);
            }
            Ok(())
        })?;
    }

    /// Invariant 3: retention planning is idempotent — given the same
    /// persisted rows and the same count of not-yet-written new events,
    /// running the planner twice without intervening writes yields the same
    /// delete set.
    #[test]
    fn invariant3_retention_planning_is_idempotent(
        grain in strategies::grain_id(),
        batch in strategies::counter_event_batch(15),
        keep_count in 0u64..10,
    ) {
        block_on(async {
            let store = MemoryRowStore::new();
            let grain_id = &grain;
            let stream_name = StreamName::new("counts").unwrap();
            let policy = RetentionPolicy::builder().keep_count(keep_count).build().unwrap();

            let registry = counter_registry("counts");
            let mut projection = CounterProjection::default();
            processor::apply(
                &store,
                &grain_id,
                registry.as_ref(),
                &mut projection,
                Sequence::ZERO,
                0,
                ProjectionWriteIntent::Insert,
                batch,
                DEFAULT_MAX_BATCH_SIZE,
            )
            .await
            .unwrap();

            let mut first = grainstore_core::retention::plan(&store, &grain_id, &stream_name, &policy, 0)
                .await
                .unwrap()
                .into_iter()
                .map(|d| d.row_key)
                .collect::<Vec<_>>();
            let mut second = grainstore_core::retention::plan(&store, &grain_id, &stream_name, &policy, 0)
                .await
                .unwrap()
                .into_iter()
                .map(|d| d.row_key)
                .collect::<Vec<_>>();
            first.sort();
            second.sort();
            prop_assert_eq!(first, second);
            Ok(())
        })?;
    }

    /// Invariant 7 (keep_count dimension): after any number of single-event
    /// saves, the stream holds exactly `min(keep_count, persisted_count)`
    /// rows.
    #[test]
    fn invariant7_keep_count_boundary_is_exact(
        grain in strategies::grain_id(),
        keep_count in 1u64..8,
        save_count in 1u64..15,
    ) {
        block_on(async {
            let store = MemoryRowStore::new();
            let grain_id = &grain;
            let stream = grainstore_core::registry::StreamDef::new(
                StreamName::new("counts").unwrap(),
                std::collections::HashSet::from(["CounterEvent.Added.v1"]),
            )
            .with_retention(RetentionPolicy::builder().keep_count(keep_count).build().unwrap());
            let registry = grainstore_core::registry::StreamRegistryBuilder::new()
                .stream(stream)
                .build()
                .unwrap();

            let mut state = processor::load::<()>(&store, &grain_id).await.unwrap();
            for _ in 0..save_count {
                let mut projection = state.data;
                let intent = if state.next_sequence.value() == 0 && state.event_count == 0 {
                    ProjectionWriteIntent::Insert
                } else {
                    ProjectionWriteIntent::Cas(state.version_token.clone())
                };
                processor::apply(
                    &store,
                    &grain_id,
                    &registry,
                    &mut projection,
                    state.next_sequence,
                    state.event_count,
                    intent,
                    vec![CounterEvent::Added(1)],
                    DEFAULT_MAX_BATCH_SIZE,
                )
                .await
                .unwrap();
                state = processor::load::<()>(&store, &grain_id).await.unwrap();
            }

            let events = query::load_events(
                &store,
                &grain_id,
                Some(&StreamName::new("counts").unwrap()),
                &QueryOptions::default(),
            )
            .await
            .unwrap();
            let expected = keep_count.min(save_count) as usize;
            prop_assert_eq!(events.len(), expected);
            Ok(())
        })?;
    }
}
