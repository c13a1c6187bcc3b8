//! Reactor batch dispatch (§4.5): pick up a reactor's pending events,
//! coalesce consecutive matching runs, and drive each run through `react`
//! under the engine's per-reactor circuit breaker.
//!
//! This module supplies the dispatcher §4.5 describes the state machine
//! for but does not itself provide; persisting the returned states back
//! onto their event rows is the caller's job via a reactor-update
//! `StreamWrite` (§4.3).

use crate::{GrainEngine, dispatch_guarded};
use chrono::{DateTime, Utc};
use grainstore_core::event::{Event, EventError, EventRecord};
use grainstore_core::ids::EventId;
use grainstore_core::reactor::{Reactor, ReactorId, ReactorState, ReactorStatus};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Group `records` (sequence-ordered per §4.2) into maximal consecutive
/// runs where `reactor_id` has a `pending` state (§4.5 "Batching": "the
/// engine may coalesce consecutive matching events in sequence order into
/// one call"). A record with no state for this reactor, or a non-pending
/// one, ends the current run.
#[must_use]
pub fn coalesce_pending_batches<'a>(
    records: &'a [EventRecord],
    reactor_id: &ReactorId,
) -> Vec<&'a [EventRecord]> {
    let mut batches = Vec::new();
    let mut start = None;
    for (i, record) in records.iter().enumerate() {
        let pending = record
            .reactor_status
            .iter()
            .any(|s| &s.reactor_id == reactor_id && s.status == ReactorStatus::Pending);
        match (pending, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                batches.push(&records[s..i]);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        batches.push(&records[s..]);
    }
    batches
}

/// Dispatch every pending batch for `reactor` against `records` (§4.5):
/// marks each batch `in_progress`, invokes `react` guarded by the engine's
/// per-reactor circuit breaker, then records success or failure. Returns
/// the updated state per touched event for the caller to persist.
///
/// # Errors
///
/// Returns [`EventError`] if a record's payload fails to decode into `E`.
pub async fn dispatch_reactor<E, P, R>(
    engine: &GrainEngine<E, P>,
    reactor: &R,
    projection: &P,
    records: &[EventRecord],
    now: DateTime<Utc>,
) -> Result<Vec<(EventId, ReactorState)>, EventError>
where
    E: Event + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    P: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    R: Reactor<E, P> + ?Sized,
{
    let mut updates = Vec::new();

    for batch in coalesce_pending_batches(records, reactor.id()) {
        let events = batch
            .iter()
            .map(|record| E::from_bytes(&record.data))
            .collect::<Result<Vec<E>, _>>()?;

        let mut states: Vec<ReactorState> = batch
            .iter()
            .map(|record| {
                record
                    .reactor_status
                    .iter()
                    .find(|state| state.reactor_id == *reactor.id())
                    .cloned()
                    .unwrap_or_else(|| ReactorState::initial(reactor.id().clone(), now))
            })
            .collect();
        for state in &mut states {
            state.record_in_progress(now);
        }

        let outcome = dispatch_guarded(engine, reactor.id(), || reactor.react(&events, projection)).await;
        match outcome {
            Ok(()) => {
                for state in &mut states {
                    state.record_success(now);
                }
            }
            Err(_) => {
                for state in &mut states {
                    state.record_failure(reactor.max_attempts(), now);
                }
            }
        }

        updates.extend(batch.iter().zip(states).map(|(record, state)| (record.event_id, state)));
    }

    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grainstore_core::ids::{Sequence, VersionToken};
    use grainstore_core::registry::{StreamDef, StreamRegistryBuilder};
    use grainstore_memory::MemoryRowStore;
    use std::collections::HashSet;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct Noted;

    impl Event for Noted {
        fn event_type(&self) -> &'static str {
            "Noted"
        }
    }

    fn record(reactor_id: &ReactorId, status: ReactorStatus, seq: u64) -> EventRecord {
        EventRecord {
            stream_name: grainstore_core::ids::StreamName::new("notes").unwrap(),
            event_type: "Noted".to_string(),
            data: Noted.to_bytes().unwrap(),
            event_id: EventId::new_v4(),
            sequence: Sequence::new(seq),
            timestamp: Utc::now(),
            reactor_status: vec![ReactorState {
                reactor_id: reactor_id.clone(),
                attempts: 0,
                status,
                last_update: Utc::now(),
            }],
            version_token: VersionToken::from_generation(0),
        }
    }

    #[test]
    fn coalesces_only_consecutive_pending_runs() {
        let reactor_id = ReactorId::new("notify");
        let records = vec![
            record(&reactor_id, ReactorStatus::Pending, 0),
            record(&reactor_id, ReactorStatus::Pending, 1),
            record(&reactor_id, ReactorStatus::CompleteSuccessful, 2),
            record(&reactor_id, ReactorStatus::Pending, 3),
        ];

        let batches = coalesce_pending_batches(&records, &reactor_id);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn no_pending_records_yield_no_batches() {
        let reactor_id = ReactorId::new("notify");
        let records = vec![record(&reactor_id, ReactorStatus::CompleteSuccessful, 0)];
        assert!(coalesce_pending_batches(&records, &reactor_id).is_empty());
    }

    struct CountingReactor {
        id: ReactorId,
        batch_sizes: Arc<std::sync::Mutex<Vec<usize>>>,
        fail: AtomicUsize,
    }

    impl Reactor<Noted, ()> for CountingReactor {
        fn id(&self) -> &ReactorId {
            &self.id
        }

        fn matches(&self, _event: &Noted) -> bool {
            true
        }

        fn react<'a>(
            &'a self,
            batch: &'a [Noted],
            _projection: &'a (),
        ) -> Pin<Box<dyn std::future::Future<Output = Result<(), grainstore_core::reactor::ReactorError>> + Send + 'a>>
        {
            Box::pin(async move {
                self.batch_sizes.lock().unwrap().push(batch.len());
                if self.fail.load(Ordering::SeqCst) > 0 {
                    self.fail.fetch_sub(1, Ordering::SeqCst);
                    Err(grainstore_core::reactor::ReactorError("nope".to_string()))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn dispatch_reactor_coalesces_and_marks_terminal_state() {
        let reactor_id = ReactorId::new("notify");
        let records = vec![
            record(&reactor_id, ReactorStatus::Pending, 0),
            record(&reactor_id, ReactorStatus::Pending, 1),
        ];

        let stream = StreamDef::new(
            grainstore_core::ids::StreamName::new("notes").unwrap(),
            HashSet::from(["Noted"]),
        );
        let registry = Arc::new(StreamRegistryBuilder::new().stream(stream).build().unwrap());
        let store: Arc<dyn grainstore_core::backend::RowStore> = Arc::new(MemoryRowStore::new());
        let engine: GrainEngine<Noted, ()> =
            GrainEngine::new(store, registry, crate::EngineConfig::default());

        let reactor = CountingReactor {
            id: reactor_id.clone(),
            batch_sizes: Arc::new(std::sync::Mutex::new(Vec::new())),
            fail: AtomicUsize::new(0),
        };

        let updates = dispatch_reactor(&engine, &reactor, &(), &records, Utc::now())
            .await
            .unwrap();

        assert_eq!(*reactor.batch_sizes.lock().unwrap(), vec![2]);
        assert_eq!(updates.len(), 2);
        assert!(
            updates
                .iter()
                .all(|(_, state)| state.status == ReactorStatus::CompleteSuccessful)
        );
    }

    #[tokio::test]
    async fn dispatch_reactor_records_failure_under_max_attempts_as_pending() {
        let reactor_id = ReactorId::new("notify");
        let records = vec![record(&reactor_id, ReactorStatus::Pending, 0)];

        let stream = StreamDef::new(
            grainstore_core::ids::StreamName::new("notes").unwrap(),
            HashSet::from(["Noted"]),
        );
        let registry = Arc::new(StreamRegistryBuilder::new().stream(stream).build().unwrap());
        let store: Arc<dyn grainstore_core::backend::RowStore> = Arc::new(MemoryRowStore::new());
        let engine: GrainEngine<Noted, ()> =
            GrainEngine::new(store, registry, crate::EngineConfig::default());

        let reactor = CountingReactor {
            id: reactor_id.clone(),
            batch_sizes: Arc::new(std::sync::Mutex::new(Vec::new())),
            fail: AtomicUsize::new(1),
        };

        let updates = dispatch_reactor(&engine, &reactor, &(), &records, Utc::now())
            .await
            .unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.status, ReactorStatus::Pending);
        assert_eq!(updates[0].1.attempts, 1);
    }
}
