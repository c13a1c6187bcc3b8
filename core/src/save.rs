//! Save coordinator (§4.3): assemble atomic batches, map backend errors to
//! domain errors.
//!
//! Only the primary batch's outcome is caller-visible durability (§4.3
//! "Durability contract"). Reactor-status updates and retention deletes are
//! catch-up work: their failures are logged and swallowed, never propagated.

use crate::backend::{Action, BackendError, RowStore};
use crate::codec;
use crate::error::StoreError;
use crate::ids::{EventId, GrainId, Sequence, StreamName, VersionToken};
use crate::reactor::ReactorState;

/// One entry within a [`StreamWrite`] (§4.3).
#[derive(Clone, Debug)]
pub enum EventWrite {
    /// A brand-new event: the coordinator assigns its sequence and inserts
    /// it with `insert_if_absent`.
    New {
        /// Discriminator tag.
        event_type: String,
        /// Opaque serialized payload.
        data: Vec<u8>,
        /// Stable dedup identifier.
        event_id: EventId,
        /// Initial per-reactor state for every reactor that matches this
        /// event (§3 invariant 5, §4.5 "Initial on first save").
        reactor_status: Vec<ReactorState>,
    },
    /// A reactor-status rewrite for an already-persisted event: replaces the
    /// row with `replace_cas`, reusing the event's existing `sequence` (§9
    /// Open Question 3).
    ReactorUpdate {
        /// Discriminator tag, unchanged from the original write.
        event_type: String,
        /// Opaque serialized payload, unchanged from the original write.
        data: Vec<u8>,
        /// Stable dedup identifier, unchanged from the original write.
        event_id: EventId,
        /// The event's already-assigned sequence.
        sequence: Sequence,
        /// CAS witness observed when this record was loaded.
        expected: VersionToken,
        /// The new per-reactor progress to persist.
        reactor_status: Vec<ReactorState>,
    },
}

/// One stream's contribution to a save (§4.3).
#[derive(Clone, Debug)]
pub struct StreamWrite {
    /// Target stream.
    pub stream_name: StreamName,
    /// New events and/or reactor-status updates for this stream.
    pub entries: Vec<EventWrite>,
}

/// How the projection row should be written (§4.3 "insert if `version_token`
/// absent; CAS-replace otherwise").
#[derive(Clone, Debug)]
pub enum ProjectionWrite {
    /// No prior projection row exists for this grain; write unconditionally.
    Insert {
        /// Serialized projection value.
        data: Vec<u8>,
    },
    /// A prior projection row exists; replace it only if its token still
    /// matches.
    Cas {
        /// CAS witness observed when the projection was loaded.
        expected: VersionToken,
        /// Serialized projection value.
        data: Vec<u8>,
    },
}

/// A pending retention delete (§4.4), submitted best-effort after the
/// primary batch and any reactor updates.
#[derive(Clone, Debug)]
pub struct RetentionDelete {
    /// Row key to delete.
    pub row_key: Vec<u8>,
    /// Expected version token, or `None` for an unconditional delete.
    pub expected: Option<VersionToken>,
}

/// The full input to [`save`] (§4.3).
#[derive(Clone, Debug)]
pub struct SaveOperation {
    /// Grain being saved.
    pub grain_id: GrainId,
    /// How to write the projection row.
    pub projection_write: ProjectionWrite,
    /// The final `next_sequence` after this save's new events are assigned.
    pub next_sequence: Sequence,
    /// The final `event_count` after this save.
    pub event_count: u64,
    /// Per-stream writes.
    pub stream_writes: Vec<StreamWrite>,
    /// Retention deletes computed for this save (§4.4), applied best-effort.
    pub retention_deletes: Vec<RetentionDelete>,
    /// Backend transaction size limit (§6, §9 "must not be baked into the
    /// core"); defaults to [`crate::backend::DEFAULT_MAX_BATCH_SIZE`].
    pub max_batch_size: usize,
}

/// Result of a successful [`save`] (§4.3 step 4's guaranteed durability).
#[derive(Clone, Debug)]
pub struct SaveOutcome {
    /// The projection row's fresh version token.
    pub projection_version_token: VersionToken,
    /// Fresh version tokens for every `New` event write, in the flattened
    /// `stream_writes` submission order.
    pub new_event_version_tokens: Vec<VersionToken>,
    /// The `next_sequence` now persisted for this grain — the authoritative
    /// value callers must carry forward as the next save's base, since it
    /// already accounts for this save's new events.
    pub final_next_sequence: Sequence,
    /// The `event_count` now persisted for this grain (§3 "currently
    /// retained") — already accounts for this save's own retention deletes,
    /// unlike a naive `base + new_events` running total.
    pub final_event_count: u64,
}

fn map_primary_err(
    err: BackendError,
    grain_id: &GrainId,
    first_new: Option<(&StreamName, Sequence)>,
) -> StoreError {
    match err {
        BackendError::PreconditionFailed => StoreError::ConcurrencyConflict {
            grain_id: grain_id.clone(),
        },
        BackendError::Conflict => match first_new {
            // A `Conflict` can only come from an `InsertIfAbsent` action,
            // which the primary batch only ever contains for new events.
            Some((stream_name, sequence)) => StoreError::DuplicateEvent {
                grain_id: grain_id.clone(),
                stream_name: stream_name.clone(),
                sequence,
            },
            None => StoreError::FatalBackend(
                "backend reported a conflict with no new-event write in the primary batch".into(),
            ),
        },
        BackendError::Transient(msg) => StoreError::TransientBackend(msg),
        BackendError::Fatal(msg) => StoreError::FatalBackend(msg),
    }
}

/// Run the §4.3 algorithm: assemble the primary batch, submit it, then
/// best-effort submit reactor updates and retention deletes.
///
/// # Errors
///
/// Returns [`StoreError::TooLarge`] if the primary batch (new events plus
/// the projection write) exceeds `max_batch_size` even after opportunistic
/// packing (§4.3 step 2-3). Returns [`StoreError::ConcurrencyConflict`],
/// [`StoreError::DuplicateEvent`], [`StoreError::TransientBackend`], or
/// [`StoreError::FatalBackend`] per the primary submit's outcome (§4.3
/// step 4). Best-effort batches never contribute to this return value.
pub async fn save(
    store: &dyn RowStore,
    op: SaveOperation,
) -> Result<SaveOutcome, StoreError> {
    let mut sequence = op.next_sequence;
    let total_new: usize = op
        .stream_writes
        .iter()
        .flat_map(|sw| sw.entries.iter())
        .filter(|e| matches!(e, EventWrite::New { .. }))
        .count();
    // Walk backwards from the final next_sequence to recover each new
    // event's assigned sequence: the coordinator assigns sequences in
    // stream_writes/entries order starting at the *pre-save* next_sequence.
    let start_sequence = Sequence::new(sequence.value() - total_new as u64);
    sequence = start_sequence;

    let mut primary_actions = Vec::new();
    let mut first_new: Option<(StreamName, Sequence)> = None;

    match &op.projection_write {
        ProjectionWrite::Insert { data } => {
            let (row_key, value) =
                codec::encode_projection(data.clone(), op.next_sequence, op.event_count)?;
            primary_actions.push(Action::Upsert { row_key, value });
        }
        ProjectionWrite::Cas { expected, data } => {
            let (row_key, value) =
                codec::encode_projection(data.clone(), op.next_sequence, op.event_count)?;
            primary_actions.push(Action::ReplaceCas {
                row_key,
                value,
                expected: expected.clone(),
            });
        }
    }

    let mut reactor_actions = Vec::new();

    for stream_write in &op.stream_writes {
        for entry in &stream_write.entries {
            match entry {
                EventWrite::New {
                    event_type,
                    data,
                    event_id,
                    reactor_status,
                } => {
                    let (row_key, value) = codec::encode_event(
                        &stream_write.stream_name,
                        event_type,
                        data.clone(),
                        *event_id,
                        sequence,
                        reactor_status.clone(),
                    )?;
                    if first_new.is_none() {
                        first_new = Some((stream_write.stream_name.clone(), sequence));
                    }
                    primary_actions.push(Action::InsertIfAbsent { row_key, value });
                    sequence = sequence.next();
                }
                EventWrite::ReactorUpdate {
                    event_type,
                    data,
                    event_id,
                    sequence: event_sequence,
                    expected,
                    reactor_status,
                } => {
                    let (row_key, value) = codec::encode_event(
                        &stream_write.stream_name,
                        event_type,
                        data.clone(),
                        *event_id,
                        *event_sequence,
                        reactor_status.clone(),
                    )?;
                    reactor_actions.push(Action::ReplaceCas {
                        row_key,
                        value,
                        expected: expected.clone(),
                    });
                }
            }
        }
    }

    let limit = op.max_batch_size;
    let capacity = limit.saturating_sub(primary_actions.len());
    let moved = reactor_actions.len().min(capacity);
    let opportunistic: Vec<Action> = reactor_actions.drain(..moved).collect();
    primary_actions.extend(opportunistic);

    if primary_actions.len() > limit {
        return Err(StoreError::TooLarge {
            grain_id: op.grain_id.clone(),
            action_count: primary_actions.len(),
            limit,
        });
    }

    let new_event_count = total_new;
    let outcome = store
        .submit_transaction(&op.grain_id, primary_actions)
        .await
        .map_err(|err| {
            map_primary_err(
                err,
                &op.grain_id,
                first_new.as_ref().map(|(s, seq)| (s, *seq)),
            )
        })?;

    let mut tokens = outcome.version_tokens.into_iter();
    let projection_version_token = tokens.next().unwrap_or_else(|| VersionToken::from_bytes(Vec::new()));
    let new_event_version_tokens: Vec<VersionToken> = tokens.by_ref().take(new_event_count).collect();

    for chunk in reactor_actions.chunks(limit.max(1)) {
        if let Err(err) = store
            .submit_transaction(&op.grain_id, chunk.to_vec())
            .await
        {
            tracing::warn!(grain_id = %op.grain_id, error = %err, "reactor-status update batch failed, will retry on next save");
        }
    }

    for chunk in op.retention_deletes.chunks(limit.max(1)) {
        let actions: Vec<Action> = chunk
            .iter()
            .map(|d| Action::Delete {
                row_key: d.row_key.clone(),
                expected: d.expected.clone(),
            })
            .collect();
        if let Err(err) = store.submit_transaction(&op.grain_id, actions).await {
            tracing::warn!(grain_id = %op.grain_id, error = %err, "retention delete batch failed, row will be re-identified next sweep");
        }
    }

    Ok(SaveOutcome {
        projection_version_token,
        new_event_version_tokens,
        final_next_sequence: op.next_sequence,
        final_event_count: op.event_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Row, RowKeyRange, TransactionOutcome};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        submitted: Mutex<Vec<Vec<Action>>>,
    }

    impl RowStore for FakeStore {
        fn get<'a>(
            &'a self,
            _partition: &'a GrainId,
            _row_key: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = Result<Option<Row>, BackendError>> + Send + 'a>> {
            Box::pin(async { Ok(None) })
        }

        fn query<'a>(
            &'a self,
            _partition: &'a GrainId,
            _range: RowKeyRange,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Row>, BackendError>> + Send + 'a>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn submit_transaction<'a>(
            &'a self,
            _partition: &'a GrainId,
            actions: Vec<Action>,
        ) -> Pin<Box<dyn Future<Output = Result<TransactionOutcome, BackendError>> + Send + 'a>>
        {
            let count = actions.len();
            self.submitted.lock().unwrap().push(actions);
            Box::pin(async move {
                Ok(TransactionOutcome {
                    version_tokens: (0..count)
                        .map(|i| VersionToken::from_generation(i as u64 + 1))
                        .collect(),
                })
            })
        }
    }

    fn fresh_op(grain_id: &str, events: Vec<&str>) -> SaveOperation {
        let stream = StreamName::new("orders").unwrap();
        let entries = events
            .into_iter()
            .map(|t| EventWrite::New {
                event_type: t.to_string(),
                data: vec![1],
                event_id: EventId::new_v4(),
                reactor_status: vec![],
            })
            .collect::<Vec<_>>();
        let count = entries.len() as u64;
        SaveOperation {
            grain_id: GrainId::new(grain_id),
            projection_write: ProjectionWrite::Insert { data: vec![] },
            next_sequence: Sequence::new(count),
            event_count: count,
            stream_writes: vec![StreamWrite {
                stream_name: stream,
                entries,
            }],
            retention_deletes: vec![],
            max_batch_size: 100,
        }
    }

    #[tokio::test]
    async fn linear_append_assigns_sequences_from_zero() {
        let store = FakeStore::default();
        let op = fresh_op("g1", vec!["A", "B", "C"]);
        let outcome = save(&store, op).await.unwrap();
        assert_eq!(outcome.new_event_version_tokens.len(), 3);
        let submitted = store.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].len(), 4); // projection + 3 events
    }

    #[tokio::test]
    async fn oversized_primary_batch_fails_fast() {
        let store = FakeStore::default();
        let mut op = fresh_op("g1", vec!["A", "B"]);
        op.max_batch_size = 1;
        let err = save(&store, op).await.unwrap_err();
        assert!(matches!(err, StoreError::TooLarge { .. }));
    }
}
