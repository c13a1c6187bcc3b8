//! Projection / event processor (§4.6): dispatch events to handlers and
//! reactors; produce a new projection and a [`SaveOperation`].

use crate::backend::RowStore;
use crate::error::StoreError;
use crate::event::{Event, EventRecord};
use crate::ids::{EventId, GrainId, Sequence, StreamName, VersionToken};
use crate::query::{self, QueryOptions};
use crate::reactor::ReactorState;
use crate::registry::StreamRegistry;
use crate::retention;
use crate::save::{self, EventWrite, ProjectionWrite, SaveOperation, SaveOutcome, StreamWrite};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;

/// Mutable context passed to a [`Handler`] invocation (§4.6 "Handler context
/// contract").
pub struct HandlerContext<'a, E> {
    grain_id: &'a GrainId,
    store: &'a dyn RowStore,
    appended: Vec<E>,
}

impl<'a, E> HandlerContext<'a, E> {
    fn new(grain_id: &'a GrainId, store: &'a dyn RowStore) -> Self {
        Self {
            grain_id,
            store,
            appended: Vec::new(),
        }
    }

    /// This grain's identity.
    #[must_use]
    pub fn grain_id(&self) -> &GrainId {
        self.grain_id
    }

    /// Schedule `event` for in-fold processing, to run immediately after the
    /// event currently being handled (§4.6 "depth-first, in order of
    /// append").
    pub fn append(&mut self, event: E) {
        self.appended.push(event);
    }

    /// Proxy to the query engine (§4.2), scoped to this grain.
    ///
    /// # Errors
    ///
    /// Returns whatever [`query::load_events`] returns.
    pub async fn get_events(
        &self,
        stream: Option<&StreamName>,
        opts: &QueryOptions,
    ) -> Result<Vec<EventRecord>, StoreError> {
        query::load_events(self.store, self.grain_id, stream, opts).await
    }
}

/// A handler bound to a stream (§4.7): folds one event into the next
/// projection, optionally appending further events via the context.
///
/// The explicit `Pin<Box<dyn Future>>` return keeps this trait dyn-compatible
/// (registries store handlers as `Arc<dyn Handler<E, P>>`), matching the
/// pattern used by [`crate::reactor::Reactor`].
pub trait Handler<E, P>: Send + Sync {
    /// Fold `event` into `projection`, returning the next projection value.
    /// May call `ctx.append` to schedule further in-fold events.
    fn handle<'a>(
        &'a self,
        event: &'a E,
        projection: &'a P,
        ctx: &'a mut HandlerContext<'_, E>,
    ) -> Pin<Box<dyn Future<Output = P> + Send + 'a>>;
}

/// How the projection row should be written on this save (§4.3).
pub enum ProjectionWriteIntent {
    /// No projection row exists yet for this grain.
    Insert,
    /// A projection row exists with this CAS witness.
    Cas(VersionToken),
}

/// Fold `events` into `projection` (§4.6 "Apply algorithm"), producing the
/// updated projection and the [`SaveOutcome`] of persisting it.
///
/// `base_next_sequence`/`base_event_count` are the projection's current
/// bookkeeping fields (from [`load`] or a prior `apply`); `max_batch_size` is
/// the backend's transaction size limit (§6).
///
/// # Errors
///
/// Returns [`StoreError::ConcurrencyConflict`] if `projection_write` is a
/// stale CAS (§4.6 step 4: "the caller reloads ... and re-applies"), or any
/// other error [`save::save`] can produce. Handler/event serialization
/// failures surface as [`StoreError::MalformedRow`].
#[allow(clippy::too_many_arguments)]
pub async fn apply<E, P>(
    store: &dyn RowStore,
    grain_id: &GrainId,
    registry: &StreamRegistry<E, P>,
    projection: &mut P,
    base_next_sequence: Sequence,
    base_event_count: u64,
    projection_write: ProjectionWriteIntent,
    events: Vec<E>,
    max_batch_size: usize,
) -> Result<SaveOutcome, StoreError>
where
    E: Event + Serialize + Clone,
    P: Serialize,
{
    let span = tracing::debug_span!("apply", grain_id = %grain_id, event_count = events.len());
    let _enter = span.enter();

    let mut queue: VecDeque<E> = events.into_iter().collect();
    let mut stream_writes: HashMap<String, Vec<EventWrite>> = HashMap::new();
    let mut total_new: u64 = 0;

    while let Some(event) = queue.pop_front() {
        let matching = registry.matching_streams(event.event_type());
        let mut appended_after: Vec<E> = Vec::new();

        for stream_def in &matching {
            let mut ctx = HandlerContext::new(grain_id, store);
            for handler in &stream_def.handlers {
                let next = handler.handle(&event, projection, &mut ctx).await;
                *projection = next;
            }
            appended_after.append(&mut ctx.appended);
        }

        for (offset, appended) in appended_after.into_iter().enumerate() {
            queue.insert(offset, appended);
        }

        if matching.is_empty() {
            continue;
        }

        let event_id = EventId::new_v4();
        let data = event
            .to_bytes()
            .map_err(|e| StoreError::MalformedRow(e.to_string()))?;

        for stream_def in &matching {
            let reactor_status: Vec<ReactorState> = stream_def
                .reactors
                .iter()
                .map(|r| ReactorState::initial(r.id().clone(), Utc::now()))
                .collect();
            stream_writes
                .entry(stream_def.name.as_str().to_string())
                .or_default()
                .push(EventWrite::New {
                    event_type: event.event_type().to_string(),
                    data: data.clone(),
                    event_id,
                    reactor_status,
                });
            total_new += 1;
        }
    }

    let final_next_sequence = Sequence::new(base_next_sequence.value() + total_new);

    let mut stream_write_list = Vec::with_capacity(stream_writes.len());
    for (name, entries) in stream_writes {
        let stream_name =
            StreamName::new(name).map_err(|e| StoreError::ConfigInvalid(e.to_string()))?;
        stream_write_list.push(StreamWrite {
            stream_name,
            entries,
        });
    }

    let mut retention_deletes = Vec::new();
    for stream_def in registry.streams() {
        let pending_new_count = stream_write_list
            .iter()
            .find(|sw| sw.stream_name == stream_def.name)
            .map_or(0, |sw| {
                sw.entries
                    .iter()
                    .filter(|e| matches!(e, EventWrite::New { .. }))
                    .count() as u64
            });
        let deletes = retention::plan(
            store,
            grain_id,
            &stream_def.name,
            &stream_def.retention_policy,
            pending_new_count,
        )
        .await?;
        retention_deletes.extend(deletes);
    }

    // event_count tracks currently-retained rows, not lifetime appends (§3):
    // a retention sweep's deletes (best-effort, may lag) bring it back down.
    let final_event_count =
        (base_event_count + total_new).saturating_sub(retention_deletes.len() as u64);

    let projection_bytes =
        bincode::serialize(projection).map_err(|e| StoreError::MalformedRow(e.to_string()))?;
    let projection_write = match projection_write {
        ProjectionWriteIntent::Insert => ProjectionWrite::Insert {
            data: projection_bytes,
        },
        ProjectionWriteIntent::Cas(expected) => ProjectionWrite::Cas {
            expected,
            data: projection_bytes,
        },
    };

    save::save(
        store,
        SaveOperation {
            grain_id: grain_id.clone(),
            projection_write,
            next_sequence: final_next_sequence,
            event_count: final_event_count,
            stream_writes: stream_write_list,
            retention_deletes,
            max_batch_size,
        },
    )
    .await
}

/// Activation-time restore (§4.6 `load()`): fetch the projection row and
/// decode it, or fall back to `P::default()` if absent or malformed (§4.2
/// "the processor treats this as default").
///
/// # Errors
///
/// Returns whatever [`query::load_projection`] returns for backend failures.
pub async fn load<P>(
    store: &dyn RowStore,
    grain_id: &GrainId,
) -> Result<crate::projection::ProjectionMeta<P>, StoreError>
where
    P: DeserializeOwned + Default,
{
    match query::load_projection(store, grain_id).await? {
        Some(row) => {
            let data = bincode::deserialize(&row.data).unwrap_or_default();
            Ok(crate::projection::ProjectionMeta {
                data,
                next_sequence: row.next_sequence,
                event_count: row.event_count,
                timestamp: row.timestamp,
                version_token: row.version_token,
            })
        }
        None => Ok(crate::projection::ProjectionMeta::fresh(P::default())),
    }
}
