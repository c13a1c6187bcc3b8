//! Query engine (§4.2): build backend filters, stream results, apply
//! client-side filters.
//!
//! `RowStore::query` only narrows by row-key range (§6); every predicate
//! that isn't expressible as a range — `max_age`, `event_id` equality,
//! `distinct_by_event_id`, `max_count` — is applied client-side here, after
//! the scan returns.

use crate::backend::{BackendError, Row, RowKeyRange, RowStore};
use crate::codec::{self, ProjectionRow};
use crate::error::StoreError;
use crate::event::EventRecord;
use crate::ids::{EventId, GrainId, Sequence, StreamName};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;

/// Filters for [`load_events`], all optional (§4.2).
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Inclusive lower bound on sequence.
    pub from_sequence: Option<Sequence>,
    /// Inclusive upper bound on sequence.
    pub to_sequence: Option<Sequence>,
    /// Only rows written within this duration of now.
    pub max_age: Option<ChronoDuration>,
    /// Only the event with this id.
    pub event_id: Option<EventId>,
    /// Keep only the first (earliest-sequence) occurrence per `event_id`.
    pub distinct_by_event_id: bool,
    /// Truncate the result to this many entries.
    pub max_count: Option<usize>,
}

fn map_backend_err(err: BackendError) -> StoreError {
    match err {
        BackendError::Transient(msg) => StoreError::TransientBackend(msg),
        BackendError::Fatal(msg) => StoreError::FatalBackend(msg),
        // get/query never submit CAS or insert actions, so these two
        // variants cannot occur on a read path.
        BackendError::PreconditionFailed | BackendError::Conflict => {
            StoreError::FatalBackend(err.to_string())
        }
    }
}

fn event_range(stream: Option<&StreamName>) -> RowKeyRange {
    match stream {
        Some(stream) => {
            let (start, end) = codec::stream_prefix_range(stream);
            RowKeyRange {
                start,
                end: Some(end),
            }
        }
        None => RowKeyRange {
            start: codec::all_events_start(),
            end: None,
        },
    }
}

fn decode_rows(rows: Vec<Row>) -> Vec<EventRecord> {
    rows.iter()
        .filter_map(|row| match codec::decode_event(row) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed event row");
                None
            }
        })
        .collect()
}

fn apply_filters(mut records: Vec<EventRecord>, opts: &QueryOptions) -> Vec<EventRecord> {
    if let Some(max_age) = opts.max_age {
        let cutoff = Utc::now() - max_age;
        records.retain(|r| r.timestamp >= cutoff);
    }
    if let Some(from) = opts.from_sequence {
        records.retain(|r| r.sequence >= from);
    }
    if let Some(to) = opts.to_sequence {
        records.retain(|r| r.sequence <= to);
    }
    if let Some(id) = opts.event_id {
        records.retain(|r| r.event_id == id);
    }
    if opts.distinct_by_event_id {
        let mut seen = HashSet::new();
        records.retain(|r| seen.insert(r.event_id));
    }
    if let Some(max_count) = opts.max_count {
        records.truncate(max_count);
    }
    records
}

/// Load every event matching `stream` and `opts`, ascending by sequence
/// (§4.2). When `stream` is `None`, rows from different streams interleave
/// by `(stream_name, sequence)` — the row-key order, since `stream_name` is
/// the leading key component.
///
/// # Errors
///
/// Returns [`StoreError::TransientBackend`] or [`StoreError::FatalBackend`]
/// if the backend scan fails; malformed rows are skipped, not errored.
pub async fn load_events(
    store: &dyn RowStore,
    grain_id: &GrainId,
    stream: Option<&StreamName>,
    opts: &QueryOptions,
) -> Result<Vec<EventRecord>, StoreError> {
    let rows = store
        .query(grain_id, event_range(stream))
        .await
        .map_err(map_backend_err)?;
    Ok(apply_filters(decode_rows(rows), opts))
}

/// Load the most recent event matching `stream` and `event_id`, or `None` if
/// no event matches (§4.2, Open Question 2: implemented as a reverse scan
/// over the same range `load_events` would use).
///
/// # Errors
///
/// Returns [`StoreError::TransientBackend`] or [`StoreError::FatalBackend`]
/// if the backend scan fails.
pub async fn load_latest_event(
    store: &dyn RowStore,
    grain_id: &GrainId,
    stream: Option<&StreamName>,
    event_id: Option<EventId>,
) -> Result<Option<EventRecord>, StoreError> {
    let rows = store
        .query(grain_id, event_range(stream))
        .await
        .map_err(map_backend_err)?;
    let mut records = decode_rows(rows);
    records.reverse();
    Ok(match event_id {
        Some(id) => records.into_iter().find(|r| r.event_id == id),
        None => records.into_iter().next(),
    })
}

/// Load the partition's projection row, or `None` if absent or malformed
/// (§4.2 "malformed data returns none; the processor treats this as
/// default").
///
/// # Errors
///
/// Returns [`StoreError::TransientBackend`] or [`StoreError::FatalBackend`]
/// if the backend read fails.
pub async fn load_projection(
    store: &dyn RowStore,
    grain_id: &GrainId,
) -> Result<Option<ProjectionRow>, StoreError> {
    let row = store
        .get(grain_id, &codec::projection_row_key())
        .await
        .map_err(map_backend_err)?;
    Ok(row.as_ref().and_then(codec::decode_projection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::VersionToken;

    fn record(stream: &str, seq: u64, id: EventId) -> EventRecord {
        EventRecord {
            stream_name: StreamName::new(stream).unwrap(),
            event_type: "T".into(),
            data: vec![],
            event_id: id,
            sequence: Sequence::new(seq),
            timestamp: Utc::now(),
            reactor_status: vec![],
            version_token: VersionToken::from_generation(0),
        }
    }

    #[test]
    fn distinct_by_event_id_keeps_earliest() {
        let id = EventId::new_v4();
        let records = vec![record("s", 1, id), record("s", 2, id)];
        let opts = QueryOptions {
            distinct_by_event_id: true,
            ..Default::default()
        };
        let filtered = apply_filters(records, &opts);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].sequence, Sequence::new(1));
    }

    #[test]
    fn sequence_bounds_are_inclusive() {
        let records = vec![
            record("s", 1, EventId::new_v4()),
            record("s", 2, EventId::new_v4()),
            record("s", 3, EventId::new_v4()),
        ];
        let opts = QueryOptions {
            from_sequence: Some(Sequence::new(2)),
            to_sequence: Some(Sequence::new(3)),
            ..Default::default()
        };
        let filtered = apply_filters(records, &opts);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn max_count_truncates() {
        let records = vec![
            record("s", 1, EventId::new_v4()),
            record("s", 2, EventId::new_v4()),
        ];
        let opts = QueryOptions {
            max_count: Some(1),
            ..Default::default()
        };
        assert_eq!(apply_filters(records, &opts).len(), 1);
    }
}
