//! Partition codec (§4.1): encode/decode rows as laid out in §3.
//!
//! Row keys and attribute shapes here are the persisted contract (§6
//! "Persistent layout") — existing stores conforming to this schema must
//! remain readable, so changes to this module are format changes.

use crate::backend::Row;
use crate::error::StoreError;
use crate::event::EventRecord;
use crate::ids::{EventId, PROJECTION_SENTINEL, ROW_KEY_SEP, Sequence, StreamName, VersionToken};
use crate::reactor::ReactorState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Build the row key for an event row (§3): `stream_name ∥ SEP ∥
/// sequence(19-digit) ∥ SEP ∥ event_id`.
#[must_use]
pub fn event_row_key(stream: &StreamName, sequence: Sequence, event_id: EventId) -> Vec<u8> {
    let mut key = Vec::with_capacity(stream.as_str().len() + 2 + Sequence::ENCODED_WIDTH + 37);
    key.extend_from_slice(stream.as_str().as_bytes());
    key.push(ROW_KEY_SEP);
    key.extend_from_slice(sequence.encode().as_bytes());
    key.push(ROW_KEY_SEP);
    key.extend_from_slice(event_id.to_string().as_bytes());
    key
}

/// The `[start, end)` row-key range covering every event row for `stream`
/// (§4.2 "stream prefix range").
#[must_use]
pub fn stream_prefix_range(stream: &StreamName) -> (Vec<u8>, Vec<u8>) {
    let mut start = stream.as_str().as_bytes().to_vec();
    start.push(ROW_KEY_SEP);
    let mut end = stream.as_str().as_bytes().to_vec();
    end.push(ROW_KEY_SEP + 1);
    (start, end)
}

/// The `[start, ∞)` range covering every event row in the partition, across
/// all streams, excluding the projection sentinel (§4.2 "exclude projection
/// sentinel when stream is absent").
#[must_use]
pub fn all_events_start() -> Vec<u8> {
    vec![PROJECTION_SENTINEL[0] + 1]
}

/// The projection row's fixed key (§4.1 sentinel).
#[must_use]
pub fn projection_row_key() -> Vec<u8> {
    PROJECTION_SENTINEL.to_vec()
}

/// Wire shape for an event row's attributes (everything but the row key,
/// timestamp, and version token, which the backend supplies).
#[derive(Serialize, Deserialize)]
struct EventRowAttrs {
    event_type: String,
    data: Vec<u8>,
    event_id: uuid::Uuid,
    sequence: u64,
    #[serde(default)]
    reactor_status: Vec<ReactorState>,
}

/// Encode an event into its row key and attribute bytes.
///
/// # Errors
///
/// Returns [`StoreError::MalformedRow`] if the attributes fail to serialize,
/// which would indicate a codec bug rather than bad input.
pub fn encode_event(
    stream: &StreamName,
    event_type: &str,
    data: Vec<u8>,
    event_id: EventId,
    sequence: Sequence,
    reactor_status: Vec<ReactorState>,
) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
    let row_key = event_row_key(stream, sequence, event_id);
    let attrs = EventRowAttrs {
        event_type: event_type.to_string(),
        data,
        event_id: *event_id.as_uuid(),
        sequence: sequence.value(),
        reactor_status,
    };
    let value = rmp_serde::to_vec_named(&attrs)
        .map_err(|e| StoreError::MalformedRow(format!("encode_event: {e}")))?;
    Ok((row_key, value))
}

/// Decode a stored row into an [`EventRecord`].
///
/// Tolerant per §4.1: a missing/corrupt `reactor_status` decodes as empty
/// rather than failing the row; a missing required `data` field reports the
/// row as skippable (`Ok(None)`) rather than erroring, so one bad row never
/// aborts a scan (§4.2 "malformed projection... decoded as empty").
///
/// # Errors
///
/// Returns [`StoreError::MalformedRow`] only if the row key itself cannot be
/// parsed back into a stream name and sequence — this indicates the row
/// doesn't belong to this codec at all (e.g. a foreign key layout).
pub fn decode_event(row: &Row) -> Result<Option<EventRecord>, StoreError> {
    let Some((stream, sequence)) = parse_event_row_key(&row.row_key) else {
        return Err(StoreError::MalformedRow(
            "event row key does not match stream∥SEP∥sequence∥SEP∥event_id layout".into(),
        ));
    };

    let Ok(attrs) = rmp_serde::from_slice::<EventRowAttrs>(&row.value) else {
        // Missing/corrupt attributes: skippable, not an error (§4.1).
        return Ok(None);
    };

    if attrs.data.is_empty() && attrs.event_type.is_empty() {
        // No payload recoverable; treat as skippable rather than erroring.
        return Ok(None);
    }

    Ok(Some(EventRecord {
        stream_name: stream,
        event_type: attrs.event_type,
        data: attrs.data,
        event_id: EventId::from_uuid(attrs.event_id),
        sequence,
        timestamp: row.timestamp,
        reactor_status: attrs.reactor_status,
        version_token: row.version_token.clone(),
    }))
}

fn parse_event_row_key(row_key: &[u8]) -> Option<(StreamName, Sequence)> {
    let parts: Vec<&[u8]> = row_key.split(|&b| b == ROW_KEY_SEP).collect();
    if parts.len() != 3 {
        return None;
    }
    let stream = StreamName::new(std::str::from_utf8(parts[0]).ok()?).ok()?;
    let sequence = Sequence::decode(std::str::from_utf8(parts[1]).ok()?).ok()?;
    Some((stream, sequence))
}

/// Wire shape for the projection row's attributes.
#[derive(Serialize, Deserialize)]
struct ProjectionRowAttrs {
    data: Vec<u8>,
    next_sequence: u64,
    event_count: u64,
}

/// The decoded projection row, paired with its CAS witness.
#[derive(Clone, Debug)]
pub struct ProjectionRow {
    /// Opaque serialized projection value.
    pub data: Vec<u8>,
    /// Next sequence number to assign in this partition.
    pub next_sequence: Sequence,
    /// Persisted event count (§3 invariant 3).
    pub event_count: u64,
    /// Last-write time.
    pub timestamp: DateTime<Utc>,
    /// CAS witness.
    pub version_token: VersionToken,
}

/// Encode a projection value and its metadata into row key/attribute bytes.
///
/// # Errors
///
/// Returns [`StoreError::MalformedRow`] if the attributes fail to serialize.
pub fn encode_projection(
    data: Vec<u8>,
    next_sequence: Sequence,
    event_count: u64,
) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
    let row_key = projection_row_key();
    let attrs = ProjectionRowAttrs {
        data,
        next_sequence: next_sequence.value(),
        event_count,
    };
    let value = rmp_serde::to_vec_named(&attrs)
        .map_err(|e| StoreError::MalformedRow(format!("encode_projection: {e}")))?;
    Ok((row_key, value))
}

/// Decode a projection row. Malformed data decodes as `None` (§4.2
/// "malformed data returns none; the processor treats this as default"),
/// rather than erroring.
#[must_use]
pub fn decode_projection(row: &Row) -> Option<ProjectionRow> {
    let attrs = rmp_serde::from_slice::<ProjectionRowAttrs>(&row.value).ok()?;
    Some(ProjectionRow {
        data: attrs.data,
        next_sequence: Sequence::new(attrs.next_sequence),
        event_count: attrs.event_count,
        timestamp: row.timestamp,
        version_token: row.version_token.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(row_key: Vec<u8>, value: Vec<u8>) -> Row {
        Row {
            row_key,
            value,
            timestamp: Utc::now(),
            version_token: VersionToken::from_generation(1),
        }
    }

    #[test]
    fn event_row_key_orders_by_sequence() {
        let stream = StreamName::new("orders").unwrap();
        let id = EventId::new_v4();
        let k1 = event_row_key(&stream, Sequence::new(1), id);
        let k9 = event_row_key(&stream, Sequence::new(9), id);
        let k10 = event_row_key(&stream, Sequence::new(10), id);
        assert!(k1 < k9);
        assert!(k9 < k10);
    }

    #[test]
    fn projection_sentinel_sorts_below_stream_prefixes() {
        let stream = StreamName::new("orders").unwrap();
        let (start, _) = stream_prefix_range(&stream);
        assert!(projection_row_key() < start);
    }

    #[test]
    fn event_roundtrip() {
        let stream = StreamName::new("orders").unwrap();
        let id = EventId::new_v4();
        let (key, value) = encode_event(
            &stream,
            "OrderPlaced.v1",
            vec![1, 2, 3],
            id,
            Sequence::new(5),
            vec![],
        )
        .unwrap();
        let decoded = decode_event(&row(key, value)).unwrap().unwrap();
        assert_eq!(decoded.event_type, "OrderPlaced.v1");
        assert_eq!(decoded.data, vec![1, 2, 3]);
        assert_eq!(decoded.sequence, Sequence::new(5));
        assert_eq!(decoded.event_id, id);
    }

    #[test]
    fn event_decode_tolerates_malformed_attrs() {
        let stream = StreamName::new("orders").unwrap();
        let key = event_row_key(&stream, Sequence::new(1), EventId::new_v4());
        let decoded = decode_event(&row(key, vec![0xff, 0xff])).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn projection_roundtrip() {
        let (key, value) = encode_projection(vec![9, 9], Sequence::new(3), 2).unwrap();
        let decoded = decode_projection(&row(key, value)).unwrap();
        assert_eq!(decoded.data, vec![9, 9]);
        assert_eq!(decoded.next_sequence, Sequence::new(3));
        assert_eq!(decoded.event_count, 2);
    }

    #[test]
    fn projection_decode_malformed_is_none() {
        let (key, _) = encode_projection(vec![], Sequence::ZERO, 0).unwrap();
        assert!(decode_projection(&row(key, vec![0xff, 0xff])).is_none());
    }
}
