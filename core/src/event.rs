//! Event trait, envelopes, and persisted event records.
//!
//! This module defines the core event abstraction plus the two shapes an
//! event takes as it moves through the system: an [`EventEnvelope`] (what a
//! handler appends, before a sequence is assigned) and an [`EventRecord`]
//! (§3 "Event row" — what `load_events` returns, after persistence).

use crate::ids::{EventId, Sequence, VersionToken};
use crate::reactor::ReactorState;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Error types for event payload (de)serialization.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// An event that can be appended to a stream and replayed to reconstruct a
/// projection.
///
/// Events represent immutable facts about things that have happened in the
/// past. The discriminator returned by [`Event::event_type`] is the tag
/// stored in the event row (§3) and the basis for stream matching (§4.7).
///
/// # Event Naming Convention
///
/// Return a descriptive name with a version suffix, e.g. `"OrderPlaced.v1"`,
/// so schema evolution can introduce `"OrderPlaced.v2"` without colliding.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier stored alongside the payload.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bytes using the default payload codec
    /// (`bincode`). Backends never need to know this; they only handle
    /// opaque byte strings (§6 "Event payload").
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if `bincode` fails to
    /// encode the value.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bytes produced by [`Event::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes are
    /// corrupted or encode a different shape.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// An event as appended by a handler, before a sequence number has been
/// assigned (§4.6 `context.append`). This is the unit the processor queues
/// for in-fold, depth-first processing.
#[derive(Clone, Debug)]
pub struct EventEnvelope {
    /// Discriminator tag (§3 `event_type`).
    pub event_type: String,
    /// Opaque serialized payload.
    pub data: Vec<u8>,
    /// Stable identifier used for deduplication and `distinct_by_event_id`
    /// retention (§3, §4.4). Callers MAY supply one (e.g. derived from an
    /// idempotency key); if absent, the processor generates one.
    pub event_id: Option<EventId>,
}

impl EventEnvelope {
    /// Build an envelope from a typed event, generating a fresh [`EventId`].
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be
    /// serialized.
    pub fn from_event<E: Event + Serialize>(event: &E) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            event_id: None,
        })
    }

    /// Attach an explicit event id (for idempotent re-append scenarios).
    #[must_use]
    pub fn with_event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }
}

/// A persisted event row (§3 "Event row"), as returned by `load_events` and
/// `load_latest_event` (§4.2).
#[derive(Clone, Debug)]
pub struct EventRecord {
    /// Stream this event was written under.
    pub stream_name: crate::ids::StreamName,
    /// Discriminator tag.
    pub event_type: String,
    /// Opaque serialized payload.
    pub data: Vec<u8>,
    /// Stable dedup identifier.
    pub event_id: EventId,
    /// Partition-wide insertion sequence.
    pub sequence: Sequence,
    /// Assignment time (backend-set on write).
    pub timestamp: DateTime<Utc>,
    /// Per-reactor dispatch progress (§3 invariant 5).
    pub reactor_status: Vec<ReactorState>,
    /// CAS witness for this row, used only by reactor-status rewrites (§4.3).
    pub version_token: VersionToken,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StreamName;
    use serde::Deserialize;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    enum TestEvent {
        Created { id: String, value: i32 },
    }

    impl Event for TestEvent {
        fn event_type(&self) -> &'static str {
            match self {
                TestEvent::Created { .. } => "TestEvent.Created.v1",
            }
        }
    }

    #[test]
    fn event_roundtrip() {
        let event = TestEvent::Created {
            id: "a".into(),
            value: 42,
        };
        let bytes = event.to_bytes().unwrap();
        let back = TestEvent::from_bytes(&bytes).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn envelope_from_event_carries_type_and_payload() {
        let event = TestEvent::Created {
            id: "a".into(),
            value: 1,
        };
        let envelope = EventEnvelope::from_event(&event).unwrap();
        assert_eq!(envelope.event_type, "TestEvent.Created.v1");
        assert!(envelope.event_id.is_none());
    }

    #[test]
    fn record_carries_stream_and_sequence() {
        let record = EventRecord {
            stream_name: StreamName::new("orders").unwrap(),
            event_type: "X".into(),
            data: vec![],
            event_id: EventId::new_v4(),
            sequence: Sequence::ZERO,
            timestamp: Utc::now(),
            reactor_status: vec![],
            version_token: VersionToken::from_generation(0),
        };
        assert_eq!(record.sequence, Sequence::ZERO);
    }
}
