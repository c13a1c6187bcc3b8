//! Identity and ordering types for the grain event store.
//!
//! `GrainId` names a partition (one logical entity). `StreamName` names a
//! sub-channel within that partition (§3). `Sequence` is the partition-wide,
//! strictly-increasing integer assigned on event insert. `VersionToken` is
//! the opaque CAS witness a backend attaches to a row on read.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Stable identifier for an event, used for deduplication and
/// `distinct_by_event_id` retention (§3, §4.4).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random event id.
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID as an `EventId`.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Borrow the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The separator byte used in event row keys (§3): `stream_name ∥ SEP ∥
/// sequence ∥ SEP ∥ event_id`. Chosen to sort below any ASCII-printable
/// character a `StreamName` may contain, and below the projection row's
/// sentinel prefix byte (0x00), since the unit separator `0x1f` is itself
/// above `0x00`. Stream names may not contain this byte.
pub const ROW_KEY_SEP: u8 = 0x1f;

/// The row key used for a partition's single projection row. Chosen to sort
/// below every valid `stream_name ∥ SEP` prefix, so a single `row_key >=
/// PROJECTION_SENTINEL` inequality on query excludes it.
pub const PROJECTION_SENTINEL: &[u8] = &[0x00];

/// Error returned when a candidate identifier is invalid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseIdError {
    /// The identifier was empty.
    #[error("identifier cannot be empty")]
    Empty,
    /// The identifier contained the reserved row-key separator byte.
    #[error("identifier must not contain the reserved separator byte 0x{:02x}", ROW_KEY_SEP)]
    ContainsSeparator,
}

/// Unique identifier for a grain (entity). All state for one grain lives in
/// one backend partition keyed by this value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrainId(String);

impl GrainId {
    /// Create a `GrainId` from application-controlled, already-trusted input.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GrainId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseIdError::Empty);
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for GrainId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for GrainId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for GrainId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Name of a stream (§3): a named, type-filtered channel of events within a
/// partition. Must not contain [`ROW_KEY_SEP`], since that byte delimits the
/// stream-name component of an event row key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamName(String);

impl StreamName {
    /// Validate and construct a `StreamName`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseIdError::Empty`] for an empty name, or
    /// [`ParseIdError::ContainsSeparator`] if the name contains the reserved
    /// row-key separator byte.
    pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ParseIdError::Empty);
        }
        if name.as_bytes().contains(&ROW_KEY_SEP) {
            return Err(ParseIdError::ContainsSeparator);
        }
        Ok(Self(name))
    }

    /// Borrow the stream name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for StreamName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Partition-scoped, strictly-increasing sequence number (§3 invariant 1).
///
/// Formats as a 19-digit zero-padded decimal in row keys (§4.1) so
/// lexicographic byte order equals numeric order up to `10^19 - 1`, which
/// exceeds `u64::MAX` and so is never a practical limit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sequence(u64);

impl Sequence {
    /// The first sequence number assigned in a fresh partition.
    pub const ZERO: Self = Self(0);

    /// Width, in decimal digits, used to zero-pad a sequence in a row key.
    pub const ENCODED_WIDTH: usize = 19;

    /// Construct a `Sequence` from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw numeric value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The next sequence number (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Render as a 19-digit zero-padded decimal string, as used in event row
    /// keys (§4.1).
    #[must_use]
    pub fn encode(self) -> String {
        format!("{:0width$}", self.0, width = Self::ENCODED_WIDTH)
    }

    /// Parse a 19-digit zero-padded decimal string produced by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns the underlying parse error if `s` is not a valid `u64` decimal.
    pub fn decode(s: &str) -> Result<Self, std::num::ParseIntError> {
        s.parse().map(Self)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Sequence> for u64 {
    fn from(seq: Sequence) -> Self {
        seq.0
    }
}

/// Opaque CAS witness attached to a row on read (§3, §6).
///
/// Core code never inspects the contents; it only compares tokens for
/// equality and passes the token observed on load back on save. Backends are
/// free to encode whatever they need (a row generation counter, a content
/// hash, a database `xmin`) into the bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken(Vec<u8>);

impl VersionToken {
    /// Wrap raw backend-supplied bytes as a `VersionToken`.
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the underlying bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convenience constructor for counter-based backends: encodes a `u64`
    /// generation counter as big-endian bytes.
    #[must_use]
    pub fn from_generation(generation: u64) -> Self {
        Self(generation.to_be_bytes().to_vec())
    }

    /// Decode a generation counter previously produced by
    /// [`Self::from_generation`]. Returns `None` if the token wasn't built
    /// that way.
    #[must_use]
    pub fn as_generation(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.0.clone().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grain_id_roundtrip() {
        let id = GrainId::new("order-123");
        assert_eq!(id.as_str(), "order-123");
        assert_eq!(format!("{id}"), "order-123");
    }

    #[test]
    fn grain_id_parse_rejects_empty() {
        assert_eq!("".parse::<GrainId>(), Err(ParseIdError::Empty));
    }

    #[test]
    fn stream_name_rejects_separator() {
        let bad = format!("bad{}", ROW_KEY_SEP as char);
        assert_eq!(StreamName::new(bad), Err(ParseIdError::ContainsSeparator));
    }

    #[test]
    fn stream_name_rejects_empty() {
        assert_eq!(StreamName::new(""), Err(ParseIdError::Empty));
    }

    #[test]
    fn sequence_encoding_preserves_numeric_order() {
        let a = Sequence::new(9);
        let b = Sequence::new(10);
        assert!(a.encode() < b.encode());
        assert_eq!(a.encode().len(), Sequence::ENCODED_WIDTH);
    }

    #[test]
    fn sequence_roundtrip() {
        let seq = Sequence::new(42);
        assert_eq!(Sequence::decode(&seq.encode()).unwrap(), seq);
    }

    #[test]
    fn sequence_next() {
        assert_eq!(Sequence::ZERO.next(), Sequence::new(1));
    }

    #[test]
    fn version_token_generation_roundtrip() {
        let token = VersionToken::from_generation(7);
        assert_eq!(token.as_generation(), Some(7));
    }
}
