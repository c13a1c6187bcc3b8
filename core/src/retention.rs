//! Retention planner (§4.4): compute delete sets from policies.
//!
//! Planning issues range queries scoped to one partition and stream, selects
//! rows to delete per dimension, and unions the results. Deletes are
//! best-effort (§4.3 step 6) — a failed delete just leaves the row for the
//! next sweep to re-identify.

use crate::error::StoreError;
use crate::event::EventRecord;
use crate::ids::GrainId;
use crate::ids::StreamName;
use crate::query::{self, QueryOptions};
use crate::reactor::ReactorStatus;
use crate::save::RetentionDelete;
use crate::{backend::RowStore, codec};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// A declarative, composable retention policy for one stream (§4.4).
/// Constructed via [`RetentionPolicy::builder`].
#[derive(Clone)]
pub struct RetentionPolicy {
    keep_count: Option<u64>,
    max_age: Option<ChronoDuration>,
    distinct_by_key: Option<Arc<dyn Fn(&EventRecord) -> Vec<u8> + Send + Sync>>,
    until_processed: bool,
}

impl RetentionPolicy {
    /// Start building a policy.
    #[must_use]
    pub fn builder() -> RetentionPolicyBuilder {
        RetentionPolicyBuilder::default()
    }

    /// A policy with every dimension off (nothing is ever deleted).
    #[must_use]
    pub fn none() -> Self {
        Self {
            keep_count: None,
            max_age: None,
            distinct_by_key: None,
            until_processed: false,
        }
    }

    /// The `(until_processed, max_age)` pair used by the registry builder to
    /// detect disagreeing retention dimensions across overlapping streams
    /// (§4.7 "reject overlapping streams whose retention dimensions disagree
    /// on `until_processed`/time bounds").
    #[must_use]
    pub fn signature(&self) -> (bool, Option<ChronoDuration>) {
        (self.until_processed, self.max_age)
    }
}

impl std::fmt::Debug for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionPolicy")
            .field("keep_count", &self.keep_count)
            .field("max_age", &self.max_age)
            .field("has_distinct_by_key", &self.distinct_by_key.is_some())
            .field("until_processed", &self.until_processed)
            .finish()
    }
}

/// Builder for [`RetentionPolicy`] (§4.4).
#[derive(Default)]
pub struct RetentionPolicyBuilder {
    keep_count: Option<u64>,
    max_age: Option<ChronoDuration>,
    distinct_by_key: Option<Arc<dyn Fn(&EventRecord) -> Vec<u8> + Send + Sync>>,
    until_processed: bool,
}

impl RetentionPolicyBuilder {
    /// Keep only the most recent `n` events by sequence.
    #[must_use]
    pub fn keep_count(mut self, n: u64) -> Self {
        self.keep_count = Some(n);
        self
    }

    /// Delete events older than `d`, by backend row timestamp.
    #[must_use]
    pub fn max_age(mut self, d: ChronoDuration) -> Self {
        self.max_age = Some(d);
        self
    }

    /// For each key produced by `extractor`, keep only the latest (by
    /// sequence) event.
    #[must_use]
    pub fn distinct_by_key(
        mut self,
        extractor: impl Fn(&EventRecord) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        self.distinct_by_key = Some(Arc::new(extractor));
        self
    }

    /// Delete events whose `reactor_status` is non-empty and every entry is
    /// `complete_successful`. Mutually exclusive with every other dimension.
    #[must_use]
    pub fn until_processed(mut self) -> Self {
        self.until_processed = true;
        self
    }

    /// Validate and construct the policy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConfigInvalid`] if `until_processed` is combined
    /// with any other dimension (§4.4 "Forbidden combination").
    pub fn build(self) -> Result<RetentionPolicy, StoreError> {
        let other_dimensions_set =
            self.keep_count.is_some() || self.max_age.is_some() || self.distinct_by_key.is_some();
        if self.until_processed && other_dimensions_set {
            return Err(StoreError::ConfigInvalid(
                "until_processed cannot be combined with keep_count, max_age, or distinct_by_key"
                    .into(),
            ));
        }
        Ok(RetentionPolicy {
            keep_count: self.keep_count,
            max_age: self.max_age,
            distinct_by_key: self.distinct_by_key,
            until_processed: self.until_processed,
        })
    }
}

fn all_complete_successful(record: &EventRecord) -> bool {
    !record.reactor_status.is_empty()
        && record
            .reactor_status
            .iter()
            .all(|s| s.status == ReactorStatus::CompleteSuccessful)
}

/// Compute this save's delete set for one stream (§4.4 algorithm).
///
/// `pending_new_count` is the number of not-yet-persisted events this same
/// save is about to insert into `stream` (§9 Open Question: without this,
/// `keep_count` would always lag one save behind, since the planner runs
/// before the primary batch that creates the new rows). They are always the
/// most recent by sequence, so they only ever widen the keep window, never
/// appear in the delete set themselves.
///
/// Idempotent (§8 invariant 3): given the same persisted rows and the same
/// `pending_new_count`, running this twice without intervening writes
/// returns the same row keys.
///
/// # Errors
///
/// Returns [`StoreError::TransientBackend`] or [`StoreError::FatalBackend`]
/// if the scoped scan fails.
pub async fn plan(
    store: &dyn RowStore,
    grain_id: &GrainId,
    stream: &StreamName,
    policy: &RetentionPolicy,
    pending_new_count: u64,
) -> Result<Vec<RetentionDelete>, StoreError> {
    let events = query::load_events(store, grain_id, Some(stream), &QueryOptions::default()).await?;

    let mut to_delete: HashMap<Vec<u8>, &EventRecord> = HashMap::new();

    if let Some(n) = policy.keep_count {
        let n = n as usize;
        let total = events.len() + pending_new_count as usize;
        if total > n {
            let trim = (total - n).min(events.len());
            for record in &events[..trim] {
                to_delete.insert(row_key_of(stream, record), record);
            }
        }
    }

    if let Some(max_age) = policy.max_age {
        let cutoff = Utc::now() - max_age;
        for record in &events {
            if record.timestamp < cutoff {
                to_delete.insert(row_key_of(stream, record), record);
            }
        }
    }

    if let Some(extractor) = &policy.distinct_by_key {
        let mut latest_per_key: HashMap<Vec<u8>, &EventRecord> = HashMap::new();
        for record in &events {
            latest_per_key.insert(extractor(record), record);
        }
        let keep: std::collections::HashSet<Vec<u8>> =
            latest_per_key.values().map(|r| row_key_of(stream, r)).collect();
        for record in &events {
            let key = row_key_of(stream, record);
            if !keep.contains(&key) {
                to_delete.insert(key, record);
            }
        }
    }

    if policy.until_processed {
        for record in &events {
            if all_complete_successful(record) {
                to_delete.insert(row_key_of(stream, record), record);
            }
        }
    }

    Ok(to_delete
        .into_iter()
        .map(|(row_key, record)| RetentionDelete {
            row_key,
            expected: Some(record.version_token.clone()),
        })
        .collect())
}

fn row_key_of(stream: &StreamName, record: &EventRecord) -> Vec<u8> {
    codec::event_row_key(stream, record.sequence, record.event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn until_processed_rejects_other_dimensions() {
        let result = RetentionPolicy::builder()
            .until_processed()
            .keep_count(5)
            .build();
        assert!(matches!(result, Err(StoreError::ConfigInvalid(_))));
    }

    #[test]
    fn until_processed_alone_is_valid() {
        assert!(RetentionPolicy::builder().until_processed().build().is_ok());
    }

    #[test]
    fn keep_count_alone_is_valid() {
        assert!(RetentionPolicy::builder().keep_count(3).build().is_ok());
    }
}
