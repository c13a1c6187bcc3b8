//! An in-memory [`RowStore`] implementation (§6), keyed by
//! `(partition, row_key)`. Reference implementation of the backend contract,
//! used for unit and property tests; not durable.

use chrono::{DateTime, Utc};
use grainstore_core::backend::{
    Action, BackendError, Row, RowKeyRange, RowStore, TransactionOutcome,
};
use grainstore_core::ids::{GrainId, VersionToken};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;
use tokio::sync::RwLock;

#[derive(Clone)]
struct StoredRow {
    value: Vec<u8>,
    timestamp: DateTime<Utc>,
    generation: u64,
}

impl StoredRow {
    fn version_token(&self) -> VersionToken {
        VersionToken::from_generation(self.generation)
    }

    fn to_row(&self, row_key: Vec<u8>) -> Row {
        Row {
            row_key,
            value: self.value.clone(),
            timestamp: self.timestamp,
            version_token: self.version_token(),
        }
    }
}

/// A `RowStore` backed by one `BTreeMap<Vec<u8>, StoredRow>` per partition,
/// guarded by a single `tokio::sync::RwLock` over the partition map.
///
/// `submit_transaction` validates every action against the current state
/// before applying any of them, so a failing action leaves the partition
/// unchanged (atomicity within one call).
#[derive(Default)]
pub struct MemoryRowStore {
    partitions: RwLock<HashMap<GrainId, BTreeMap<Vec<u8>, StoredRow>>>,
}

impl MemoryRowStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn range_bounds(range: &RowKeyRange) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let start = Bound::Included(range.start.clone());
    let end = match &range.end {
        Some(end) => Bound::Excluded(end.clone()),
        None => Bound::Unbounded,
    };
    (start, end)
}

enum Validated<'a> {
    InsertIfAbsent {
        row_key: &'a Vec<u8>,
        value: &'a Vec<u8>,
    },
    Upsert {
        row_key: &'a Vec<u8>,
        value: &'a Vec<u8>,
    },
    ReplaceCas {
        row_key: &'a Vec<u8>,
        value: &'a Vec<u8>,
    },
    Delete {
        row_key: &'a Vec<u8>,
        skip: bool,
    },
}

impl RowStore for MemoryRowStore {
    fn get<'a>(
        &'a self,
        partition: &'a GrainId,
        row_key: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Option<Row>, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let partitions = self.partitions.read().await;
            Ok(partitions
                .get(partition)
                .and_then(|p| p.get(row_key))
                .map(|r| r.to_row(row_key.to_vec())))
        })
    }

    fn query<'a>(
        &'a self,
        partition: &'a GrainId,
        range: RowKeyRange,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Row>, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let partitions = self.partitions.read().await;
            let Some(rows) = partitions.get(partition) else {
                return Ok(Vec::new());
            };
            let bounds = range_bounds(&range);
            Ok(rows
                .range(bounds)
                .map(|(key, row)| row.to_row(key.clone()))
                .collect())
        })
    }

    fn submit_transaction<'a>(
        &'a self,
        partition: &'a GrainId,
        actions: Vec<Action>,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionOutcome, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let mut partitions = self.partitions.write().await;
            let rows = partitions.entry(partition.clone()).or_default();

            let mut validated = Vec::with_capacity(actions.len());
            for action in &actions {
                match action {
                    Action::InsertIfAbsent { row_key, value } => {
                        if rows.contains_key(row_key) {
                            return Err(BackendError::Conflict);
                        }
                        validated.push(Validated::InsertIfAbsent { row_key, value });
                    }
                    Action::Upsert { row_key, value } => {
                        validated.push(Validated::Upsert { row_key, value });
                    }
                    Action::ReplaceCas {
                        row_key,
                        value,
                        expected,
                    } => {
                        let matches = rows
                            .get(row_key)
                            .is_some_and(|existing| existing.version_token() == *expected);
                        if !matches {
                            return Err(BackendError::PreconditionFailed);
                        }
                        validated.push(Validated::ReplaceCas { row_key, value });
                    }
                    Action::Delete { row_key, expected } => {
                        let current = rows.get(row_key);
                        match (current, expected) {
                            (None, _) => validated.push(Validated::Delete {
                                row_key,
                                skip: true,
                            }),
                            (Some(existing), Some(expected)) => {
                                if existing.version_token() != *expected {
                                    return Err(BackendError::PreconditionFailed);
                                }
                                validated.push(Validated::Delete {
                                    row_key,
                                    skip: false,
                                });
                            }
                            (Some(_), None) => validated.push(Validated::Delete {
                                row_key,
                                skip: false,
                            }),
                        }
                    }
                }
            }

            let now = Utc::now();
            let mut version_tokens = Vec::new();
            for v in validated {
                match v {
                    Validated::InsertIfAbsent { row_key, value } => {
                        let stored = StoredRow {
                            value: value.to_vec(),
                            timestamp: now,
                            generation: 1,
                        };
                        version_tokens.push(stored.version_token());
                        rows.insert(row_key.to_vec(), stored);
                    }
                    Validated::Upsert { row_key, value } => {
                        let generation = rows.get(row_key).map_or(1, |r| r.generation + 1);
                        let stored = StoredRow {
                            value: value.to_vec(),
                            timestamp: now,
                            generation,
                        };
                        version_tokens.push(stored.version_token());
                        rows.insert(row_key.to_vec(), stored);
                    }
                    Validated::ReplaceCas { row_key, value } => {
                        let generation = rows.get(row_key).map_or(1, |r| r.generation + 1);
                        let stored = StoredRow {
                            value: value.to_vec(),
                            timestamp: now,
                            generation,
                        };
                        version_tokens.push(stored.version_token());
                        rows.insert(row_key.to_vec(), stored);
                    }
                    Validated::Delete { row_key, skip } => {
                        if !skip {
                            rows.remove(row_key);
                        }
                    }
                }
            }

            Ok(TransactionOutcome { version_tokens })
        })
    }
}
