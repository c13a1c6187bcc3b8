//! A `sled`-backed [`RowStore`] implementation (§6): "a wide-column
//! key-value store whose transactional unit is a single partition," embodied
//! with `sled::Tree::transaction` for atomic multi-row batches.
//!
//! All partitions share one `sled::Tree`; row keys are
//! `len(partition) ∥ partition ∥ row_key`, length-prefixed so a partition
//! boundary can never be confused with a row key that happens to contain the
//! partition's own bytes.

use chrono::{DateTime, TimeZone, Utc};
use grainstore_core::backend::{Action, BackendError, Row, RowKeyRange, RowStore, TransactionOutcome};
use grainstore_core::ids::{GrainId, VersionToken};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use std::future::Future;
use std::ops::Bound;
use std::path::Path;
use std::pin::Pin;
use thiserror::Error;

/// Errors opening or configuring a [`SledRowStore`].
#[derive(Error, Debug)]
pub enum SledStoreError {
    /// The underlying `sled` database could not be opened.
    #[error("failed to open sled database: {0}")]
    Open(#[from] sled::Error),
}

/// A `RowStore` backed by a single `sled::Tree` (§6).
#[derive(Debug, Clone)]
pub struct SledRowStore {
    _db: sled::Db,
    tree: sled::Tree,
}

impl SledRowStore {
    /// Open or create a sled database at `path`, with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SledStoreError::Open`] if the database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SledStoreError> {
        Self::open_with_config(sled::Config::default().path(path))
    }

    /// Open a sled database with a caller-supplied configuration (cache
    /// size, compression, and other tuning knobs).
    ///
    /// # Errors
    ///
    /// Returns [`SledStoreError::Open`] if the database cannot be opened.
    pub fn open_with_config(config: sled::Config) -> Result<Self, SledStoreError> {
        let db = config.open()?;
        Self::from_db(db)
    }

    /// Wrap an existing `sled::Db`, opening the `"grainstore_rows"` tree.
    ///
    /// # Errors
    ///
    /// Returns [`SledStoreError::Open`] if the tree cannot be opened.
    pub fn from_db(db: sled::Db) -> Result<Self, SledStoreError> {
        let tree = db.open_tree("grainstore_rows")?;
        Ok(Self { _db: db, tree })
    }

    /// A temporary, disk-backed database for tests.
    ///
    /// # Errors
    ///
    /// Returns [`SledStoreError::Open`] if the database cannot be opened.
    pub fn temporary() -> Result<Self, SledStoreError> {
        Self::open_with_config(sled::Config::default().temporary(true))
    }
}

#[derive(Serialize, Deserialize)]
struct StoredValue {
    value: Vec<u8>,
    timestamp_millis: i64,
    generation: u64,
}

fn version_token_for(generation: u64) -> VersionToken {
    VersionToken::from_generation(generation)
}

fn timestamp_of(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or(Utc::now())
}

fn partition_prefix(partition: &GrainId) -> Vec<u8> {
    let bytes = partition.as_str().as_bytes();
    let mut key = Vec::with_capacity(4 + bytes.len());
    key.extend_from_slice(&(u32::try_from(bytes.len()).unwrap_or(u32::MAX)).to_be_bytes());
    key.extend_from_slice(bytes);
    key
}

fn composite_key(partition: &GrainId, row_key: &[u8]) -> Vec<u8> {
    let mut key = partition_prefix(partition);
    key.extend_from_slice(row_key);
    key
}

/// Increment a byte string as a big-endian number, truncating trailing
/// carries. Returns `None` if every byte is already `0xff` (no finite
/// successor exists).
fn increment_bytes(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut out = bytes.to_vec();
    for i in (0..out.len()).rev() {
        if out[i] != 0xff {
            out[i] += 1;
            out.truncate(i + 1);
            return Some(out);
        }
    }
    None
}

fn composite_range(partition: &GrainId, range: &RowKeyRange) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let prefix = partition_prefix(partition);
    let start = composite_key(partition, &range.start);
    let end = match &range.end {
        Some(end) => Bound::Excluded(composite_key(partition, end)),
        None => match increment_bytes(&prefix) {
            Some(next_prefix) => Bound::Excluded(next_prefix),
            None => Bound::Unbounded,
        },
    };
    (Bound::Included(start), end)
}

fn row_key_suffix(partition: &GrainId, composite: &[u8]) -> Vec<u8> {
    let prefix_len = partition_prefix(partition).len();
    composite[prefix_len..].to_vec()
}

#[derive(Debug)]
enum TxAbort {
    PreconditionFailed,
    Conflict,
}

fn decode_stored(bytes: &[u8]) -> Option<StoredValue> {
    bincode::deserialize(bytes).ok()
}

fn run_transaction(
    tree: &sled::Tree,
    partition: GrainId,
    actions: Vec<Action>,
) -> Result<TransactionOutcome, BackendError> {
    let now_millis = Utc::now().timestamp_millis();

    let result: Result<Vec<VersionToken>, TransactionError<TxAbort>> =
        tree.transaction(|tx: &TransactionalTree| {
            // Validate every action against the current state first, so a
            // failing action aborts the whole batch with no partial writes.
            for action in &actions {
                match action {
                    Action::InsertIfAbsent { row_key, .. } => {
                        let key = composite_key(&partition, row_key);
                        if tx.get(&key)?.is_some() {
                            return Err(ConflictableTransactionError::Abort(TxAbort::Conflict));
                        }
                    }
                    Action::ReplaceCas {
                        row_key, expected, ..
                    } => {
                        let key = composite_key(&partition, row_key);
                        let matches = tx
                            .get(&key)?
                            .and_then(|bytes| decode_stored(&bytes))
                            .is_some_and(|stored| {
                                version_token_for(stored.generation) == *expected
                            });
                        if !matches {
                            return Err(ConflictableTransactionError::Abort(
                                TxAbort::PreconditionFailed,
                            ));
                        }
                    }
                    Action::Delete { row_key, expected } => {
                        if let Some(expected) = expected {
                            let key = composite_key(&partition, row_key);
                            if let Some(bytes) = tx.get(&key)? {
                                if let Some(stored) = decode_stored(&bytes) {
                                    if version_token_for(stored.generation) != *expected {
                                        return Err(ConflictableTransactionError::Abort(
                                            TxAbort::PreconditionFailed,
                                        ));
                                    }
                                }
                            }
                        }
                    }
                    Action::Upsert { .. } => {}
                }
            }

            let mut tokens = Vec::with_capacity(actions.len());
            for action in &actions {
                match action {
                    Action::InsertIfAbsent { row_key, value } => {
                        let key = composite_key(&partition, row_key);
                        let stored = StoredValue {
                            value: value.clone(),
                            timestamp_millis: now_millis,
                            generation: 1,
                        };
                        let encoded = bincode::serialize(&stored).unwrap_or_default();
                        tx.insert(key, encoded)?;
                        tokens.push(version_token_for(stored.generation));
                    }
                    Action::Upsert { row_key, value } => {
                        let key = composite_key(&partition, row_key);
                        let generation = tx
                            .get(&key)?
                            .and_then(|bytes| decode_stored(&bytes))
                            .map_or(1, |s| s.generation + 1);
                        let stored = StoredValue {
                            value: value.clone(),
                            timestamp_millis: now_millis,
                            generation,
                        };
                        let encoded = bincode::serialize(&stored).unwrap_or_default();
                        tx.insert(key, encoded)?;
                        tokens.push(version_token_for(stored.generation));
                    }
                    Action::ReplaceCas { row_key, value, .. } => {
                        let key = composite_key(&partition, row_key);
                        let generation = tx
                            .get(&key)?
                            .and_then(|bytes| decode_stored(&bytes))
                            .map_or(1, |s| s.generation + 1);
                        let stored = StoredValue {
                            value: value.clone(),
                            timestamp_millis: now_millis,
                            generation,
                        };
                        let encoded = bincode::serialize(&stored).unwrap_or_default();
                        tx.insert(key, encoded)?;
                        tokens.push(version_token_for(stored.generation));
                    }
                    Action::Delete { row_key, .. } => {
                        let key = composite_key(&partition, row_key);
                        tx.remove(key)?;
                    }
                }
            }

            Ok(tokens)
        });

    match result {
        Ok(tokens) => Ok(TransactionOutcome {
            version_tokens: tokens,
        }),
        Err(TransactionError::Abort(TxAbort::Conflict)) => Err(BackendError::Conflict),
        Err(TransactionError::Abort(TxAbort::PreconditionFailed)) => {
            Err(BackendError::PreconditionFailed)
        }
        Err(TransactionError::Storage(err)) => Err(BackendError::Fatal(err.to_string())),
    }
}

impl RowStore for SledRowStore {
    fn get<'a>(
        &'a self,
        partition: &'a GrainId,
        row_key: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Option<Row>, BackendError>> + Send + 'a>> {
        let tree = self.tree.clone();
        let key = composite_key(partition, row_key);
        let row_key = row_key.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let found = tree.get(&key).map_err(|e| BackendError::Fatal(e.to_string()))?;
                Ok(found.and_then(|bytes| decode_stored(&bytes)).map(|stored| Row {
                    row_key,
                    value: stored.value,
                    timestamp: timestamp_of(stored.timestamp_millis),
                    version_token: version_token_for(stored.generation),
                }))
            })
            .await
            .map_err(|e| BackendError::Fatal(e.to_string()))?
        })
    }

    fn query<'a>(
        &'a self,
        partition: &'a GrainId,
        range: RowKeyRange,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Row>, BackendError>> + Send + 'a>> {
        let tree = self.tree.clone();
        let partition = partition.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let bounds = composite_range(&partition, &range);
                let mut rows = Vec::new();
                for item in tree.range(bounds) {
                    let (key, bytes) = item.map_err(|e| BackendError::Fatal(e.to_string()))?;
                    let Some(stored) = decode_stored(&bytes) else {
                        continue;
                    };
                    rows.push(Row {
                        row_key: row_key_suffix(&partition, &key),
                        value: stored.value,
                        timestamp: timestamp_of(stored.timestamp_millis),
                        version_token: version_token_for(stored.generation),
                    });
                }
                Ok(rows)
            })
            .await
            .map_err(|e| BackendError::Fatal(e.to_string()))?
        })
    }

    fn submit_transaction<'a>(
        &'a self,
        partition: &'a GrainId,
        actions: Vec<Action>,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionOutcome, BackendError>> + Send + 'a>> {
        let tree = self.tree.clone();
        let partition = partition.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || run_transaction(&tree, partition, actions))
                .await
                .map_err(|e| BackendError::Fatal(e.to_string()))?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grain() -> GrainId {
        GrainId::new("g1")
    }

    #[tokio::test]
    async fn insert_then_get_roundtrips() {
        let store = SledRowStore::temporary().unwrap();
        store
            .submit_transaction(
                &grain(),
                vec![Action::InsertIfAbsent {
                    row_key: b"k1".to_vec(),
                    value: b"v1".to_vec(),
                }],
            )
            .await
            .unwrap();
        let row = store.get(&grain(), b"k1").await.unwrap().unwrap();
        assert_eq!(row.value, b"v1");
    }

    #[tokio::test]
    async fn insert_if_absent_conflict() {
        let store = SledRowStore::temporary().unwrap();
        let action = || Action::InsertIfAbsent {
            row_key: b"k1".to_vec(),
            value: b"v1".to_vec(),
        };
        store.submit_transaction(&grain(), vec![action()]).await.unwrap();
        let err = store
            .submit_transaction(&grain(), vec![action()])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Conflict));
    }

    #[tokio::test]
    async fn replace_cas_rejects_stale_token() {
        let store = SledRowStore::temporary().unwrap();
        store
            .submit_transaction(
                &grain(),
                vec![Action::Upsert {
                    row_key: b"k1".to_vec(),
                    value: b"v1".to_vec(),
                }],
            )
            .await
            .unwrap();
        let err = store
            .submit_transaction(
                &grain(),
                vec![Action::ReplaceCas {
                    row_key: b"k1".to_vec(),
                    value: b"v2".to_vec(),
                    expected: VersionToken::from_generation(999),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::PreconditionFailed));
    }

    #[tokio::test]
    async fn query_is_scoped_to_partition() {
        let store = SledRowStore::temporary().unwrap();
        store
            .submit_transaction(
                &GrainId::new("other"),
                vec![Action::Upsert {
                    row_key: b"x".to_vec(),
                    value: b"other".to_vec(),
                }],
            )
            .await
            .unwrap();
        store
            .submit_transaction(
                &grain(),
                vec![Action::Upsert {
                    row_key: b"x".to_vec(),
                    value: b"mine".to_vec(),
                }],
            )
            .await
            .unwrap();
        let rows = store
            .query(
                &grain(),
                RowKeyRange {
                    start: vec![],
                    end: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, b"mine");
    }
}
