//! Persisted sync-state record: where durable state stands in the chain.
//!
//! Read once at startup to seed the persisted height and the hash the next
//! block must build on. It is rewritten in the same batch as every flushed
//! generation, so it never disagrees with the data beside it.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::store::{get_json, KvOp, PersistentStore};

/// Well-known key of the [`SyncState`] record.
pub const SYNC_STATE_KEY: &[u8] = b"sync/state";
/// Well-known key of the schema version marker.
pub const DB_VERSION_KEY: &[u8] = b"sync/version";
/// Schema version this build reads and writes.
pub const DB_VERSION: &str = "1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Chain tip reported by the block source when this record was written.
    pub chain_tip: u64,
    /// Last block whose effects are in the store. `None` = nothing indexed.
    pub sync_height: Option<u64>,
    /// Hash of the block at `sync_height`.
    pub sync_block_hash: Option<String>,
    /// Heights at which reorgs were detected, oldest first.
    pub reorgs_detected: Vec<u64>,
    /// Unix timestamp of the last write.
    pub updated_at: i64,
}

impl SyncState {
    /// Load the record, or an empty one for a fresh store.
    pub async fn load(store: &dyn PersistentStore) -> Result<Self, IndexerError> {
        Ok(get_json(store, SYNC_STATE_KEY).await?.unwrap_or_default())
    }

    /// Advance to a newly applied block.
    pub fn advance(&mut self, height: u64, hash: impl Into<String>) {
        self.sync_height = Some(height);
        self.sync_block_hash = Some(hash.into());
        self.chain_tip = self.chain_tip.max(height);
    }

    pub fn record_reorg(&mut self, height: u64) {
        self.reorgs_detected.push(height);
    }

    /// The write that persists this record, stamped with the current time.
    pub fn to_op(&self) -> Result<KvOp, IndexerError> {
        let mut stamped = self.clone();
        stamped.updated_at = chrono::Utc::now().timestamp();
        KvOp::put_json(SYNC_STATE_KEY.to_vec(), &stamped)
    }

    /// Immediately write the record on its own.
    pub async fn save(&self, store: &dyn PersistentStore) -> Result<(), IndexerError> {
        store.batch_write(vec![self.to_op()?]).await
    }
}

/// Check the schema version marker, writing it on a fresh store.
///
/// A store holding a sync state but no marker, or a different marker, was
/// written by another build and is rejected.
pub async fn ensure_db_version(store: &dyn PersistentStore) -> Result<(), IndexerError> {
    match store.get(DB_VERSION_KEY).await? {
        Some(found) if found == DB_VERSION.as_bytes() => Ok(()),
        Some(found) => Err(IndexerError::VersionMismatch {
            expected: DB_VERSION.into(),
            found: String::from_utf8_lossy(&found).into_owned(),
        }),
        None => {
            if store.get(SYNC_STATE_KEY).await?.is_some() {
                return Err(IndexerError::missing_key(DB_VERSION_KEY));
            }
            store.put(DB_VERSION_KEY, DB_VERSION.as_bytes()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KvPairs;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MapStore(Mutex<BTreeMap<Vec<u8>, Vec<u8>>>);

    #[async_trait]
    impl PersistentStore for MapStore {
        async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
            Ok(self.0.lock().get(key).cloned())
        }
        async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexerError> {
            self.0.lock().insert(key.to_vec(), value.to_vec());
            Ok(())
        }
        async fn delete(&self, key: &[u8]) -> Result<(), IndexerError> {
            self.0.lock().remove(key);
            Ok(())
        }
        async fn batch_write(&self, ops: Vec<KvOp>) -> Result<(), IndexerError> {
            let mut map = self.0.lock();
            for op in ops {
                match op {
                    KvOp::Put { key, value } => {
                        map.insert(key, value);
                    }
                    KvOp::Delete { key } => {
                        map.remove(&key);
                    }
                }
            }
            Ok(())
        }
        async fn iterate_prefix(&self, _prefix: &[u8]) -> Result<KvPairs, IndexerError> {
            Ok(Vec::new())
        }
        async fn iterate_range(&self, _s: &[u8], _e: &[u8]) -> Result<KvPairs, IndexerError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn fresh_store_has_default_state() {
        let store = MapStore::default();
        let state = SyncState::load(&store).await.unwrap();
        assert_eq!(state.sync_height, None);
        assert!(state.reorgs_detected.is_empty());
    }

    #[tokio::test]
    async fn save_and_reload() {
        let store = MapStore::default();
        let mut state = SyncState::default();
        state.advance(42, "00ab");
        state.record_reorg(40);
        state.save(&store).await.unwrap();

        let loaded = SyncState::load(&store).await.unwrap();
        assert_eq!(loaded.sync_height, Some(42));
        assert_eq!(loaded.sync_block_hash.as_deref(), Some("00ab"));
        assert_eq!(loaded.reorgs_detected, vec![40]);
        assert!(loaded.updated_at > 0);
    }

    #[tokio::test]
    async fn version_marker_written_then_checked() {
        let store = MapStore::default();
        ensure_db_version(&store).await.unwrap();
        ensure_db_version(&store).await.unwrap();

        store.put(DB_VERSION_KEY, b"0").await.unwrap();
        let err = ensure_db_version(&store).await.unwrap_err();
        assert!(matches!(err, IndexerError::VersionMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn state_without_marker_is_rejected() {
        let store = MapStore::default();
        SyncState::default().save(&store).await.unwrap();
        let err = ensure_db_version(&store).await.unwrap_err();
        assert!(matches!(err, IndexerError::MissingKey { .. }));
    }
}
