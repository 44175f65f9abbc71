//! In-memory storage backend.
//!
//! Keeps every key in a `BTreeMap` behind one lock. Useful for testing and
//! short-lived indexers that don't need persistence.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use parking_lot::RwLock;

use satindex_core::error::IndexerError;
use satindex_core::store::{prefix_successor, KvOp, KvPairs, PersistentStore};

/// In-memory ordered key-value store.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    fn scan(&self, start: &[u8], end: Option<&[u8]>) -> KvPairs {
        let upper = match end {
            Some(e) => Bound::Excluded(e.to_vec()),
            None => Bound::Unbounded,
        };
        self.map
            .read()
            .range((Bound::Included(start.to_vec()), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
        Ok(self.map.read().get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexerError> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), IndexerError> {
        self.map.write().remove(key);
        Ok(())
    }

    async fn batch_write(&self, ops: Vec<KvOp>) -> Result<(), IndexerError> {
        // One write guard for the whole batch: readers see all or nothing.
        let mut map = self.map.write();
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

    async fn iterate_prefix(&self, prefix: &[u8]) -> Result<KvPairs, IndexerError> {
        let end = prefix_successor(prefix);
        Ok(self.scan(prefix, end.as_deref()))
    }

    async fn iterate_range(&self, start: &[u8], end: &[u8]) -> Result<KvPairs, IndexerError> {
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(self.scan(start, Some(end)))
    }
}
