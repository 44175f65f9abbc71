//! Persistent store contract.
//!
//! An embedded, ordered key-value store. Keys are opaque byte strings
//! compared lexicographically; the only structure this crate relies on is
//! that ordering, for prefix and range scans. `batch_write` must be atomic:
//! readers see either none or all of a batch.
//!
//! Implementations live in `satindex-storage` (memory, SQLite).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::IndexerError;

/// One write in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl KvOp {
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }

    /// Encode `value` as JSON under `key`.
    pub fn put_json<T: Serialize>(key: Vec<u8>, value: &T) -> Result<Self, IndexerError> {
        Ok(Self::Put {
            key,
            value: serde_json::to_vec(value)?,
        })
    }
}

/// Ordered `(key, value)` pairs returned by scans.
pub type KvPairs = Vec<(Vec<u8>, Vec<u8>)>;

#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError>;

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexerError>;

    async fn delete(&self, key: &[u8]) -> Result<(), IndexerError>;

    /// Apply every op atomically, in order.
    async fn batch_write(&self, ops: Vec<KvOp>) -> Result<(), IndexerError>;

    /// Every pair whose key starts with `prefix`, in key order.
    async fn iterate_prefix(&self, prefix: &[u8]) -> Result<KvPairs, IndexerError>;

    /// Every pair with `start <= key < end`, in key order.
    async fn iterate_range(&self, start: &[u8], end: &[u8]) -> Result<KvPairs, IndexerError>;
}

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn PersistentStore,
    key: &[u8],
) -> Result<Option<T>, IndexerError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Read a JSON value the schema guarantees to exist.
pub async fn require_json<T: DeserializeOwned>(
    store: &dyn PersistentStore,
    key: &[u8],
) -> Result<T, IndexerError> {
    get_json(store, key)
        .await?
        .ok_or_else(|| IndexerError::missing_key(key))
}

/// Smallest key strictly greater than every key starting with `prefix`,
/// or `None` if no such key exists (prefix is all `0xff`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Concatenate a textual prefix and a binary suffix into a key.
pub fn key(prefix: &str, suffix: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(prefix.len() + suffix.len());
    k.extend_from_slice(prefix.as_bytes());
    k.extend_from_slice(suffix);
    k
}
