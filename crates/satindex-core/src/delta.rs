//! Sequence-numbered overlay of not-yet-persisted writes.
//!
//! Every write gets the next sequence number. A clone carries the counter
//! with it, so the clone's counter is a cursor: after the clone has been
//! flushed, [`PendingMap::subtract`] drops every entry written before that
//! cursor and keeps the ones written since.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::IndexerError;
use crate::store::{get_json, KvOp, PersistentStore};

#[derive(Debug, Clone)]
struct Pending<V> {
    seq: u64,
    value: Option<V>,
}

/// Result of looking a key up in the overlay.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<'a, V> {
    /// Written in this delta.
    Present(&'a V),
    /// Deleted in this delta; the store copy is stale.
    Deleted,
    /// Not touched; fall through to the store.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PendingMap<K, V> {
    entries: BTreeMap<K, Pending<V>>,
    next_seq: u64,
}

impl<K: Ord, V> Default for PendingMap<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<K: Ord + Clone, V> PendingMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence number the next write will get.
    pub fn watermark(&self) -> u64 {
        self.next_seq
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.write(key, Some(value));
    }

    /// Record a tombstone for `key`.
    pub fn remove(&mut self, key: K) {
        self.write(key, None);
    }

    pub fn lookup(&self, key: &K) -> Lookup<'_, V> {
        match self.entries.get(key) {
            Some(Pending { value: Some(v), .. }) => Lookup::Present(v),
            Some(Pending { value: None, .. }) => Lookup::Deleted,
            None => Lookup::Unknown,
        }
    }

    /// Live (non-tombstone) entries.
    pub fn values(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries
            .iter()
            .filter_map(|(k, p)| p.value.as_ref().map(|v| (k, v)))
    }

    /// Every entry, with `None` for tombstones.
    pub fn iter(&self) -> impl Iterator<Item = (&K, Option<&V>)> {
        self.entries.iter().map(|(k, p)| (k, p.value.as_ref()))
    }

    /// Drop everything `flushed` captured: entries last written before its
    /// watermark. Entries rewritten after the clone was taken survive.
    pub fn subtract(&mut self, flushed: &PendingMap<K, V>) {
        let cutoff = flushed.next_seq;
        self.entries.retain(|_, p| p.seq >= cutoff);
    }

    fn write(&mut self, key: K, value: Option<V>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, Pending { seq, value });
    }
}

impl<K: Ord + Clone, V: Serialize> PendingMap<K, V> {
    /// Encode the delta as store writes, values as JSON.
    pub fn to_ops(&self, encode_key: impl Fn(&K) -> Vec<u8>) -> Result<Vec<KvOp>, IndexerError> {
        self.entries
            .iter()
            .map(|(k, p)| match &p.value {
                Some(v) => KvOp::put_json(encode_key(k), v),
                None => Ok(KvOp::Delete { key: encode_key(k) }),
            })
            .collect()
    }
}

impl<K, V> PendingMap<K, V>
where
    K: Ord + Clone + Sync,
    V: Clone + DeserializeOwned + Send + Sync,
{
    /// Read `key` from the overlay, falling back to `store` under `encoded`.
    pub async fn get_through(
        &self,
        key: &K,
        store: &dyn PersistentStore,
        encoded: &[u8],
    ) -> Result<Option<V>, IndexerError> {
        match self.lookup(key) {
            Lookup::Present(v) => Ok(Some(v.clone())),
            Lookup::Deleted => Ok(None),
            Lookup::Unknown => get_json(store, encoded).await,
        }
    }

    /// Every live value under `prefix`: the store's copy with this overlay
    /// applied on top. `decode_key` gets the key bytes after `prefix`;
    /// entries it rejects are skipped.
    pub async fn scan_through(
        &self,
        store: &dyn PersistentStore,
        prefix: &[u8],
        decode_key: impl Fn(&[u8]) -> Option<K> + Send,
    ) -> Result<BTreeMap<K, V>, IndexerError> {
        let mut merged = BTreeMap::new();
        for (key, value) in store.iterate_prefix(prefix).await? {
            if let Some(k) = decode_key(&key[prefix.len()..]) {
                merged.insert(k, serde_json::from_slice(&value)?);
            }
        }
        for (k, v) in self.iter() {
            match v {
                Some(v) => merged.insert(k.clone(), v.clone()),
                None => merged.remove(k),
            };
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_states() {
        let mut m = PendingMap::new();
        m.insert(1u32, "a");
        m.remove(2u32);
        assert_eq!(m.lookup(&1), Lookup::Present(&"a"));
        assert_eq!(m.lookup(&2), Lookup::Deleted);
        assert_eq!(m.lookup(&3), Lookup::Unknown);
        assert_eq!(m.values().count(), 1);
    }

    #[test]
    fn clone_then_subtract_empties() {
        let mut m = PendingMap::new();
        m.insert(1u32, 10u32);
        m.insert(2, 20);
        let backup = m.clone();
        m.subtract(&backup);
        assert!(m.is_empty());
    }

    #[test]
    fn subtract_keeps_writes_after_clone() {
        let mut m = PendingMap::new();
        m.insert(1u32, 10u32);
        m.insert(2, 20);
        let backup = m.clone();

        m.insert(2, 21); // rewritten after the clone
        m.insert(3, 30);
        m.subtract(&backup);

        let left: Vec<_> = m.values().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(left, vec![(2, 21), (3, 30)]);
    }

    #[test]
    fn to_ops_emits_puts_and_deletes() {
        let mut m = PendingMap::new();
        m.insert(1u8, true);
        m.remove(2u8);
        let ops = m.to_ops(|k| vec![*k]).unwrap();
        assert_eq!(
            ops,
            vec![
                KvOp::Put { key: vec![1], value: b"true".to_vec() },
                KvOp::Delete { key: vec![2] },
            ]
        );
    }
}
