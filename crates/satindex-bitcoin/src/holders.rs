//! Asset book: which sats carry which asset, and which outputs hold them.
//!
//! Inscriptions, tickers and names all bind an asset tag to a sat range
//! once, at mint time. Sats never change identity, so an output's holdings
//! are simply the intersections of its ranges with the mint store.
//!
//! The mint store lives in memory and is rebuilt at load by replaying the
//! persisted mint log through [`RangeIntervalStore::add_mint_info`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use satindex_core::delta::PendingMap;
use satindex_core::error::IndexerError;
use satindex_core::ids::UtxoId;
use satindex_core::range::Range;
use satindex_core::range_store::RangeIntervalStore;
use satindex_core::store::{KvOp, PersistentStore};

use crate::keys::{self, book_key};
use crate::ledger::CreatedOutput;

/// A value usable as an asset tag and as a store key suffix.
pub trait AssetTag:
    Ord + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn key_bytes(&self) -> Vec<u8>;
}

impl AssetTag for u64 {
    fn key_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }
}

impl AssetTag for String {
    fn key_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRecord<T> {
    pub range: Range,
    pub tag: T,
}

/// Asset-bound sats held by one output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding<T> {
    pub range: Range,
    pub tags: Vec<T>,
}

#[derive(Clone)]
pub struct AssetBook<T> {
    store: Arc<dyn PersistentStore>,
    book: &'static str,
    mints: RangeIntervalStore<BTreeSet<T>>,
    mint_log: PendingMap<u64, MintRecord<T>>,
    mint_count: u64,
    holdings: PendingMap<UtxoId, Vec<Holding<T>>>,
    locations: PendingMap<T, UtxoId>,
}

impl<T: AssetTag> AssetBook<T> {
    pub async fn load(store: Arc<dyn PersistentStore>, book: &'static str) -> Result<Self, IndexerError> {
        let mut mints = RangeIntervalStore::new();
        let mut mint_count = 0;
        for (_, value) in store.iterate_prefix(&book_key(book, keys::MINT, &[])).await? {
            let record: MintRecord<T> = serde_json::from_slice(&value)?;
            mints.add_mint_info(record.range, record.tag);
            mint_count += 1;
        }
        debug!(book, mint_count, fragments = mints.len(), "asset book loaded");

        Ok(Self {
            store,
            book,
            mints,
            mint_log: PendingMap::new(),
            mint_count,
            holdings: PendingMap::new(),
            locations: PendingMap::new(),
        })
    }

    pub fn mints(&self) -> &RangeIntervalStore<BTreeSet<T>> {
        &self.mints
    }

    pub fn mint_count(&self) -> u64 {
        self.mint_count
    }

    /// Bind `tag` to `range`. Overlapping bindings keep every tag.
    pub fn bind(&mut self, range: Range, tag: T) {
        if range.is_empty() {
            return;
        }
        self.mints.add_mint_info(range, tag.clone());
        self.mint_log.insert(self.mint_count, MintRecord { range, tag });
        self.mint_count += 1;
    }

    /// Returns `true` if any sat of `range` already carries `tag`.
    pub fn carries(&self, range: &Range, tag: &T) -> bool {
        self.mints
            .find_intersections(range)
            .iter()
            .any(|(_, tags)| tags.contains(tag))
    }

    /// Total sats bound to `tag`.
    pub fn bound_size(&self, tag: &T) -> i64 {
        self.mints
            .iter()
            .filter(|(_, tags)| tags.contains(tag))
            .map(|(r, _)| r.size)
            .sum()
    }

    /// Forget the holdings of a spent output.
    pub async fn spend(&mut self, id: UtxoId) -> Result<(), IndexerError> {
        let held = self.holdings(id).await?;
        if held.is_empty() {
            return Ok(());
        }
        self.holdings.remove(id);
        let tags: BTreeSet<T> = held.into_iter().flat_map(|h| h.tags).collect();
        for tag in tags {
            if self.location(&tag).await? == Some(id) {
                self.locations.remove(tag);
            }
        }
        Ok(())
    }

    /// Record what a new output holds.
    pub fn place(&mut self, output: &CreatedOutput) {
        let mut held = Vec::new();
        for range in &output.ranges {
            for (sub, tags) in self.mints.find_intersections(range) {
                held.push(Holding {
                    range: sub,
                    tags: tags.iter().cloned().collect(),
                });
            }
        }
        if held.is_empty() {
            return;
        }
        for holding in &held {
            for tag in &holding.tags {
                self.locations.insert(tag.clone(), output.id);
            }
        }
        self.holdings.insert(output.id, held);
    }

    pub async fn holdings(&self, id: UtxoId) -> Result<Vec<Holding<T>>, IndexerError> {
        let key = book_key(self.book, keys::HOLDING, &id.to_be_bytes());
        Ok(self
            .holdings
            .get_through(&id, self.store.as_ref(), &key)
            .await?
            .unwrap_or_default())
    }

    /// Output currently holding (some of) `tag`, if it is still live.
    pub async fn location(&self, tag: &T) -> Result<Option<UtxoId>, IndexerError> {
        let key = book_key(self.book, keys::LOCATION, &tag.key_bytes());
        self.locations
            .get_through(tag, self.store.as_ref(), &key)
            .await
    }

    // ─── Delta ───────────────────────────────────────────────────────────────

    pub fn clone_delta(&self) -> Self {
        Self {
            store: self.store.clone(),
            book: self.book,
            mints: RangeIntervalStore::new(),
            mint_log: self.mint_log.clone(),
            mint_count: self.mint_count,
            holdings: self.holdings.clone(),
            locations: self.locations.clone(),
        }
    }

    pub fn subtract(&mut self, backup: &Self) {
        self.mint_log.subtract(&backup.mint_log);
        self.holdings.subtract(&backup.holdings);
        self.locations.subtract(&backup.locations);
    }

    pub fn delta_ops(&self) -> Result<Vec<KvOp>, IndexerError> {
        let book = self.book;
        let mut ops = self
            .mint_log
            .to_ops(|n| book_key(book, keys::MINT, &n.to_be_bytes()))?;
        ops.extend(
            self.holdings
                .to_ops(|id| book_key(book, keys::HOLDING, &id.to_be_bytes()))?,
        );
        ops.extend(
            self.locations
                .to_ops(|tag| book_key(book, keys::LOCATION, &tag.key_bytes()))?,
        );
        Ok(ops)
    }

    pub fn delta_len(&self) -> usize {
        self.mint_log.len() + self.holdings.len() + self.locations.len()
    }
}
