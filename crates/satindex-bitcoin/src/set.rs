//! The full compiling state: ledger, asset sub-indexers and sync state,
//! advanced and committed together.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use satindex_core::error::IndexerError;
use satindex_core::snapshot::SubIndexer;
use satindex_core::store::PersistentStore;
use satindex_core::sync_state::SyncState;
use satindex_core::types::Block;

use crate::ledger::Ledger;
use crate::name::NameIndexer;
use crate::nft::NftIndexer;
use crate::rarity::RarityIndexer;
use crate::ticker::TickerIndexer;

#[derive(Clone)]
pub struct IndexerSet {
    store: Arc<dyn PersistentStore>,
    sync: SyncState,
    ledger: Ledger,
    rarity: RarityIndexer,
    nft: NftIndexer,
    ticker: TickerIndexer,
    names: NameIndexer,
}

impl IndexerSet {
    /// Load every sub-indexer from what the store holds.
    pub async fn load(store: Arc<dyn PersistentStore>) -> Result<Self, IndexerError> {
        let sync = SyncState::load(store.as_ref()).await?;
        let set = Self {
            ledger: Ledger::load(store.clone()).await?,
            rarity: RarityIndexer::new(store.clone()),
            nft: NftIndexer::load(store.clone()).await?,
            ticker: TickerIndexer::load(store.clone()).await?,
            names: NameIndexer::load(store.clone()).await?,
            sync,
            store,
        };
        info!(
            sync_height = ?set.sync.sync_height,
            inscriptions = set.nft.next_number(),
            "indexer set loaded"
        );
        Ok(set)
    }

    /// Apply one block to every sub-indexer, in transaction processing order.
    pub async fn apply_block(&mut self, block: &Block) -> Result<(), IndexerError> {
        let applied = self.ledger.apply_block(block).await?;
        for tx in &applied {
            self.rarity.on_tx(tx, self.ledger.first_sats()).await?;
            self.nft.on_tx(tx, block.height).await?;
            self.ticker.on_tx(tx, block.height).await?;
            self.names.on_tx(tx, block.height).await?;
        }
        self.sync.advance(block.height, block.hash.clone());
        debug!(height = block.height, txs = applied.len(), pending = self.delta_len(), "block indexed");
        Ok(())
    }

    pub fn set_chain_tip(&mut self, tip: u64) {
        self.sync.chain_tip = tip;
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    pub fn sync_state_mut(&mut self) -> &mut SyncState {
        &mut self.sync
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn rarity(&self) -> &RarityIndexer {
        &self.rarity
    }

    pub fn nft(&self) -> &NftIndexer {
        &self.nft
    }

    pub fn ticker(&self) -> &TickerIndexer {
        &self.ticker
    }

    pub fn names(&self) -> &NameIndexer {
        &self.names
    }

    /// Pending (unflushed) writes across all sub-indexers.
    pub fn delta_len(&self) -> usize {
        self.ledger.delta_len()
            + self.rarity.delta_len()
            + self.nft.delta_len()
            + self.ticker.delta_len()
            + self.names.delta_len()
    }
}

#[async_trait]
impl SubIndexer for IndexerSet {
    fn name(&self) -> &'static str {
        "indexer-set"
    }

    fn clone_delta(&self) -> Self {
        Self {
            store: self.store.clone(),
            sync: self.sync.clone(),
            ledger: self.ledger.clone_delta(),
            rarity: self.rarity.clone_delta(),
            nft: self.nft.clone_delta(),
            ticker: self.ticker.clone_delta(),
            names: self.names.clone_delta(),
        }
    }

    fn subtract(&mut self, backup: &Self) {
        self.ledger.subtract(&backup.ledger);
        self.rarity.subtract(&backup.rarity);
        self.nft.subtract(&backup.nft);
        self.ticker.subtract(&backup.ticker);
        self.names.subtract(&backup.names);
    }

    /// Every sub-indexer's delta and the sync state go out in one batch, so
    /// the store never holds a partially flushed generation.
    async fn update_db(&self) -> Result<(), IndexerError> {
        let mut ops = self.ledger.delta_ops()?;
        ops.extend(self.rarity.delta_ops()?);
        ops.extend(self.nft.delta_ops()?);
        ops.extend(self.ticker.delta_ops()?);
        ops.extend(self.names.delta_ops()?);
        ops.push(self.sync.to_op()?);

        let count = ops.len();
        self.store.batch_write(ops).await?;
        info!(height = ?self.sync.sync_height, ops = count, "generation flushed");
        Ok(())
    }

    async fn check_consistency(&self) -> Result<bool, IndexerError> {
        let mut ok = true;
        let results = [
            (self.ledger.name(), self.ledger.check_consistency().await?),
            (self.rarity.name(), self.rarity.check_consistency().await?),
            (self.nft.name(), self.nft.check_consistency().await?),
            (self.ticker.name(), self.ticker.check_consistency().await?),
            (self.names.name(), self.names.check_consistency().await?),
        ];
        for (name, passed) in results {
            if !passed {
                warn!(indexer = name, "consistency check failed");
                ok = false;
            }
        }
        Ok(ok)
    }
}
