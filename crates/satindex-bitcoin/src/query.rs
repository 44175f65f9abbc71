//! Read model served to query callers.
//!
//! A [`ReadModel`] is a frozen copy of the compiling [`IndexerSet`]: its
//! pending overlays are cloned, and reads fall through to the store for
//! anything already flushed. The store is only ever written at heights the
//! published model has already passed, so the fall-through cannot observe
//! state newer than the model.

use serde::Serialize;

use satindex_core::error::IndexerError;
use satindex_core::ids::{OutPoint, UtxoId};
use satindex_core::range::Range;
use satindex_core::sync_state::SyncState;

use crate::ledger::BlockEntry;
use crate::name::NameRecord;
use crate::nft::Inscription;
use crate::rarity::RareHolding;
use crate::sat::{Attribute, Rarity};
use crate::set::IndexerSet;
use crate::ticker::TickerInfo;

/// A live output as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UtxoView {
    pub id: UtxoId,
    pub outpoint: OutPoint,
    pub value: u64,
    pub address: Option<String>,
    pub ranges: Vec<Range>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InscriptionView {
    #[serde(flatten)]
    pub inscription: Inscription,
    /// Output currently holding the inscribed sat; `None` once it is lost.
    pub location: Option<OutPoint>,
}

pub struct ReadModel {
    set: IndexerSet,
}

impl ReadModel {
    pub fn new(set: IndexerSet) -> Self {
        Self { set }
    }

    pub fn sync_state(&self) -> &SyncState {
        self.set.sync_state()
    }

    pub fn height(&self) -> Option<u64> {
        self.set.sync_state().sync_height
    }

    pub async fn block(&self, height: u64) -> Result<Option<BlockEntry>, IndexerError> {
        self.set.ledger().block_entry(height).await
    }

    pub async fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoView>, IndexerError> {
        let ledger = self.set.ledger();
        let Some((id, record)) = ledger.utxo_by_outpoint(outpoint).await? else {
            return Ok(None);
        };
        let address = match record.address {
            Some(aid) => ledger.address(aid).await?,
            None => None,
        };
        Ok(Some(UtxoView {
            id,
            outpoint: record.outpoint,
            value: record.value,
            address,
            ranges: record.ranges,
        }))
    }

    async fn utxo_id(&self, outpoint: &OutPoint) -> Result<Option<UtxoId>, IndexerError> {
        Ok(self
            .set
            .ledger()
            .utxo_by_outpoint(outpoint)
            .await?
            .map(|(id, _)| id))
    }

    async fn outpoint_of(&self, id: UtxoId) -> Result<Option<OutPoint>, IndexerError> {
        Ok(self.set.ledger().utxo(id).await?.map(|r| r.outpoint))
    }

    // ─── Sats ────────────────────────────────────────────────────────────────

    /// Height of the block that mined `sat`.
    pub fn sat_block(&self, sat: i64) -> Option<u64> {
        self.set.ledger().sat_block(sat)
    }

    /// Rarity of `sat`, if it has been mined.
    pub fn sat_rarity(&self, sat: i64) -> Option<Rarity> {
        self.sat_block(sat).map(|_| Rarity::of(sat))
    }

    pub fn sat_attributes(&self, sat: i64) -> Vec<Attribute> {
        self.set.rarity().sat_attributes(sat)
    }

    pub async fn rare_sats(&self, outpoint: &OutPoint) -> Result<Option<RareHolding>, IndexerError> {
        match self.utxo_id(outpoint).await? {
            Some(id) => self.set.rarity().holding(id).await,
            None => Ok(None),
        }
    }

    // ─── Assets ──────────────────────────────────────────────────────────────

    pub async fn inscriptions_on(&self, outpoint: &OutPoint) -> Result<Vec<u64>, IndexerError> {
        match self.utxo_id(outpoint).await? {
            Some(id) => self.set.nft().held_by(id).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn inscription(&self, number: u64) -> Result<Option<InscriptionView>, IndexerError> {
        let nft = self.set.nft();
        let Some(inscription) = nft.inscription(number).await? else {
            return Ok(None);
        };
        let location = match nft.location(number).await? {
            Some(id) => self.outpoint_of(id).await?,
            None => None,
        };
        Ok(Some(InscriptionView {
            inscription,
            location,
        }))
    }

    pub async fn ticker(&self, tick: &str) -> Result<Option<TickerInfo>, IndexerError> {
        self.set.ticker().ticker(tick).await
    }

    pub async fn ticker_balance(&self, outpoint: &OutPoint, tick: &str) -> Result<u64, IndexerError> {
        match self.utxo_id(outpoint).await? {
            Some(id) => self.set.ticker().balance(id, tick).await,
            None => Ok(0),
        }
    }

    pub async fn name(&self, name: &str) -> Result<Option<NameRecord>, IndexerError> {
        self.set.names().record(name).await
    }

    pub async fn name_owner(&self, name: &str) -> Result<Option<OutPoint>, IndexerError> {
        match self.set.names().owner(name).await? {
            Some(id) => self.outpoint_of(id).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sat::starting_sat;
    use crate::test_chain::TestChain;
    use satindex_storage::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn read_model_answers_from_a_frozen_copy() {
        let store = Arc::new(MemoryStore::new());
        let mut set = IndexerSet::load(store).await.unwrap();

        let mut chain = TestChain::new("a");
        chain.mine_empty(1);
        let mut tx = chain.tx(vec![chain.coinbase(0)], &[(5_000_000_000, "alice")]);
        tx.envelopes.push(TestChain::envelope(&[("content_type", "image/png")]));
        tx.envelopes.push(TestChain::envelope(&[("op", "reg"), ("name", "first")]));
        let txid = tx.txid.clone();
        chain.mine(vec![tx]);
        for block in &chain.blocks {
            set.apply_block(block).await.unwrap();
        }

        let model = ReadModel::new(set.clone());
        let out = OutPoint::new(&txid, 0);

        let view = model.utxo(&out).await.unwrap().unwrap();
        assert_eq!(view.address.as_deref(), Some("alice"));
        assert_eq!(view.ranges, vec![Range::new(0, 5_000_000_000)]);

        assert_eq!(model.inscriptions_on(&out).await.unwrap(), vec![0, 1]);
        let ins = model.inscription(0).await.unwrap().unwrap();
        assert_eq!(ins.location, Some(out.clone()));
        assert_eq!(model.name_owner("FIRST").await.unwrap(), Some(out.clone()));

        assert_eq!(model.sat_block(starting_sat(1)), Some(1));
        assert_eq!(model.sat_rarity(0), Some(Rarity::Mythic));
        assert_eq!(model.sat_rarity(starting_sat(5)), None);
        let rare = model.rare_sats(&out).await.unwrap().unwrap();
        assert_eq!(rare.rare_sats[0].sat, 0);

        // Later blocks do not leak into the frozen model.
        let spend = chain.tx(vec![out.clone()], &[(5_000_000_000, "bob")]);
        chain.mine(vec![spend]);
        set.apply_block(&chain.blocks[2]).await.unwrap();
        assert!(model.utxo(&out).await.unwrap().is_some());
        assert_eq!(model.height(), Some(1));
        assert!(ReadModel::new(set).utxo(&out).await.unwrap().is_none());
    }
}
