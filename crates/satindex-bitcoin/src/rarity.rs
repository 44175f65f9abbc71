//! Rare-sat holdings per UTXO.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;

use satindex_core::delta::PendingMap;
use satindex_core::error::IndexerError;
use satindex_core::ids::UtxoId;
use satindex_core::point_index::PointIndex;
use satindex_core::range::Range;
use satindex_core::range_store::RangeIntervalStore;
use satindex_core::snapshot::SubIndexer;
use satindex_core::store::{KvOp, PersistentStore};

use crate::keys;
use crate::ledger::{AppliedTx, CreatedOutput};
use crate::sat::{attribute_store, Attribute, Rarity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RareSat {
    pub sat: i64,
    pub rarity: Rarity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSpan {
    pub range: Range,
    pub attributes: Vec<Attribute>,
}

/// The special sats one output holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RareHolding {
    pub rare_sats: Vec<RareSat>,
    pub attributes: Vec<AttributeSpan>,
}

impl RareHolding {
    pub fn is_empty(&self) -> bool {
        self.rare_sats.is_empty() && self.attributes.is_empty()
    }
}

#[derive(Clone)]
pub struct RarityIndexer {
    store: Arc<dyn PersistentStore>,
    attributes: Arc<RangeIntervalStore<BTreeSet<Attribute>>>,
    holdings: PendingMap<UtxoId, RareHolding>,
}

impl RarityIndexer {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            store,
            attributes: Arc::new(attribute_store()),
            holdings: PendingMap::new(),
        }
    }

    /// Attributes carried by a single sat.
    pub fn sat_attributes(&self, sat: i64) -> Vec<Attribute> {
        self.attributes
            .find_intersections(&Range::new(sat, 1))
            .into_iter()
            .flat_map(|(_, tags)| tags.iter().copied())
            .collect()
    }

    pub async fn on_tx(
        &mut self,
        tx: &AppliedTx<'_>,
        first_sats: &PointIndex<u64>,
    ) -> Result<(), IndexerError> {
        for id in &tx.spent {
            if self.holding(*id).await?.is_some() {
                self.holdings.remove(*id);
            }
        }
        for output in &tx.outputs {
            let holding = self.scan(output, first_sats);
            if !holding.is_empty() {
                self.holdings.insert(output.id, holding);
            }
        }
        Ok(())
    }

    /// Only block-first sats are above common, so the candidates are the
    /// points of `first_sats` inside each range.
    fn scan(&self, output: &CreatedOutput, first_sats: &PointIndex<u64>) -> RareHolding {
        let mut holding = RareHolding::default();
        for range in &output.ranges {
            for sat in first_sats.find_sat_values_with_range(range).into_keys() {
                if sat < range.end() {
                    holding.rare_sats.push(RareSat {
                        sat,
                        rarity: Rarity::of(sat),
                    });
                }
            }
            for (span, tags) in self.attributes.find_intersections(range) {
                holding.attributes.push(AttributeSpan {
                    range: span,
                    attributes: tags.iter().copied().collect(),
                });
            }
        }
        holding
    }

    pub async fn holding(&self, id: UtxoId) -> Result<Option<RareHolding>, IndexerError> {
        self.holdings
            .get_through(&id, self.store.as_ref(), &keys::utxo_key(keys::RARE, id))
            .await
    }

    pub fn delta_ops(&self) -> Result<Vec<KvOp>, IndexerError> {
        self.holdings.to_ops(|id| keys::utxo_key(keys::RARE, *id))
    }

    pub fn delta_len(&self) -> usize {
        self.holdings.len()
    }
}

#[async_trait]
impl SubIndexer for RarityIndexer {
    fn name(&self) -> &'static str {
        "rarity"
    }

    fn clone_delta(&self) -> Self {
        self.clone()
    }

    fn subtract(&mut self, backup: &Self) {
        self.holdings.subtract(&backup.holdings);
    }

    async fn update_db(&self) -> Result<(), IndexerError> {
        self.store.batch_write(self.delta_ops()?).await
    }

    /// Every recorded rare sat must still compute to the recorded rarity.
    async fn check_consistency(&self) -> Result<bool, IndexerError> {
        let holdings = self
            .holdings
            .scan_through(self.store.as_ref(), keys::RARE.as_bytes(), keys::decode_utxo)
            .await?;
        for (id, holding) in &holdings {
            for rare in &holding.rare_sats {
                let actual = Rarity::of(rare.sat);
                if actual != rare.rarity || actual == Rarity::Common {
                    error!(utxo = %id, sat = rare.sat, recorded = %rare.rarity, %actual, "rarity mismatch");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::sat::{starting_sat, COIN};
    use crate::test_chain::TestChain;
    use satindex_core::ids::OutPoint;
    use satindex_storage::MemoryStore;

    #[tokio::test]
    async fn rare_sats_follow_their_outputs() {
        let store = Arc::new(MemoryStore::new());
        let mut ledger = Ledger::load(store.clone()).await.unwrap();
        let mut rarity = RarityIndexer::new(store.clone());

        let mut chain = TestChain::new("a");
        chain.mine_empty(2);
        let c0 = chain.coinbase(0);
        let c1 = chain.coinbase(1);
        let tx = chain.tx(vec![c1, c0], &[(100 * COIN as u64, "alice")]);
        chain.mine(vec![tx]);

        for block in &chain.blocks {
            let applied = ledger.apply_block(block).await.unwrap();
            for tx in &applied {
                rarity.on_tx(tx, ledger.first_sats()).await.unwrap();
            }
        }

        let coinbase0 = ledger.utxo_by_outpoint(&chain.coinbase(0)).await.unwrap();
        assert!(coinbase0.is_none());

        let spend = &chain.blocks[2].txs[1];
        let (id, _) = ledger
            .utxo_by_outpoint(&OutPoint::new(&spend.txid, 0))
            .await
            .unwrap()
            .unwrap();
        let holding = rarity.holding(id).await.unwrap().unwrap();
        let rares: Vec<_> = holding.rare_sats.iter().map(|r| (r.sat, r.rarity)).collect();
        assert_eq!(
            rares,
            vec![(starting_sat(1), Rarity::Uncommon), (0, Rarity::Mythic)]
        );
        assert!(holding
            .attributes
            .iter()
            .all(|span| span.attributes.contains(&Attribute::Vintage)));

        let coinbase0_id = UtxoId::new(0, 0, 0).unwrap();
        assert!(rarity.holding(coinbase0_id).await.unwrap().is_none());
        assert!(rarity.check_consistency().await.unwrap());
    }

    #[test]
    fn sat_attributes_union() {
        let rarity = RarityIndexer::new(Arc::new(MemoryStore::new()));
        let attrs = rarity.sat_attributes(starting_sat(78));
        assert_eq!(
            attrs,
            vec![Attribute::Vintage, Attribute::Block78, Attribute::FirstEpoch]
        );
        assert_eq!(rarity.sat_attributes(starting_sat(300_000)), Vec::new());
    }
}
