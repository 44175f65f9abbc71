//! Name registrations.
//!
//! A `reg` envelope claims a name for the first sat of the transaction's
//! first non-empty output. Names are case-insensitive and the first
//! registration wins; whoever holds the sat owns the name.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use satindex_core::delta::PendingMap;
use satindex_core::error::IndexerError;
use satindex_core::ids::UtxoId;
use satindex_core::range::Range;
use satindex_core::snapshot::SubIndexer;
use satindex_core::store::{KvOp, PersistentStore};
use satindex_core::types::Envelope;

use crate::holders::AssetBook;
use crate::keys;
use crate::ledger::AppliedTx;

pub const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
    pub name: String,
    pub sat: i64,
    pub txid: String,
    pub height: u64,
}

/// Canonical form of a registrable name, or `None` if it is not one.
pub fn normalize(raw: &str) -> Option<String> {
    let name = raw.trim().to_lowercase();
    let valid = !name.is_empty()
        && name.chars().count() <= MAX_NAME_LEN
        && !name.chars().any(char::is_whitespace);
    valid.then_some(name)
}

fn registration(envelope: &Envelope) -> Option<String> {
    if envelope.get("op")?.as_str() != "reg" {
        return None;
    }
    normalize(envelope.get("name")?)
}

#[derive(Clone)]
pub struct NameIndexer {
    store: Arc<dyn PersistentStore>,
    book: AssetBook<String>,
    names: PendingMap<String, NameRecord>,
}

impl NameIndexer {
    pub async fn load(store: Arc<dyn PersistentStore>) -> Result<Self, IndexerError> {
        Ok(Self {
            book: AssetBook::load(store.clone(), keys::NAME_BOOK).await?,
            store,
            names: PendingMap::new(),
        })
    }

    pub async fn on_tx(&mut self, tx: &AppliedTx<'_>, height: u64) -> Result<(), IndexerError> {
        for id in &tx.spent {
            self.book.spend(*id).await?;
        }

        let claims: Vec<String> = tx.tx.envelopes.iter().filter_map(registration).collect();
        if !claims.is_empty() {
            let Some(sat) = tx.first_sat() else {
                debug!(txid = %tx.tx.txid, "name claims without sats to bind");
                return self.place_outputs(tx);
            };
            for name in claims {
                if self.record(&name).await?.is_some() {
                    debug!(%name, "name already registered");
                    continue;
                }
                debug!(%name, sat, height, "name registered");
                self.book.bind(Range::new(sat, 1), name.clone());
                self.names.insert(
                    name.clone(),
                    NameRecord {
                        name,
                        sat,
                        txid: tx.tx.txid.clone(),
                        height,
                    },
                );
            }
        }

        self.place_outputs(tx)
    }

    fn place_outputs(&mut self, tx: &AppliedTx<'_>) -> Result<(), IndexerError> {
        for output in &tx.outputs {
            self.book.place(output);
        }
        Ok(())
    }

    pub async fn record(&self, name: &str) -> Result<Option<NameRecord>, IndexerError> {
        let Some(name) = normalize(name) else {
            return Ok(None);
        };
        let key = keys::str_key(keys::NAME, &name);
        self.names.get_through(&name, self.store.as_ref(), &key).await
    }

    /// Output currently holding the name's sat.
    pub async fn owner(&self, name: &str) -> Result<Option<UtxoId>, IndexerError> {
        match normalize(name) {
            Some(name) => self.book.location(&name).await,
            None => Ok(None),
        }
    }

    pub fn delta_ops(&self) -> Result<Vec<KvOp>, IndexerError> {
        let mut ops = self.names.to_ops(|n| keys::str_key(keys::NAME, n))?;
        ops.extend(self.book.delta_ops()?);
        Ok(ops)
    }

    pub fn delta_len(&self) -> usize {
        self.names.len() + self.book.delta_len()
    }
}

#[async_trait]
impl SubIndexer for NameIndexer {
    fn name(&self) -> &'static str {
        "names"
    }

    fn clone_delta(&self) -> Self {
        Self {
            store: self.store.clone(),
            book: self.book.clone_delta(),
            names: self.names.clone(),
        }
    }

    fn subtract(&mut self, backup: &Self) {
        self.names.subtract(&backup.names);
        self.book.subtract(&backup.book);
    }

    async fn update_db(&self) -> Result<(), IndexerError> {
        self.store.batch_write(self.delta_ops()?).await
    }

    async fn check_consistency(&self) -> Result<bool, IndexerError> {
        let names = self
            .names
            .scan_through(self.store.as_ref(), keys::NAME.as_bytes(), keys::decode_str)
            .await?;
        for (name, record) in &names {
            if !self.book.carries(&Range::new(record.sat, 1), name) {
                error!(%name, sat = record.sat, "name sat is not bound");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::test_chain::TestChain;
    use satindex_core::ids::OutPoint;
    use satindex_storage::MemoryStore;

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize("  Satoshi "), Some("satoshi".into()));
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("two words"), None);
        assert_eq!(normalize(&"x".repeat(MAX_NAME_LEN + 1)), None);
    }

    #[tokio::test]
    async fn first_registration_wins_and_follows_the_sat() {
        let store = Arc::new(MemoryStore::new());
        let mut ledger = Ledger::load(store.clone()).await.unwrap();
        let mut names = NameIndexer::load(store).await.unwrap();

        let mut chain = TestChain::new("a");
        chain.mine_empty(2);
        let c0 = chain.coinbase(0);
        let c1 = chain.coinbase(1);
        let mut first = chain.tx(vec![c0], &[(5_000_000_000, "alice")]);
        first.envelopes.push(TestChain::envelope(&[("op", "reg"), ("name", "Hal")]));
        let first_txid = first.txid.clone();
        let mut second = chain.tx(vec![c1], &[(5_000_000_000, "bob")]);
        second.envelopes.push(TestChain::envelope(&[("op", "reg"), ("name", "hal")]));
        chain.mine(vec![first, second]);
        let sell = chain.tx(vec![OutPoint::new(&first_txid, 0)], &[(5_000_000_000, "carol")]);
        let sell_txid = sell.txid.clone();
        chain.mine(vec![sell]);

        for block in &chain.blocks {
            for tx in &ledger.apply_block(block).await.unwrap() {
                names.on_tx(tx, block.height).await.unwrap();
            }
        }

        let record = names.record("HAL").await.unwrap().unwrap();
        assert_eq!(record.txid, first_txid);
        assert_eq!(record.sat, 0);

        let (carol, _) = ledger
            .utxo_by_outpoint(&OutPoint::new(&sell_txid, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(names.owner("hal").await.unwrap(), Some(carol));
        assert_eq!(names.owner("nobody").await.unwrap(), None);
        assert!(names.check_consistency().await.unwrap());
    }
}
