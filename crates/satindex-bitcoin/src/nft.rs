//! Inscription (NFT) sub-indexer.
//!
//! Every envelope in a transaction creates an inscription bound to the first
//! sat of the transaction's first non-empty output. Inscriptions are
//! numbered sequentially in processing order.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use satindex_core::delta::PendingMap;
use satindex_core::error::IndexerError;
use satindex_core::ids::UtxoId;
use satindex_core::range::Range;
use satindex_core::snapshot::SubIndexer;
use satindex_core::store::{get_json, KvOp, PersistentStore};
use satindex_core::types::Envelope;

use crate::holders::AssetBook;
use crate::keys;
use crate::ledger::AppliedTx;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inscription {
    pub number: u64,
    pub txid: String,
    pub height: u64,
    pub sat: i64,
    pub content_type: Option<String>,
    pub fields: Envelope,
}

#[derive(Clone)]
pub struct NftIndexer {
    store: Arc<dyn PersistentStore>,
    book: AssetBook<u64>,
    inscriptions: PendingMap<u64, Inscription>,
    next_number: u64,
}

impl NftIndexer {
    pub async fn load(store: Arc<dyn PersistentStore>) -> Result<Self, IndexerError> {
        let book = AssetBook::load(store.clone(), keys::NFT_BOOK).await?;
        let next_number = get_json(store.as_ref(), keys::NEXT_INSCRIPTION)
            .await?
            .unwrap_or(0);
        Ok(Self {
            store,
            book,
            inscriptions: PendingMap::new(),
            next_number,
        })
    }

    pub fn book(&self) -> &AssetBook<u64> {
        &self.book
    }

    /// Number the next inscription will get.
    pub fn next_number(&self) -> u64 {
        self.next_number
    }

    pub async fn on_tx(&mut self, tx: &AppliedTx<'_>, height: u64) -> Result<(), IndexerError> {
        for id in &tx.spent {
            self.book.spend(*id).await?;
        }

        if !tx.tx.envelopes.is_empty() {
            match tx.first_sat() {
                Some(sat) => {
                    for envelope in &tx.tx.envelopes {
                        self.inscribe(tx, height, sat, envelope);
                    }
                }
                None => debug!(txid = %tx.tx.txid, "envelopes without sats to bind"),
            }
        }

        for output in &tx.outputs {
            self.book.place(output);
        }
        Ok(())
    }

    fn inscribe(&mut self, tx: &AppliedTx<'_>, height: u64, sat: i64, envelope: &Envelope) {
        let number = self.next_number;
        self.next_number += 1;
        self.book.bind(Range::new(sat, 1), number);
        self.inscriptions.insert(
            number,
            Inscription {
                number,
                txid: tx.tx.txid.clone(),
                height,
                sat,
                content_type: envelope.get("content_type").cloned(),
                fields: envelope.clone(),
            },
        );
        debug!(number, sat, height, "inscription created");
    }

    pub async fn inscription(&self, number: u64) -> Result<Option<Inscription>, IndexerError> {
        self.inscriptions
            .get_through(&number, self.store.as_ref(), &keys::u64_key(keys::INSCRIPTION, number))
            .await
    }

    /// Inscription numbers held by an output.
    pub async fn held_by(&self, id: UtxoId) -> Result<Vec<u64>, IndexerError> {
        let mut numbers: Vec<u64> = self
            .book
            .holdings(id)
            .await?
            .into_iter()
            .flat_map(|h| h.tags)
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }

    pub async fn location(&self, number: u64) -> Result<Option<UtxoId>, IndexerError> {
        self.book.location(&number).await
    }

    pub fn delta_ops(&self) -> Result<Vec<KvOp>, IndexerError> {
        let mut ops = self
            .inscriptions
            .to_ops(|n| keys::u64_key(keys::INSCRIPTION, *n))?;
        ops.extend(self.book.delta_ops()?);
        ops.push(KvOp::put_json(keys::NEXT_INSCRIPTION.to_vec(), &self.next_number)?);
        Ok(ops)
    }

    pub fn delta_len(&self) -> usize {
        self.inscriptions.len() + self.book.delta_len()
    }
}

#[async_trait]
impl SubIndexer for NftIndexer {
    fn name(&self) -> &'static str {
        "nft"
    }

    fn clone_delta(&self) -> Self {
        Self {
            store: self.store.clone(),
            book: self.book.clone_delta(),
            inscriptions: self.inscriptions.clone(),
            next_number: self.next_number,
        }
    }

    fn subtract(&mut self, backup: &Self) {
        self.inscriptions.subtract(&backup.inscriptions);
        self.book.subtract(&backup.book);
    }

    async fn update_db(&self) -> Result<(), IndexerError> {
        self.store.batch_write(self.delta_ops()?).await
    }

    /// Every inscription's sat must carry its number, and the numbering must
    /// have no gaps.
    async fn check_consistency(&self) -> Result<bool, IndexerError> {
        let all = self
            .inscriptions
            .scan_through(self.store.as_ref(), keys::INSCRIPTION.as_bytes(), keys::decode_u64)
            .await?;
        if all.len() as u64 != self.next_number {
            error!(count = all.len(), next = self.next_number, "inscription numbering has gaps");
            return Ok(false);
        }
        for (number, inscription) in &all {
            if !self.book.carries(&Range::new(inscription.sat, 1), number) {
                error!(number, sat = inscription.sat, "inscription sat is not bound");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
