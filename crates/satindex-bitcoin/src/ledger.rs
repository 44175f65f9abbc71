//! Base ledger: which sat ranges live in which UTXO.
//!
//! Each block mints its subsidy range; transaction outputs take sats from
//! their inputs first-in-first-out by value; whatever a non-coinbase
//! transaction leaves over is a fee and flows to the coinbase, which is
//! processed last. Sats a coinbase does not claim are lost.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use satindex_core::delta::{Lookup, PendingMap};
use satindex_core::error::IndexerError;
use satindex_core::ids::{AddressId, OutPoint, UtxoId};
use satindex_core::point_index::PointIndex;
use satindex_core::range::{take_front, total_size, Range};
use satindex_core::snapshot::SubIndexer;
use satindex_core::store::{get_json, require_json, KvOp, PersistentStore};
use satindex_core::types::{Block, Transaction};

use crate::keys;
use crate::sat::{is_known_duplicate, subsidy_range};

/// A live output and the sats it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoRecord {
    pub outpoint: OutPoint,
    pub value: u64,
    pub address: Option<AddressId>,
    pub ranges: Vec<Range>,
}

/// Per-block ledger summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: i64,
    /// Sats created as block subsidy.
    pub subsidy: Range,
    pub spent_utxos: u32,
    pub created_utxos: u32,
    pub spent_sats: i64,
    pub created_sats: i64,
    pub fees: i64,
    /// Sats that left circulation in this block.
    pub lost: Vec<Range>,
}

/// An output created by an applied transaction.
#[derive(Debug, Clone)]
pub struct CreatedOutput {
    pub id: UtxoId,
    pub vout: u32,
    pub value: u64,
    pub ranges: Vec<Range>,
}

/// What the ledger did with one transaction, handed to the asset
/// sub-indexers in processing order.
#[derive(Debug)]
pub struct AppliedTx<'a> {
    pub index: usize,
    pub tx: &'a Transaction,
    pub spent: Vec<UtxoId>,
    pub outputs: Vec<CreatedOutput>,
}

impl AppliedTx<'_> {
    /// First sat of the first output that holds any.
    pub fn first_sat(&self) -> Option<i64> {
        self.outputs
            .iter()
            .find_map(|o| o.ranges.first())
            .map(|r| r.start)
    }
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn PersistentStore>,
    /// First sat of every block → height. Rebuilt from block entries at load.
    first_sats: PointIndex<u64>,
    blocks: PendingMap<u64, BlockEntry>,
    utxos: PendingMap<UtxoId, UtxoRecord>,
    outpoints: PendingMap<String, UtxoId>,
    addresses: PendingMap<String, AddressId>,
    address_names: PendingMap<AddressId, String>,
    next_address: u64,
}

impl Ledger {
    pub async fn load(store: Arc<dyn PersistentStore>) -> Result<Self, IndexerError> {
        let mut first_sats = PointIndex::new();
        let prefix = keys::BLOCK.as_bytes();
        for (key, value) in store.iterate_prefix(prefix).await? {
            let Some(height) = keys::decode_u64(&key[prefix.len()..]) else {
                continue;
            };
            let entry: BlockEntry = serde_json::from_slice(&value)?;
            if !entry.subsidy.is_empty() {
                first_sats.put(entry.subsidy.start, height);
            }
        }
        let next_address = get_json(store.as_ref(), keys::NEXT_ADDRESS)
            .await?
            .unwrap_or(1);
        debug!(blocks = first_sats.len(), next_address, "ledger loaded");

        Ok(Self {
            store,
            first_sats,
            blocks: PendingMap::new(),
            utxos: PendingMap::new(),
            outpoints: PendingMap::new(),
            addresses: PendingMap::new(),
            address_names: PendingMap::new(),
            next_address,
        })
    }

    pub fn first_sats(&self) -> &PointIndex<u64> {
        &self.first_sats
    }

    /// Height of the block that mined `sat`, if that block was applied.
    pub fn sat_block(&self, sat: i64) -> Option<u64> {
        let (first, height) = self.first_sats.find_first_smaller(sat)?;
        let range = subsidy_range(*height);
        (sat < first + range.size).then_some(*height)
    }

    // ─── Block application ───────────────────────────────────────────────────

    /// Apply `block`, returning per-transaction results in processing order
    /// (non-coinbase first, coinbase last).
    pub async fn apply_block<'a>(
        &mut self,
        block: &'a Block,
    ) -> Result<Vec<AppliedTx<'a>>, IndexerError> {
        let height = block.height;
        let subsidy = subsidy_range(height);
        if !subsidy.is_empty() {
            self.first_sats.put(subsidy.start, height);
        }

        let mut entry = BlockEntry {
            height,
            hash: block.hash.clone(),
            prev_hash: block.prev_hash.clone(),
            timestamp: block.timestamp,
            subsidy,
            spent_utxos: 0,
            created_utxos: 0,
            spent_sats: 0,
            created_sats: 0,
            fees: 0,
            lost: Vec::new(),
        };
        if block.txs.is_empty() && !subsidy.is_empty() {
            entry.lost.push(subsidy);
        }

        let mut fees: Vec<Range> = Vec::new();
        let mut applied = Vec::with_capacity(block.txs.len());

        for (index, tx) in block.processing_order() {
            let coinbase = index == 0;
            let mut pool: VecDeque<Range> = VecDeque::new();
            let mut spent = Vec::with_capacity(tx.inputs.len());

            if coinbase {
                if !subsidy.is_empty() {
                    pool.push_back(subsidy);
                }
                pool.extend(fees.drain(..));
            } else {
                for outpoint in &tx.inputs {
                    let (id, record) = self.spend(outpoint).await?;
                    entry.spent_utxos += 1;
                    entry.spent_sats += record.value as i64;
                    pool.extend(record.ranges);
                    spent.push(id);
                }
            }

            let mut outputs = Vec::with_capacity(tx.outputs.len());
            for (vout, out) in tx.outputs.iter().enumerate() {
                let id = UtxoId::new(height, index as u64, vout as u64)?;
                let ranges = take_front(&mut pool, out.value as i64);
                let address = match &out.address {
                    Some(a) => Some(self.address_id(a).await?),
                    None => None,
                };
                let record = UtxoRecord {
                    outpoint: OutPoint::new(tx.txid.clone(), vout as u32),
                    value: out.value,
                    address,
                    ranges: ranges.clone(),
                };
                if coinbase {
                    entry.lost.extend(self.overwrite_duplicate(&record.outpoint, height).await?);
                }
                self.create(id, record);
                entry.created_utxos += 1;
                entry.created_sats += out.value as i64;
                outputs.push(CreatedOutput {
                    id,
                    vout: vout as u32,
                    value: out.value,
                    ranges,
                });
            }

            let leftover: Vec<Range> = pool.into_iter().collect();
            if coinbase {
                if !leftover.is_empty() {
                    debug!(height, sats = total_size(&leftover), "coinbase underpaid");
                }
                entry.lost.extend(leftover);
            } else {
                entry.fees += total_size(&leftover);
                fees.extend(leftover);
            }

            applied.push(AppliedTx {
                index,
                tx,
                spent,
                outputs,
            });
        }

        debug!(
            height,
            spent = entry.spent_utxos,
            created = entry.created_utxos,
            fees = entry.fees,
            "ledger applied block"
        );
        self.blocks.insert(height, entry);
        Ok(applied)
    }

    /// Resolve and remove a spent output. Every input of a valid block must
    /// resolve; a miss means the store is corrupt.
    async fn spend(&mut self, outpoint: &OutPoint) -> Result<(UtxoId, UtxoRecord), IndexerError> {
        let name = outpoint.to_string();
        let okey = keys::str_key(keys::OUTPOINT, &name);
        let id = match self.outpoints.lookup(&name) {
            Lookup::Present(id) => *id,
            Lookup::Deleted => return Err(IndexerError::missing_key(&okey)),
            Lookup::Unknown => require_json(self.store.as_ref(), &okey).await?,
        };
        let ukey = keys::utxo_key(keys::UTXO, id);
        let record = self
            .utxos
            .get_through(&id, self.store.as_ref(), &ukey)
            .await?
            .ok_or_else(|| IndexerError::missing_key(&ukey))?;

        self.utxos.remove(id);
        self.outpoints.remove(name);
        Ok((id, record))
    }

    fn create(&mut self, id: UtxoId, record: UtxoRecord) {
        self.outpoints.insert(record.outpoint.to_string(), id);
        self.utxos.insert(id, record);
    }

    /// A coinbase reusing the outpoint of a live output replaces it; the old
    /// output's sats are lost.
    async fn overwrite_duplicate(
        &mut self,
        outpoint: &OutPoint,
        height: u64,
    ) -> Result<Vec<Range>, IndexerError> {
        let Some((old_id, old)) = self.utxo_by_outpoint(outpoint).await? else {
            return Ok(Vec::new());
        };
        if is_known_duplicate(height) {
            info!(height, %outpoint, "duplicate coinbase overwrites earlier output");
        } else {
            warn!(height, %outpoint, "unexpected duplicate coinbase overwrites earlier output");
        }
        self.utxos.remove(old_id);
        Ok(old.ranges)
    }

    async fn address_id(&mut self, address: &str) -> Result<AddressId, IndexerError> {
        let name = address.to_string();
        let akey = keys::str_key(keys::ADDRESS, address);
        if let Some(id) = self
            .addresses
            .get_through(&name, self.store.as_ref(), &akey)
            .await?
        {
            return Ok(id);
        }
        let id = AddressId(self.next_address);
        self.next_address += 1;
        self.addresses.insert(name.clone(), id);
        self.address_names.insert(id, name);
        Ok(id)
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    pub async fn utxo(&self, id: UtxoId) -> Result<Option<UtxoRecord>, IndexerError> {
        self.utxos
            .get_through(&id, self.store.as_ref(), &keys::utxo_key(keys::UTXO, id))
            .await
    }

    pub async fn utxo_by_outpoint(
        &self,
        outpoint: &OutPoint,
    ) -> Result<Option<(UtxoId, UtxoRecord)>, IndexerError> {
        let name = outpoint.to_string();
        let okey = keys::str_key(keys::OUTPOINT, &name);
        let Some(id) = self
            .outpoints
            .get_through(&name, self.store.as_ref(), &okey)
            .await?
        else {
            return Ok(None);
        };
        Ok(self.utxo(id).await?.map(|record| (id, record)))
    }

    pub async fn address(&self, id: AddressId) -> Result<Option<String>, IndexerError> {
        self.address_names
            .get_through(&id, self.store.as_ref(), &keys::u64_key(keys::ADDRESS_ID, id.0))
            .await
    }

    pub async fn block_entry(&self, height: u64) -> Result<Option<BlockEntry>, IndexerError> {
        self.blocks
            .get_through(&height, self.store.as_ref(), &keys::u64_key(keys::BLOCK, height))
            .await
    }

    // ─── Delta ───────────────────────────────────────────────────────────────

    pub fn delta_ops(&self) -> Result<Vec<KvOp>, IndexerError> {
        let mut ops = self.blocks.to_ops(|h| keys::u64_key(keys::BLOCK, *h))?;
        ops.extend(self.utxos.to_ops(|id| keys::utxo_key(keys::UTXO, *id))?);
        ops.extend(self.outpoints.to_ops(|o| keys::str_key(keys::OUTPOINT, o))?);
        ops.extend(self.addresses.to_ops(|a| keys::str_key(keys::ADDRESS, a))?);
        ops.extend(
            self.address_names
                .to_ops(|id| keys::u64_key(keys::ADDRESS_ID, id.0))?,
        );
        ops.push(KvOp::put_json(keys::NEXT_ADDRESS.to_vec(), &self.next_address)?);
        Ok(ops)
    }

    pub fn delta_len(&self) -> usize {
        self.blocks.len()
            + self.utxos.len()
            + self.outpoints.len()
            + self.addresses.len()
            + self.address_names.len()
    }
}

#[async_trait]
impl SubIndexer for Ledger {
    fn name(&self) -> &'static str {
        "ledger"
    }

    fn clone_delta(&self) -> Self {
        Self {
            store: self.store.clone(),
            first_sats: PointIndex::new(),
            blocks: self.blocks.clone(),
            utxos: self.utxos.clone(),
            outpoints: self.outpoints.clone(),
            addresses: self.addresses.clone(),
            address_names: self.address_names.clone(),
            next_address: self.next_address,
        }
    }

    fn subtract(&mut self, backup: &Self) {
        self.blocks.subtract(&backup.blocks);
        self.utxos.subtract(&backup.utxos);
        self.outpoints.subtract(&backup.outpoints);
        self.addresses.subtract(&backup.addresses);
        self.address_names.subtract(&backup.address_names);
    }

    async fn update_db(&self) -> Result<(), IndexerError> {
        self.store.batch_write(self.delta_ops()?).await
    }

    /// Live sats plus lost sats must equal every sat ever mined.
    async fn check_consistency(&self) -> Result<bool, IndexerError> {
        let store = self.store.as_ref();
        let utxos = self
            .utxos
            .scan_through(store, keys::UTXO.as_bytes(), keys::decode_utxo)
            .await?;
        let blocks = self
            .blocks
            .scan_through(store, keys::BLOCK.as_bytes(), keys::decode_u64)
            .await?;

        let live: i64 = utxos.values().map(|u| total_size(&u.ranges)).sum();
        let lost: i64 = blocks.values().map(|b| total_size(&b.lost)).sum();
        let mined: i64 = blocks.values().map(|b| b.subsidy.size).sum();

        if live + lost != mined {
            error!(live, lost, mined, "ledger sat totals disagree");
            return Ok(false);
        }
        Ok(true)
    }
}
