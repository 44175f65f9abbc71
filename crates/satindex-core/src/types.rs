//! Shared block and transaction types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::OutPoint;

// ─── Block ───────────────────────────────────────────────────────────────────

/// A decoded block as supplied by the block source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    /// Hash of the block at `height - 1`. Ignored for the genesis block.
    pub prev_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
    /// Transactions in block order; index 0 is the coinbase.
    pub txs: Vec<Transaction>,
}

impl Block {
    /// Returns `true` if `self` directly builds on a block with `parent_hash`.
    pub fn extends(&self, parent_hash: &str) -> bool {
        self.prev_hash == parent_hash
    }

    /// Non-coinbase transactions first, then the coinbase, each paired with
    /// its index in the block.
    ///
    /// Inputs spent in a block must be resolved before any output of the same
    /// block is treated as a fresh recipient, and the coinbase collects the
    /// fees of all the others.
    pub fn processing_order(&self) -> impl Iterator<Item = (usize, &Transaction)> {
        self.txs
            .iter()
            .enumerate()
            .skip(1)
            .chain(self.txs.iter().enumerate().take(1))
    }

    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            height: self.height,
            hash: self.hash.clone(),
            prev_hash: self.prev_hash.clone(),
            timestamp: self.timestamp,
            tx_count: self.txs.len() as u32,
        }
    }
}

/// Minimal block header info for logs and the read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: i64,
    pub tx_count: u32,
}

// ─── Transaction ─────────────────────────────────────────────────────────────

/// Field map produced by the external inscription-envelope parser.
pub type Envelope = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    /// Spent outpoints. Empty for the coinbase.
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOutput>,
    /// Parsed inscription envelopes carried in the witness, in order.
    #[serde(default)]
    pub envelopes: Vec<Envelope>,
}

impl Transaction {
    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in sats.
    pub value: u64,
    /// Decoded address, if the script has one.
    pub address: Option<String>,
}
