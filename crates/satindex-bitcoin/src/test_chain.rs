//! Synthetic chains for tests.

use std::collections::HashMap;

use satindex_core::ids::OutPoint;
use satindex_core::types::{Block, Envelope, Transaction, TxOutput};

use crate::sat::subsidy;

/// Builds a valid chain block by block, paying fees to each coinbase.
#[derive(Clone)]
pub(crate) struct TestChain {
    pub blocks: Vec<Block>,
    values: HashMap<OutPoint, u64>,
    tag: String,
    next_tx: u64,
}

impl TestChain {
    pub fn new(tag: &str) -> Self {
        Self {
            blocks: Vec::new(),
            values: HashMap::new(),
            tag: tag.into(),
            next_tx: 0,
        }
    }

    pub fn tip(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    pub fn coinbase(&self, height: u64) -> OutPoint {
        OutPoint::new(self.blocks[height as usize].txs[0].txid.clone(), 0)
    }

    pub fn tx(&mut self, inputs: Vec<OutPoint>, outputs: &[(u64, &str)]) -> Transaction {
        let txid = format!("{}tx{}", self.tag, self.next_tx);
        self.next_tx += 1;
        Transaction {
            txid,
            inputs,
            outputs: outputs
                .iter()
                .map(|(value, addr)| TxOutput {
                    value: *value,
                    address: Some(addr.to_string()),
                })
                .collect(),
            envelopes: Vec::new(),
        }
    }

    pub fn envelope(fields: &[(&str, &str)]) -> Envelope {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn mine(&mut self, txs: Vec<Transaction>) -> &Block {
        let height = self.blocks.len() as u64;
        let fees: u64 = txs.iter().map(|tx| self.fee(tx)).sum();
        self.mine_paying(txs, subsidy(height) as u64 + fees)
    }

    /// Mine with an explicit coinbase value (underpaying loses sats).
    pub fn mine_paying(&mut self, txs: Vec<Transaction>, coinbase_value: u64) -> &Block {
        let height = self.blocks.len() as u64;
        let coinbase = Transaction {
            txid: format!("{}cb{height}", self.tag),
            inputs: Vec::new(),
            outputs: vec![TxOutput {
                value: coinbase_value,
                address: Some("miner".into()),
            }],
            envelopes: Vec::new(),
        };
        let mut all = vec![coinbase];
        all.extend(txs);
        self.push(all)
    }

    /// Append a block with exactly `txs` (index 0 is the coinbase).
    pub fn push(&mut self, txs: Vec<Transaction>) -> &Block {
        let height = self.blocks.len() as u64;
        for tx in &txs {
            for input in &tx.inputs {
                self.values.remove(input);
            }
            for (vout, out) in tx.outputs.iter().enumerate() {
                self.values.insert(OutPoint::new(tx.txid.clone(), vout as u32), out.value);
            }
        }
        let block = Block {
            height,
            hash: format!("{}{height}", self.tag),
            prev_hash: self.blocks.last().map(|b| b.hash.clone()).unwrap_or_default(),
            timestamp: height as i64 * 600,
            txs,
        };
        self.blocks.push(block);
        self.blocks.last().unwrap()
    }

    pub fn mine_empty(&mut self, count: u64) {
        for _ in 0..count {
            self.mine(Vec::new());
        }
    }

    /// A competing chain sharing blocks below `height`.
    pub fn fork(&self, height: u64, tag: &str) -> TestChain {
        let mut fork = self.clone();
        fork.blocks.truncate(height as usize);
        fork.tag = tag.into();
        fork
    }

    fn fee(&self, tx: &Transaction) -> u64 {
        let input: u64 = tx.inputs.iter().filter_map(|i| self.values.get(i)).sum();
        input - tx.output_value()
    }
}
