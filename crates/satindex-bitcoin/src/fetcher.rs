//! Bitcoin Core block fetcher.
//!
//! Uses `getblockcount`, `getblockhash` and `getblock <hash> 2` through a
//! [`BitcoinRpcClient`] and decodes the verbose JSON into a [`Block`].
//! Envelope extraction is pluggable via [`EnvelopeParser`].

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use satindex_core::error::IndexerError;
use satindex_core::ids::OutPoint;
use satindex_core::source::BlockSource;
use satindex_core::types::{Block, Envelope, Transaction, TxOutput};

use crate::sat::COIN;

/// Trait for talking to a Bitcoin Core compatible JSON-RPC endpoint.
#[async_trait]
pub trait BitcoinRpcClient: Send + Sync {
    async fn get_block_count(&self) -> Result<u64, IndexerError>;
    async fn get_block_hash(&self, height: u64) -> Result<String, IndexerError>;
    /// `getblock <hash> 2`: the block with fully decoded transactions.
    async fn get_block(&self, hash: &str) -> Result<Value, IndexerError>;
}

/// Pulls envelopes out of a decoded transaction.
pub trait EnvelopeParser: Send + Sync {
    fn envelopes(&self, tx: &Value) -> Vec<Envelope>;
}

/// Parser that finds nothing; only the sat ledger is indexed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnvelopes;

impl EnvelopeParser for NoEnvelopes {
    fn envelopes(&self, _tx: &Value) -> Vec<Envelope> {
        Vec::new()
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("block is missing `{0}`")]
    MissingField(&'static str),
    #[error("tx {txid}: {reason}")]
    BadTransaction { txid: String, reason: String },
    #[error("block height {got} does not match requested {expected}")]
    HeightMismatch { expected: u64, got: u64 },
}

impl From<DecodeError> for IndexerError {
    fn from(e: DecodeError) -> Self {
        IndexerError::Codec(e.to_string())
    }
}

/// [`BlockSource`] backed by a Bitcoin Core node.
pub struct BitcoinFetcher<C, P = NoEnvelopes> {
    client: C,
    parser: P,
}

impl<C: BitcoinRpcClient> BitcoinFetcher<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            parser: NoEnvelopes,
        }
    }
}

impl<C: BitcoinRpcClient, P: EnvelopeParser> BitcoinFetcher<C, P> {
    pub fn with_parser<Q: EnvelopeParser>(self, parser: Q) -> BitcoinFetcher<C, Q> {
        BitcoinFetcher {
            client: self.client,
            parser,
        }
    }
}

#[async_trait]
impl<C: BitcoinRpcClient, P: EnvelopeParser> BlockSource for BitcoinFetcher<C, P> {
    async fn fetch_block(&self, height: u64) -> Result<Block, IndexerError> {
        let hash = self.client.get_block_hash(height).await?;
        let json = self.client.get_block(&hash).await?;
        let block = block_from_json(&json, &self.parser)?;
        if block.height != height {
            return Err(DecodeError::HeightMismatch {
                expected: height,
                got: block.height,
            }
            .into());
        }
        trace!(height, txs = block.txs.len(), "block decoded");
        Ok(block)
    }

    async fn chain_tip(&self) -> Result<u64, IndexerError> {
        self.client.get_block_count().await
    }
}

/// BTC amount as printed by Bitcoin Core to sats.
pub fn btc_to_sats(btc: f64) -> u64 {
    (btc * COIN as f64).round() as u64
}

/// Decode a verbosity-2 `getblock` response.
pub fn block_from_json(v: &Value, parser: &dyn EnvelopeParser) -> Result<Block, DecodeError> {
    let height = v["height"].as_u64().ok_or(DecodeError::MissingField("height"))?;
    let hash = v["hash"].as_str().ok_or(DecodeError::MissingField("hash"))?;
    let txs = v["tx"].as_array().ok_or(DecodeError::MissingField("tx"))?;

    Ok(Block {
        height,
        hash: hash.to_string(),
        // Genesis has no parent.
        prev_hash: v["previousblockhash"].as_str().unwrap_or_default().to_string(),
        timestamp: v["time"].as_i64().unwrap_or(0),
        txs: txs
            .iter()
            .map(|tx| tx_from_json(tx, parser))
            .collect::<Result<_, _>>()?,
    })
}

fn tx_from_json(v: &Value, parser: &dyn EnvelopeParser) -> Result<Transaction, DecodeError> {
    let txid = v["txid"].as_str().ok_or(DecodeError::MissingField("txid"))?;
    let bad = |reason: &str| DecodeError::BadTransaction {
        txid: txid.to_string(),
        reason: reason.to_string(),
    };

    let mut inputs = Vec::new();
    for vin in v["vin"].as_array().ok_or_else(|| bad("missing vin"))? {
        if vin.get("coinbase").is_some() {
            continue;
        }
        let prev = vin["txid"].as_str().ok_or_else(|| bad("input without txid"))?;
        let vout = vin["vout"].as_u64().ok_or_else(|| bad("input without vout"))?;
        inputs.push(OutPoint::new(prev, vout as u32));
    }

    let mut outputs = Vec::new();
    for vout in v["vout"].as_array().ok_or_else(|| bad("missing vout"))? {
        let value = vout["value"].as_f64().ok_or_else(|| bad("output without value"))?;
        let script = &vout["scriptPubKey"];
        let address = script["address"]
            .as_str()
            .or_else(|| script["addresses"][0].as_str())
            .map(str::to_string);
        outputs.push(TxOutput {
            value: btc_to_sats(value),
            address,
        });
    }

    Ok(Transaction {
        txid: txid.to_string(),
        inputs,
        outputs,
        envelopes: parser.envelopes(v),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct FixedNode {
        blocks: HashMap<String, Value>,
        hashes: Vec<String>,
    }

    #[async_trait]
    impl BitcoinRpcClient for FixedNode {
        async fn get_block_count(&self) -> Result<u64, IndexerError> {
            Ok(self.hashes.len() as u64 - 1)
        }
        async fn get_block_hash(&self, height: u64) -> Result<String, IndexerError> {
            self.hashes
                .get(height as usize)
                .cloned()
                .ok_or_else(|| IndexerError::Source(format!("no block at {height}")))
        }
        async fn get_block(&self, hash: &str) -> Result<Value, IndexerError> {
            self.blocks
                .get(hash)
                .cloned()
                .ok_or_else(|| IndexerError::Source(format!("unknown block {hash}")))
        }
    }

    /// Reads `{"envelopes": [...]}` test annotations.
    struct Annotated;

    impl EnvelopeParser for Annotated {
        fn envelopes(&self, tx: &Value) -> Vec<Envelope> {
            serde_json::from_value(tx["envelopes"].clone()).unwrap_or_default()
        }
    }

    fn block_one() -> Value {
        json!({
            "hash": "00b1",
            "height": 1,
            "previousblockhash": "00b0",
            "time": 1231469665,
            "tx": [
                {
                    "txid": "cb1",
                    "vin": [{ "coinbase": "04ffff001d0104" }],
                    "vout": [{ "value": 50.0, "n": 0, "scriptPubKey": { "address": "1miner" } }]
                },
                {
                    "txid": "t1",
                    "vin": [{ "txid": "cb0", "vout": 0 }],
                    "vout": [
                        { "value": 0.1, "n": 0, "scriptPubKey": { "address": "1alice" } },
                        { "value": 0.00000546, "n": 1, "scriptPubKey": { "type": "nulldata" } }
                    ],
                    "envelopes": [{ "content_type": "text/plain" }]
                }
            ]
        })
    }

    #[test]
    fn decodes_verbose_block() {
        let block = block_from_json(&block_one(), &Annotated).unwrap();
        assert_eq!(block.height, 1);
        assert_eq!(block.prev_hash, "00b0");
        assert!(block.txs[0].inputs.is_empty());
        assert_eq!(block.txs[0].outputs[0].value, 5_000_000_000);
        assert_eq!(block.txs[1].inputs, vec![OutPoint::new("cb0", 0)]);
        assert_eq!(block.txs[1].outputs[0].value, 10_000_000);
        assert_eq!(block.txs[1].outputs[1].value, 546);
        assert_eq!(block.txs[1].outputs[1].address, None);
        assert_eq!(block.txs[1].envelopes.len(), 1);

        let plain = block_from_json(&block_one(), &NoEnvelopes).unwrap();
        assert!(plain.txs[1].envelopes.is_empty());
    }

    #[test]
    fn rejects_malformed_input() {
        let mut v = block_one();
        v["tx"][1]["vin"][0] = json!({ "vout": 0 });
        let err = block_from_json(&v, &NoEnvelopes).unwrap_err();
        assert!(matches!(err, DecodeError::BadTransaction { .. }));
        assert!(matches!(IndexerError::from(err), IndexerError::Codec(_)));
    }

    #[tokio::test]
    async fn fetcher_serves_blocks_by_height() {
        let mut genesis = block_one();
        genesis["height"] = json!(0);
        genesis["hash"] = json!("00b0");
        genesis.as_object_mut().unwrap().remove("previousblockhash");

        let node = FixedNode {
            blocks: HashMap::from([("00b0".to_string(), genesis), ("00b1".to_string(), block_one())]),
            hashes: vec!["00b0".into(), "00b1".into()],
        };
        let fetcher = BitcoinFetcher::new(node).with_parser(Annotated);
        assert_eq!(fetcher.chain_tip().await.unwrap(), 1);
        let b0 = fetcher.fetch_block(0).await.unwrap();
        assert_eq!(b0.prev_hash, "");
        let b1 = fetcher.fetch_block(1).await.unwrap();
        assert!(b1.extends(&b0.hash));
        assert!(fetcher.fetch_block(2).await.unwrap_err().is_transient());
    }
}
