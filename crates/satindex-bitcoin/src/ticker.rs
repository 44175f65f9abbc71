//! Fungible-ticker sub-indexer.
//!
//! A `deploy` envelope creates a ticker with a per-mint limit and a total
//! supply. A `mint` envelope binds `amt` sats at the front of the first
//! output to the ticker. The balance of an output is the number of its sats
//! that carry the ticker.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use satindex_core::delta::PendingMap;
use satindex_core::error::IndexerError;
use satindex_core::ids::UtxoId;
use satindex_core::range::take_front;
use satindex_core::snapshot::SubIndexer;
use satindex_core::store::{KvOp, PersistentStore};
use satindex_core::types::Envelope;

use crate::holders::AssetBook;
use crate::keys;
use crate::ledger::AppliedTx;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerInfo {
    pub tick: String,
    /// Largest amount a single mint may bind.
    pub lim: u64,
    /// Total supply.
    pub max: u64,
    pub minted: u64,
    pub deploy_height: u64,
    pub deploy_txid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TickerOp {
    Deploy { tick: String, lim: u64, max: u64 },
    Mint { tick: String, amt: u64 },
}

fn parse_op(envelope: &Envelope) -> Option<TickerOp> {
    let tick = envelope.get("tick")?.trim().to_lowercase();
    if tick.is_empty() {
        return None;
    }
    let number = |k: &str| envelope.get(k)?.trim().parse::<u64>().ok();
    match envelope.get("op")?.as_str() {
        "deploy" => Some(TickerOp::Deploy {
            tick,
            lim: number("lim")?,
            max: number("max")?,
        }),
        "mint" => Some(TickerOp::Mint {
            tick,
            amt: number("amt")?,
        }),
        _ => None,
    }
}

#[derive(Clone)]
pub struct TickerIndexer {
    store: Arc<dyn PersistentStore>,
    book: AssetBook<String>,
    tickers: PendingMap<String, TickerInfo>,
}

impl TickerIndexer {
    pub async fn load(store: Arc<dyn PersistentStore>) -> Result<Self, IndexerError> {
        Ok(Self {
            book: AssetBook::load(store.clone(), keys::TICKER_BOOK).await?,
            store,
            tickers: PendingMap::new(),
        })
    }

    pub async fn on_tx(&mut self, tx: &AppliedTx<'_>, height: u64) -> Result<(), IndexerError> {
        for id in &tx.spent {
            self.book.spend(*id).await?;
        }
        for envelope in &tx.tx.envelopes {
            match parse_op(envelope) {
                Some(TickerOp::Deploy { tick, lim, max }) => {
                    self.deploy(tx, height, tick, lim, max).await?
                }
                Some(TickerOp::Mint { tick, amt }) => self.mint(tx, tick, amt).await?,
                None => {}
            }
        }
        for output in &tx.outputs {
            self.book.place(output);
        }
        Ok(())
    }

    async fn deploy(
        &mut self,
        tx: &AppliedTx<'_>,
        height: u64,
        tick: String,
        lim: u64,
        max: u64,
    ) -> Result<(), IndexerError> {
        if lim == 0 || max == 0 || lim > max {
            debug!(%tick, lim, max, "deploy rejected: bad limits");
            return Ok(());
        }
        if self.ticker(&tick).await?.is_some() {
            debug!(%tick, "deploy rejected: ticker exists");
            return Ok(());
        }
        info!(%tick, lim, max, height, "ticker deployed");
        self.tickers.insert(
            tick.clone(),
            TickerInfo {
                tick,
                lim,
                max,
                minted: 0,
                deploy_height: height,
                deploy_txid: tx.tx.txid.clone(),
            },
        );
        Ok(())
    }

    async fn mint(&mut self, tx: &AppliedTx<'_>, tick: String, amt: u64) -> Result<(), IndexerError> {
        let Some(mut info) = self.ticker(&tick).await? else {
            debug!(%tick, "mint rejected: unknown ticker");
            return Ok(());
        };
        let over_max = info.minted.checked_add(amt).map_or(true, |total| total > info.max);
        if amt == 0 || amt > info.lim || over_max {
            debug!(%tick, amt, minted = info.minted, "mint rejected: over limit");
            return Ok(());
        }
        let Some(first) = tx.outputs.first().filter(|o| o.value >= amt) else {
            debug!(%tick, amt, "mint rejected: first output too small");
            return Ok(());
        };

        let mut pool: VecDeque<_> = first.ranges.iter().copied().collect();
        let pieces = take_front(&mut pool, amt as i64);
        if pieces.iter().any(|r| self.book.carries(r, &tick)) {
            debug!(%tick, "mint rejected: sats already carry ticker");
            return Ok(());
        }
        for piece in pieces {
            self.book.bind(piece, tick.clone());
        }
        info.minted += amt;
        debug!(%tick, amt, minted = info.minted, "ticker minted");
        self.tickers.insert(tick, info);
        Ok(())
    }

    pub async fn ticker(&self, tick: &str) -> Result<Option<TickerInfo>, IndexerError> {
        let tick = tick.to_lowercase();
        let key = keys::str_key(keys::TICKER, &tick);
        self.tickers
            .get_through(&tick, self.store.as_ref(), &key)
            .await
    }

    /// Sats of `tick` held by an output.
    pub async fn balance(&self, id: UtxoId, tick: &str) -> Result<u64, IndexerError> {
        let tick = tick.to_lowercase();
        let held = self.book.holdings(id).await?;
        Ok(held
            .iter()
            .filter(|h| h.tags.contains(&tick))
            .map(|h| h.range.size as u64)
            .sum())
    }

    pub fn delta_ops(&self) -> Result<Vec<KvOp>, IndexerError> {
        let mut ops = self.tickers.to_ops(|t| keys::str_key(keys::TICKER, t))?;
        ops.extend(self.book.delta_ops()?);
        Ok(ops)
    }

    pub fn delta_len(&self) -> usize {
        self.tickers.len() + self.book.delta_len()
    }
}

#[async_trait]
impl SubIndexer for TickerIndexer {
    fn name(&self) -> &'static str {
        "ticker"
    }

    fn clone_delta(&self) -> Self {
        Self {
            store: self.store.clone(),
            book: self.book.clone_delta(),
            tickers: self.tickers.clone(),
        }
    }

    fn subtract(&mut self, backup: &Self) {
        self.tickers.subtract(&backup.tickers);
        self.book.subtract(&backup.book);
    }

    async fn update_db(&self) -> Result<(), IndexerError> {
        self.store.batch_write(self.delta_ops()?).await
    }

    /// Every ticker's minted total must equal the sats bound to it.
    async fn check_consistency(&self) -> Result<bool, IndexerError> {
        let tickers = self
            .tickers
            .scan_through(self.store.as_ref(), keys::TICKER.as_bytes(), keys::decode_str)
            .await?;
        for (tick, info) in &tickers {
            let bound = self.book.bound_size(tick);
            if bound != info.minted as i64 {
                error!(%tick, minted = info.minted, bound, "ticker supply mismatch");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
