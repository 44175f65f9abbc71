//! Block source contract and retry policy.
//!
//! The source (RPC client + block decoder) lives outside this crate. It is
//! not expected to retry on its own; callers wrap it with [`fetch_block_with_retry`].

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::IndexerError;
use crate::types::Block;

#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch the decoded block at `height`.
    async fn fetch_block(&self, height: u64) -> Result<Block, IndexerError>;

    /// Height of the current chain tip.
    async fn chain_tip(&self) -> Result<u64, IndexerError>;
}

// ─── Retry ───────────────────────────────────────────────────────────────────

/// Linear backoff: the n-th retry waits `n * base_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay unit in milliseconds.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        Some(Duration::from_millis(self.base_delay_ms * attempt as u64))
    }
}

/// Fetch a block, retrying failures with linearly increasing backoff.
pub async fn fetch_block_with_retry(
    source: &dyn BlockSource,
    height: u64,
    retry: &RetryConfig,
) -> Result<Block, IndexerError> {
    let mut attempt = 0;
    loop {
        match source.fetch_block(height).await {
            Ok(block) => return Ok(block),
            Err(e) => {
                attempt += 1;
                let Some(delay) = retry.next_delay(attempt) else {
                    return Err(e);
                };
                warn!(height, attempt, delay_ms = delay.as_millis() as u64, error = %e, "block fetch failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Fetch the chain tip with the same retry policy.
pub async fn chain_tip_with_retry(
    source: &dyn BlockSource,
    retry: &RetryConfig,
) -> Result<u64, IndexerError> {
    let mut attempt = 0;
    loop {
        match source.chain_tip().await {
            Ok(tip) => return Ok(tip),
            Err(e) => {
                attempt += 1;
                let Some(delay) = retry.next_delay(attempt) else {
                    return Err(e);
                };
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "chain tip query failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ─── In-memory source (for testing) ──────────────────────────────────────────

/// A chain held in memory. Blocks can be replaced to simulate reorgs and
/// failures injected to exercise retries.
#[derive(Default)]
pub struct MemoryBlockSource {
    chain: RwLock<Vec<Block>>,
    failures: RwLock<u32>,
    fetches: RwLock<u64>,
}

impl MemoryBlockSource {
    /// `blocks[i]` must be the block at height `i`.
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            chain: RwLock::new(blocks),
            ..Default::default()
        }
    }

    pub fn push(&self, block: Block) {
        self.chain.write().push(block);
    }

    /// Drop every block at `height` and above, then append `blocks`.
    pub fn replace_from(&self, height: u64, blocks: Vec<Block>) {
        let mut chain = self.chain.write();
        chain.truncate(height as usize);
        chain.extend(blocks);
    }

    /// Make the next `n` fetches fail with a source error.
    pub fn fail_next(&self, n: u32) {
        *self.failures.write() = n;
    }

    /// Number of successful block fetches so far.
    pub fn fetch_count(&self) -> u64 {
        *self.fetches.read()
    }

    pub fn block(&self, height: u64) -> Option<Block> {
        self.chain.read().get(height as usize).cloned()
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn fetch_block(&self, height: u64) -> Result<Block, IndexerError> {
        {
            let mut failures = self.failures.write();
            if *failures > 0 {
                *failures -= 1;
                return Err(IndexerError::Source(format!("injected failure at {height}")));
            }
        }
        let block = self
            .chain
            .read()
            .get(height as usize)
            .cloned()
            .ok_or_else(|| IndexerError::Source(format!("block {height} not found")))?;
        *self.fetches.write() += 1;
        Ok(block)
    }

    async fn chain_tip(&self) -> Result<u64, IndexerError> {
        let len = self.chain.read().len() as u64;
        if len == 0 {
            return Err(IndexerError::Source("empty chain".into()));
        }
        Ok(len - 1)
    }
}
