//! Indexer configuration and state types.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::source::RetryConfig;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Chain to index (e.g. `"bitcoin"`, `"testnet4"`).
    pub chain: String,
    /// Blocks the persisted state must lag behind the compiling tip (`H`).
    /// Reorgs up to this depth are recovered by replaying from the store.
    pub block_history: u64,
    /// Blocks between snapshot-coordinator invocations.
    pub check_period: u64,
    /// Blocks the prefetcher may hold ahead of the consumer.
    pub prefetch_capacity: usize,
    /// Polling interval once caught up (milliseconds).
    pub poll_interval_ms: u64,
    /// Blocks between read-snapshot refreshes while syncing.
    pub snapshot_interval: u64,
    /// Optional stop height. `None` = follow the tip forever.
    pub to_height: Option<u64>,
    /// Retry policy for block-source calls.
    pub retry: RetryConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain: "bitcoin".into(),
            block_history: 6,
            check_period: 1,
            prefetch_capacity: 12,
            poll_interval_ms: 10_000,
            snapshot_interval: 100,
            to_height: None,
            retry: RetryConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// Reject settings the commit cadence cannot honour.
    ///
    /// The coordinator only runs every `check_period` blocks, so the store
    /// stays within `2 * block_history` of the tip only when the period
    /// divides the history.
    pub fn validate(&self) -> Result<(), IndexerError> {
        let history = self.block_history.max(1);
        let period = self.check_period.max(1);
        if history % period != 0 {
            return Err(IndexerError::InvalidConfig(format!(
                "check_period {period} does not divide block_history {history}"
            )));
        }
        Ok(())
    }
}

/// Runtime state of the index loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Caught up, waiting for the next poll.
    Idle,
    /// Applying blocks.
    Syncing,
    /// Discarding compiling state after a reorg.
    ReorgRecovery,
    /// Stop requested and honoured.
    Cancelled,
    /// Encountered an unrecoverable error.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Error => write!(f, "error"),
        }
    }
}
