//! Fluent builder API for creating Bitcoin indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use satindex_bitcoin::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .chain("testnet4")
//!     .block_history(12)
//!     .prefetch_capacity(32)
//!     .to_height(50_000)
//!     .build_config();
//! ```

use std::sync::Arc;

use satindex_core::config::IndexerConfig;
use satindex_core::error::IndexerError;
use satindex_core::source::{BlockSource, RetryConfig};
use satindex_core::store::PersistentStore;
use satindex_storage::MemoryStore;

use crate::index_loop::{IndexLoop, ShutdownHandle};

/// Fluent builder for `IndexerConfig`.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Start from an existing configuration (e.g. loaded from a file).
    pub fn from_config(config: IndexerConfig) -> Self {
        Self { config }
    }

    /// Set the chain label used in logs.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Set how many blocks the store lags behind the tip.
    pub fn block_history(mut self, blocks: u64) -> Self {
        self.config.block_history = blocks;
        self
    }

    /// Set the snapshot-coordinator period (every N blocks).
    pub fn check_period(mut self, blocks: u64) -> Self {
        self.config.check_period = blocks;
        self
    }

    /// Set how many blocks may be fetched ahead of the compiler.
    pub fn prefetch_capacity(mut self, blocks: usize) -> Self {
        self.config.prefetch_capacity = blocks;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set the read-snapshot refresh period while syncing.
    pub fn snapshot_interval(mut self, blocks: u64) -> Self {
        self.config.snapshot_interval = blocks;
        self
    }

    /// Stop once this height is applied.
    pub fn to_height(mut self, height: u64) -> Self {
        self.config.to_height = Some(height);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Open an index loop on `store`.
    pub async fn open(
        self,
        source: Arc<dyn BlockSource>,
        store: Arc<dyn PersistentStore>,
    ) -> Result<(IndexLoop, ShutdownHandle), IndexerError> {
        IndexLoop::open(self.config, source, store).await
    }

    /// Open an index loop on a fresh in-memory store.
    pub async fn open_in_memory(
        self,
        source: Arc<dyn BlockSource>,
    ) -> Result<(IndexLoop, ShutdownHandle), IndexerError> {
        self.open(source, Arc::new(MemoryStore::new())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_chain::TestChain;
    use satindex_core::source::MemoryBlockSource;

    #[test]
    fn builder_defaults() {
        let cfg = IndexerBuilder::new().build_config();
        assert_eq!(cfg.chain, "bitcoin");
        assert_eq!(cfg.block_history, 6);
        assert_eq!(cfg.check_period, 1);
        assert_eq!(cfg.to_height, None);
    }

    #[test]
    fn builder_custom() {
        let cfg = IndexerBuilder::new()
            .chain("signet")
            .block_history(4)
            .check_period(2)
            .prefetch_capacity(64)
            .snapshot_interval(10)
            .to_height(1_000)
            .build_config();

        assert_eq!(cfg.chain, "signet");
        assert_eq!(cfg.block_history, 4);
        assert_eq!(cfg.check_period, 2);
        assert_eq!(cfg.prefetch_capacity, 64);
        assert_eq!(cfg.snapshot_interval, 10);
        assert_eq!(cfg.to_height, Some(1_000));
        assert!(cfg.validate().is_ok());
    }

    #[tokio::test]
    async fn open_rejects_uneven_check_period() {
        let source = Arc::new(MemoryBlockSource::new(Vec::new()));
        let err = IndexerBuilder::new()
            .block_history(6)
            .check_period(4)
            .open_in_memory(source)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IndexerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn opens_in_memory_loop() {
        let mut chain = TestChain::new("a");
        chain.mine_empty(4);
        let source = Arc::new(MemoryBlockSource::new(chain.blocks.clone()));
        let (mut lp, _) = IndexerBuilder::new()
            .block_history(1)
            .to_height(3)
            .open_in_memory(source)
            .await
            .unwrap();
        lp.run().await.unwrap();
        assert_eq!(lp.snapshot().height(), Some(3));
        assert_eq!(lp.persisted_height(), Some(2));
    }
}
