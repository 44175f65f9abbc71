//! Sequential block application with a bounded prefetch pipeline.
//!
//! ```text
//!   prefetch task ──[bounded queue]──▶ SyncEngine ──▶ BlockProcessor
//!   (fetch + retry)                    (height/hash      (sub-indexers,
//!                                       checks)           coordinator)
//! ```
//!
//! The engine is the only writer of compiling state. The prefetch task only
//! exists while a sync round runs and blocks once the queue is full.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::source::{fetch_block_with_retry, BlockSource, RetryConfig};
use crate::types::Block;

/// Receives every block the engine accepts, in height order.
#[async_trait]
pub trait BlockProcessor: Send {
    /// Apply `block` to the compiling state.
    async fn process_block(&mut self, block: &Block) -> Result<(), IndexerError>;

    /// Called after `height` was applied when it falls on a check-period
    /// boundary.
    async fn on_checkpoint(&mut self, height: u64) -> Result<(), IndexerError>;
}

/// How a sync round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every block up to the target was applied.
    CaughtUp,
    /// The block at `height` does not build on the local tip; nothing at
    /// `height` was applied.
    Reorg { height: u64 },
    /// A stop request arrived.
    Cancelled,
}

impl SyncOutcome {
    /// Numeric form: `0` caught up, the reorg height, or `-1` cancelled.
    pub fn code(&self) -> i64 {
        match self {
            Self::CaughtUp => 0,
            Self::Reorg { height } => *height as i64,
            Self::Cancelled => -1,
        }
    }
}

/// Owns the compiling height and hash.
pub struct SyncEngine {
    source: Arc<dyn BlockSource>,
    last_height: Option<u64>,
    last_hash: Option<String>,
    prefetch_capacity: usize,
    check_period: u64,
    retry: RetryConfig,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn BlockSource>, config: &IndexerConfig) -> Self {
        Self {
            source,
            last_height: None,
            last_hash: None,
            prefetch_capacity: config.prefetch_capacity.max(1),
            check_period: config.check_period.max(1),
            retry: config.retry.clone(),
        }
    }

    /// Height of the last applied block.
    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    pub fn source(&self) -> &Arc<dyn BlockSource> {
        &self.source
    }

    /// Rewind to a known state (startup or reorg recovery).
    pub fn reset_to(&mut self, height: Option<u64>, hash: Option<String>) {
        self.last_height = height;
        self.last_hash = hash;
    }

    fn next_height(&self) -> u64 {
        self.last_height.map_or(0, |h| h + 1)
    }

    /// Apply blocks `last_height + 1 ..= target`.
    ///
    /// # Panics
    ///
    /// If the source hands back a block whose height differs from the one
    /// requested: the source is broken and no state derived from it can be
    /// trusted.
    pub async fn sync_to_height<P: BlockProcessor + ?Sized>(
        &mut self,
        target: u64,
        processor: &mut P,
        stop: &mut mpsc::Receiver<()>,
    ) -> Result<SyncOutcome, IndexerError> {
        let from = self.next_height();
        if from > target {
            return Ok(SyncOutcome::CaughtUp);
        }

        info!(from, target, "sync round started");
        let (mut prefetcher, mut rx) = Prefetcher::spawn(
            self.source.clone(),
            from,
            target,
            self.prefetch_capacity,
            self.retry.clone(),
        );

        let mut expected = from;
        while expected <= target {
            let item = tokio::select! {
                biased;
                Some(()) = stop.recv() => {
                    prefetcher.stop();
                    info!(height = expected, "sync round cancelled");
                    return Ok(SyncOutcome::Cancelled);
                }
                item = rx.recv() => item,
            };

            let block = match item {
                Some(Ok(block)) => block,
                Some(Err(e)) => {
                    prefetcher.stop();
                    return Err(e);
                }
                None => {
                    return Err(IndexerError::Aborted {
                        reason: format!("prefetcher exited before block {expected}"),
                    });
                }
            };

            if block.height != expected {
                error!(expected, got = block.height, "block source returned the wrong height");
                panic!(
                    "block source returned height {} while {expected} was requested",
                    block.height
                );
            }

            if let Some(last_hash) = &self.last_hash {
                if block.height > 0 && !block.extends(last_hash) {
                    prefetcher.stop();
                    warn!(
                        height = block.height,
                        local = %last_hash,
                        remote = %block.prev_hash,
                        "reorg detected"
                    );
                    return Ok(SyncOutcome::Reorg {
                        height: block.height,
                    });
                }
            }

            processor.process_block(&block).await?;
            self.last_height = Some(block.height);
            self.last_hash = Some(block.hash);
            debug!(height = expected, "block applied");

            if expected % self.check_period == 0 {
                processor.on_checkpoint(expected).await?;
            }
            expected += 1;
        }

        prefetcher.stop();
        info!(height = target, "sync round caught up");
        Ok(SyncOutcome::CaughtUp)
    }
}

// ─── Prefetch task ───────────────────────────────────────────────────────────

type Fetched = Result<Block, IndexerError>;

/// Handle to the prefetch task. Stopping (or dropping) it ends the task.
struct Prefetcher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Prefetcher {
    fn spawn(
        source: Arc<dyn BlockSource>,
        from: u64,
        to: u64,
        capacity: usize,
        retry: RetryConfig,
    ) -> (Self, mpsc::Receiver<Fetched>) {
        let (tx, rx) = mpsc::channel(capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let handle = tokio::spawn(async move {
            for height in from..=to {
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                let fetched = fetch_block_with_retry(source.as_ref(), height, &retry).await;
                let failed = fetched.is_err();
                if tx.send(fetched).await.is_err() || failed {
                    break;
                }
            }
            debug!(from, to, "prefetcher exited");
        });

        (Self { stop, handle }, rx)
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop();
    }
}
