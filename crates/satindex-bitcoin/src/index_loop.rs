//! The main index loop.
//!
//! Each round asks the source for its tip, syncs the compiling state up to
//! it (or to `to_height`), and reacts to the outcome:
//!
//! - caught up: publish a fresh read snapshot and wait `poll_interval_ms`
//! - reorg: throw away compiling state, reload from the store, resume from
//!   the persisted height
//! - cancelled: return
//!
//! Every applied block also runs through the [`SnapshotCoordinator`], which
//! keeps the store at least `block_history` blocks behind the tip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use satindex_core::config::{IndexerConfig, IndexerState};
use satindex_core::error::IndexerError;
use satindex_core::rpc_snapshot::RpcSnapshot;
use satindex_core::snapshot::{CommitAction, SnapshotCoordinator, SubIndexer};
use satindex_core::source::{chain_tip_with_retry, BlockSource};
use satindex_core::store::PersistentStore;
use satindex_core::sync::{BlockProcessor, SyncEngine, SyncOutcome};
use satindex_core::sync_state::ensure_db_version;
use satindex_core::types::Block;

use crate::query::ReadModel;
use crate::set::IndexerSet;

/// Applies blocks to the compiling set and drives commits and snapshots.
struct Compiler {
    set: IndexerSet,
    coordinator: SnapshotCoordinator<IndexerSet>,
    snapshot: Arc<RpcSnapshot<ReadModel>>,
    snapshot_interval: u64,
}

impl Compiler {
    fn height(&self) -> Option<u64> {
        self.set.sync_state().sync_height
    }

    /// Publish the compiling state unless it is already published.
    fn refresh_snapshot(&self) {
        let set = &self.set;
        self.snapshot
            .refresh_if_advanced(self.height(), || ReadModel::new(set.clone()));
    }
}

#[async_trait]
impl BlockProcessor for Compiler {
    async fn process_block(&mut self, block: &Block) -> Result<(), IndexerError> {
        self.set.apply_block(block).await
    }

    async fn on_checkpoint(&mut self, height: u64) -> Result<(), IndexerError> {
        match self.coordinator.step(&mut self.set, height).await? {
            // The store is about to receive this generation; readers must
            // already see it.
            CommitAction::BackupTaken { .. } | CommitAction::Flushed { .. } => {
                self.refresh_snapshot()
            }
            CommitAction::None => {
                if self.snapshot_interval > 0 && height % self.snapshot_interval == 0 {
                    self.refresh_snapshot();
                }
            }
        }
        Ok(())
    }
}

/// Stops a running [`IndexLoop`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: mpsc::Sender<()>,
    exited: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Request a stop and wait until the loop has returned.
    pub async fn shutdown(&self) {
        // A full channel means a stop is already queued.
        let _ = self.tx.try_send(());
        while !self.exited.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        debug!("index loop exited");
    }
}

pub struct IndexLoop {
    config: IndexerConfig,
    store: Arc<dyn PersistentStore>,
    engine: SyncEngine,
    compiler: Compiler,
    state: IndexerState,
    stop_rx: mpsc::Receiver<()>,
    exited: Arc<AtomicBool>,
}

impl IndexLoop {
    /// Open the loop on `store`, resuming from whatever it holds.
    pub async fn open(
        config: IndexerConfig,
        source: Arc<dyn BlockSource>,
        store: Arc<dyn PersistentStore>,
    ) -> Result<(Self, ShutdownHandle), IndexerError> {
        config.validate()?;
        ensure_db_version(store.as_ref()).await?;
        let set = IndexerSet::load(store.clone()).await?;
        let persisted = set.sync_state().sync_height;

        let mut engine = SyncEngine::new(source, &config);
        engine.reset_to(persisted, set.sync_state().sync_block_hash.clone());

        let snapshot = Arc::new(RpcSnapshot::new(persisted, ReadModel::new(set.clone())));
        let compiler = Compiler {
            coordinator: SnapshotCoordinator::new(config.block_history, persisted),
            snapshot_interval: config.snapshot_interval,
            snapshot,
            set,
        };

        let (tx, stop_rx) = mpsc::channel(1);
        let exited = Arc::new(AtomicBool::new(false));
        info!(
            chain = %config.chain,
            persisted = ?persisted,
            block_history = config.block_history,
            "index loop opened"
        );

        let handle = ShutdownHandle {
            tx,
            exited: exited.clone(),
        };
        Ok((
            Self {
                config,
                store,
                engine,
                compiler,
                state: IndexerState::Idle,
                stop_rx,
                exited,
            },
            handle,
        ))
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    /// Shared handle to the published read model.
    pub fn snapshot(&self) -> Arc<RpcSnapshot<ReadModel>> {
        self.compiler.snapshot.clone()
    }

    /// Height of the compiling state.
    pub fn compiling_height(&self) -> Option<u64> {
        self.engine.last_height()
    }

    /// Height whose state is in the store.
    pub fn persisted_height(&self) -> Option<u64> {
        self.compiler.coordinator.persisted_height()
    }

    /// Run every sub-indexer's self-audit against the compiling state.
    pub async fn check_consistency(&self) -> Result<bool, IndexerError> {
        self.compiler.set.check_consistency().await
    }

    /// Run until `to_height` is reached, a stop is requested, or a fatal
    /// error occurs.
    pub async fn run(&mut self) -> Result<(), IndexerError> {
        let result = self.run_inner().await;
        if let Err(e) = &result {
            self.state = IndexerState::Error;
            error!(error = %e, "index loop stopped");
        }
        self.exited.store(true, Ordering::Release);
        result
    }

    async fn run_inner(&mut self) -> Result<(), IndexerError> {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            match self.sync_round().await {
                Ok(SyncOutcome::CaughtUp) => {
                    if self.reached_target() {
                        info!(height = ?self.engine.last_height(), "target height reached");
                        return Ok(());
                    }
                }
                Ok(SyncOutcome::Reorg { .. }) => continue,
                Ok(SyncOutcome::Cancelled) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "sync round failed, will retry");
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                // `None` only means every handle was dropped; keep following.
                Some(()) = self.stop_rx.recv() => {
                    self.state = IndexerState::Cancelled;
                    info!("stop requested while idle");
                    return Ok(());
                }
            }
        }
    }

    fn reached_target(&self) -> bool {
        match (self.config.to_height, self.engine.last_height()) {
            (Some(to), Some(at)) => at >= to,
            _ => false,
        }
    }

    /// One sync round up to the current tip, including reorg recovery.
    pub async fn sync_round(&mut self) -> Result<SyncOutcome, IndexerError> {
        let tip = chain_tip_with_retry(self.engine.source().as_ref(), &self.config.retry).await?;
        self.compiler.set.set_chain_tip(tip);
        let target = self.config.to_height.map_or(tip, |to| to.min(tip));

        self.state = IndexerState::Syncing;
        let outcome = self
            .engine
            .sync_to_height(target, &mut self.compiler, &mut self.stop_rx)
            .await?;

        match outcome {
            SyncOutcome::CaughtUp => {
                self.compiler.refresh_snapshot();
                self.state = IndexerState::Idle;
            }
            SyncOutcome::Reorg { height } => self.recover(height).await?,
            SyncOutcome::Cancelled => self.state = IndexerState::Cancelled,
        }
        Ok(outcome)
    }

    /// Discard compiling state and resume from the store.
    async fn recover(&mut self, height: u64) -> Result<(), IndexerError> {
        self.state = IndexerState::ReorgRecovery;
        let persisted = self.compiler.coordinator.persisted_height();

        // Nothing unpersisted left to throw away: the fork is below the store.
        if self.engine.last_height() == persisted {
            return Err(IndexerError::UnrecoverableReorg {
                height,
                persisted: persisted.unwrap_or_default(),
            });
        }

        let mut set = IndexerSet::load(self.store.clone()).await?;
        set.sync_state_mut().record_reorg(height);
        set.sync_state().save(self.store.as_ref()).await?;

        let state = set.sync_state();
        warn!(
            reorg_height = height,
            discarded_from = ?self.engine.last_height(),
            resume_from = ?state.sync_height,
            "reorg recovery: compiling state discarded"
        );
        self.engine
            .reset_to(state.sync_height, state.sync_block_hash.clone());
        self.compiler.coordinator.reset(state.sync_height);
        self.compiler
            .snapshot
            .publish(state.sync_height, ReadModel::new(set.clone()));
        self.compiler.set = set;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_chain::TestChain;
    use satindex_core::ids::OutPoint;
    use satindex_core::source::MemoryBlockSource;
    use satindex_core::sync_state::SyncState;
    use satindex_storage::MemoryStore;

    fn config() -> IndexerConfig {
        IndexerConfig {
            block_history: 2,
            poll_interval_ms: 5,
            prefetch_capacity: 3,
            ..Default::default()
        }
    }

    /// Ten blocks; block 2 carries an inscription, block 9 spends it.
    fn chain_a() -> TestChain {
        let mut chain = TestChain::new("a");
        chain.mine_empty(2);
        let mut ins = chain.tx(vec![chain.coinbase(0)], &[(5_000_000_000, "alice")]);
        ins.envelopes.push(TestChain::envelope(&[("content_type", "text/plain")]));
        let ins_txid = ins.txid.clone();
        chain.mine(vec![ins]);
        chain.mine_empty(6);
        let send = chain.tx(vec![OutPoint::new(ins_txid, 0)], &[(5_000_000_000, "bob")]);
        chain.mine(vec![send]);
        chain
    }

    async fn open(
        source: &Arc<MemoryBlockSource>,
        store: &Arc<MemoryStore>,
        config: IndexerConfig,
    ) -> (IndexLoop, ShutdownHandle) {
        IndexLoop::open(config, source.clone(), store.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn syncs_to_tip_and_keeps_store_behind() {
        let chain = chain_a();
        let source = Arc::new(MemoryBlockSource::new(chain.blocks.clone()));
        let store = Arc::new(MemoryStore::new());
        let (mut lp, _handle) = open(&source, &store, IndexerConfig { to_height: Some(9), ..config() }).await;

        lp.run().await.unwrap();
        assert_eq!(lp.state(), IndexerState::Idle);
        assert_eq!(lp.compiling_height(), Some(9));

        // Backups at 1, 3, 5, 7, 9; each flushed two blocks later.
        assert_eq!(lp.persisted_height(), Some(7));
        let persisted = SyncState::load(store.as_ref()).await.unwrap();
        assert_eq!(persisted.sync_height, Some(7));
        assert_eq!(persisted.sync_block_hash.as_deref(), Some("a7"));
        assert_eq!(persisted.chain_tip, 9);

        let snapshot = lp.snapshot();
        assert_eq!(snapshot.height(), Some(9));
        let model = snapshot.load();
        let ins = model.inscription(0).await.unwrap().unwrap();
        assert_eq!(ins.location.unwrap().txid, "atx1");
        assert!(lp.check_consistency().await.unwrap());
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_height() {
        let chain = chain_a();
        let source = Arc::new(MemoryBlockSource::new(chain.blocks.clone()));
        let store = Arc::new(MemoryStore::new());
        {
            let (mut lp, _) = open(&source, &store, config()).await;
            assert_eq!(lp.sync_round().await.unwrap(), SyncOutcome::CaughtUp);
        }

        let (mut lp, _) = open(&source, &store, config()).await;
        assert_eq!(lp.compiling_height(), Some(7));
        assert_eq!(lp.snapshot().height(), Some(7));
        let fetched = source.fetch_count();
        assert_eq!(lp.sync_round().await.unwrap(), SyncOutcome::CaughtUp);
        assert_eq!(source.fetch_count() - fetched, 2);
        assert_eq!(lp.snapshot().height(), Some(9));
        assert!(lp.check_consistency().await.unwrap());
    }

    #[tokio::test]
    async fn shallow_reorg_replays_from_store() {
        let chain = chain_a();
        let source = Arc::new(MemoryBlockSource::new(chain.blocks.clone()));
        let store = Arc::new(MemoryStore::new());
        let (mut lp, _) = open(&source, &store, config()).await;
        assert_eq!(lp.sync_round().await.unwrap(), SyncOutcome::CaughtUp);

        // Replace blocks 8 and 9; the spend in block 9 disappears.
        let mut fork = chain.fork(8, "b");
        fork.mine_empty(4);
        source.replace_from(8, fork.blocks[8..].to_vec());

        assert_eq!(lp.sync_round().await.unwrap(), SyncOutcome::Reorg { height: 10 });
        assert_eq!(lp.compiling_height(), Some(7));
        assert_eq!(lp.persisted_height(), Some(7));
        assert_eq!(lp.snapshot().height(), Some(7));
        assert_eq!(SyncState::load(store.as_ref()).await.unwrap().reorgs_detected, vec![10]);

        assert_eq!(lp.sync_round().await.unwrap(), SyncOutcome::CaughtUp);
        assert_eq!(lp.compiling_height(), Some(11));
        let model = lp.snapshot().load();
        assert_eq!(model.block(9).await.unwrap().unwrap().hash, "b9");
        let ins = model.inscription(0).await.unwrap().unwrap();
        assert_eq!(ins.location.unwrap().txid, "atx0");
        assert!(lp.check_consistency().await.unwrap());
    }

    #[tokio::test]
    async fn reorg_below_store_is_fatal() {
        let chain = chain_a();
        let source = Arc::new(MemoryBlockSource::new(chain.blocks.clone()));
        let store = Arc::new(MemoryStore::new());
        let (mut lp, _) = open(&source, &store, config()).await;
        assert_eq!(lp.sync_round().await.unwrap(), SyncOutcome::CaughtUp);

        let mut fork = chain.fork(5, "c");
        fork.mine_empty(8);
        source.replace_from(5, fork.blocks[5..].to_vec());

        assert_eq!(lp.sync_round().await.unwrap(), SyncOutcome::Reorg { height: 10 });
        let err = lp.run().await.unwrap_err();
        assert!(matches!(
            err,
            IndexerError::UnrecoverableReorg { height: 8, persisted: 7 }
        ));
        assert!(err.is_fatal());
        assert_eq!(lp.state(), IndexerState::Error);
    }

    #[tokio::test]
    async fn shutdown_stops_a_following_loop() {
        let chain = chain_a();
        let source = Arc::new(MemoryBlockSource::new(chain.blocks.clone()));
        let store = Arc::new(MemoryStore::new());
        let (mut lp, handle) = open(&source, &store, config()).await;
        let snapshot = lp.snapshot();

        let task = tokio::spawn(async move {
            let result = lp.run().await;
            (result, lp.state())
        });
        while snapshot.height() != Some(9) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.shutdown().await;
        let (result, state) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state, IndexerState::Cancelled);
    }

    #[tokio::test]
    async fn transient_source_errors_are_retried() {
        let chain = chain_a();
        let source = Arc::new(MemoryBlockSource::new(chain.blocks.clone()));
        let store = Arc::new(MemoryStore::new());
        let retry = satindex_core::source::RetryConfig {
            max_attempts: 1,
            base_delay_ms: 1,
        };
        let (mut lp, _) = open(
            &source,
            &store,
            IndexerConfig { to_height: Some(9), retry, ..config() },
        )
        .await;

        source.fail_next(2);
        lp.run().await.unwrap();
        assert_eq!(lp.compiling_height(), Some(9));
    }

    #[tokio::test]
    async fn dropped_handle_keeps_following() {
        let chain = chain_a();
        let source = Arc::new(MemoryBlockSource::new(chain.blocks[..5].to_vec()));
        let store = Arc::new(MemoryStore::new());
        let (mut lp, handle) = open(&source, &store, IndexerConfig { to_height: Some(9), ..config() }).await;
        drop(handle);

        let task = tokio::spawn(async move {
            let result = lp.run().await;
            (result, lp.state(), lp.compiling_height())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        for block in &chain.blocks[5..] {
            source.push(block.clone());
        }

        let (result, state, height) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state, IndexerState::Idle);
        assert_eq!(height, Some(9));
    }

    /// Serves blocks below `stall_at`; fetches at or above it never finish.
    struct StallingSource {
        inner: MemoryBlockSource,
        stall_at: u64,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl BlockSource for StallingSource {
        async fn fetch_block(&self, height: u64) -> Result<Block, IndexerError> {
            if height >= self.stall_at {
                self.stalled.store(true, Ordering::Release);
                std::future::pending::<()>().await;
            }
            self.inner.fetch_block(height).await
        }

        async fn chain_tip(&self) -> Result<u64, IndexerError> {
            self.inner.chain_tip().await
        }
    }

    #[tokio::test]
    async fn shutdown_cancels_an_active_sync_round() {
        let source = Arc::new(StallingSource {
            inner: MemoryBlockSource::new(chain_a().blocks),
            stall_at: 5,
            stalled: AtomicBool::new(false),
        });
        let store = Arc::new(MemoryStore::new());
        let (mut lp, handle) = IndexLoop::open(config(), source.clone(), store.clone())
            .await
            .unwrap();

        let task = tokio::spawn(async move {
            let result = lp.run().await;
            (result, lp.state(), lp.compiling_height())
        });
        while !source.stalled.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.shutdown().await;
        let (result, state, height) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state, IndexerState::Cancelled);
        assert!(height.map_or(true, |h| h < 5), "applied past the stall: {height:?}");
    }

    #[tokio::test]
    async fn check_period_spaces_out_commits() {
        let chain = chain_a();
        let source = Arc::new(MemoryBlockSource::new(chain.blocks.clone()));
        let store = Arc::new(MemoryStore::new());
        let config = IndexerConfig {
            block_history: 4,
            check_period: 2,
            to_height: Some(9),
            ..config()
        };
        let (mut lp, _) = open(&source, &store, config.clone()).await;
        lp.run().await.unwrap();

        // Steps run at 0, 2, 4, 6, 8: backup at 4, flushed at 8.
        assert_eq!(lp.compiling_height(), Some(9));
        assert_eq!(lp.persisted_height(), Some(4));
        let persisted = SyncState::load(store.as_ref()).await.unwrap();
        assert_eq!(persisted.sync_block_hash.as_deref(), Some("a4"));
        assert_eq!(lp.snapshot().height(), Some(9));
        assert!(lp.check_consistency().await.unwrap());

        let (lp, _) = open(&source, &store, config).await;
        assert_eq!(lp.compiling_height(), Some(4));
    }
}
