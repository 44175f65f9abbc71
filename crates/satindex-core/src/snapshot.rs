//! Height-delayed, dual-buffer commits shared by every sub-indexer.
//!
//! Three generations exist at any time:
//!
//! ```text
//!   persisted ──(≥ H blocks)── backup ──(≥ 0 blocks)── compiling
//! ```
//!
//! When the compiling state is `H` blocks past the persisted height, the
//! coordinator clones its delta into a backup. When the backup itself is `H`
//! blocks old, the backup is flushed, the compiling delta drops what the
//! backup held, and a fresh backup is taken. The store therefore only ever holds
//! state at least `H` blocks behind the tip, and a reorg shallower than that
//! is handled by discarding memory and replaying from the store.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::IndexerError;

/// Contract every sub-indexer implements.
#[async_trait]
pub trait SubIndexer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// New instance sharing the store handle and holding a copy of only the
    /// not-yet-persisted delta.
    fn clone_delta(&self) -> Self
    where
        Self: Sized;

    /// Drop from `self` exactly the delta `backup` captured.
    fn subtract(&mut self, backup: &Self)
    where
        Self: Sized;

    /// Write the delta to the store in one batch. The delta is left in
    /// place, and a failed write leaves the store untouched.
    async fn update_db(&self) -> Result<(), IndexerError>;

    /// Expensive self-audit; never called per block.
    async fn check_consistency(&self) -> Result<bool, IndexerError>;
}

/// Blocks applied on top of the persisted state.
pub fn unpersisted_blocks(compiling: u64, persisted: Option<u64>) -> u64 {
    match persisted {
        Some(p) => compiling.saturating_sub(p),
        None => compiling + 1,
    }
}

struct Backup<T> {
    height: u64,
    state: T,
}

/// What a coordinator step did, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    /// Too soon, or waiting for the backup to age.
    None,
    /// A backup generation was cloned at this height.
    BackupTaken { height: u64 },
    /// The backup at `persisted` was flushed and a new backup taken at `backup`.
    Flushed { persisted: u64, backup: u64 },
}

/// Drives the clone → subtract → flush cycle.
pub struct SnapshotCoordinator<T> {
    block_history: u64,
    persisted: Option<u64>,
    backup: Option<Backup<T>>,
}

impl<T: SubIndexer> SnapshotCoordinator<T> {
    /// `block_history` is the `H` above; `persisted` the height already in
    /// the store.
    pub fn new(block_history: u64, persisted: Option<u64>) -> Self {
        Self {
            block_history: block_history.max(1),
            persisted,
            backup: None,
        }
    }

    pub fn persisted_height(&self) -> Option<u64> {
        self.persisted
    }

    pub fn backup_height(&self) -> Option<u64> {
        self.backup.as_ref().map(|b| b.height)
    }

    pub fn block_history(&self) -> u64 {
        self.block_history
    }

    /// Forget any backup and restart from `persisted` (reorg recovery).
    pub fn reset(&mut self, persisted: Option<u64>) {
        self.persisted = persisted;
        self.backup = None;
    }

    /// Run one coordinator step for the compiling state at `height`.
    pub async fn step(
        &mut self,
        compiling: &mut T,
        height: u64,
    ) -> Result<CommitAction, IndexerError> {
        let h = self.block_history;
        let behind = unpersisted_blocks(height, self.persisted);
        if behind < h {
            return Ok(CommitAction::None);
        }

        let Some(backup) = self.backup.as_ref() else {
            self.take_backup(compiling, height);
            return Ok(CommitAction::BackupTaken { height });
        };

        if height.saturating_sub(backup.height) < h {
            debug!(height, backup = backup.height, "backup still ageing");
            return Ok(CommitAction::None);
        }

        // A failed write keeps the backup and the compiling delta intact, so
        // the next step retries the same generation.
        backup.state.update_db().await?;
        let Some(backup) = self.backup.take() else {
            return Ok(CommitAction::None);
        };
        compiling.subtract(&backup.state);
        self.persisted = Some(backup.height);
        info!(
            persisted = backup.height,
            compiling = height,
            indexer = backup.state.name(),
            "flushed backup generation"
        );

        self.take_backup(compiling, height);
        Ok(CommitAction::Flushed {
            persisted: backup.height,
            backup: height,
        })
    }

    fn take_backup(&mut self, compiling: &T, height: u64) {
        debug!(height, indexer = compiling.name(), "taking backup generation");
        self.backup = Some(Backup {
            height,
            state: compiling.clone_delta(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;

    /// Records one entry per block; flushing moves the entries to a shared log.
    struct Recorder {
        pending: Vec<u64>,
        flushed: Arc<Mutex<Vec<u64>>>,
        /// Writes left to reject before the store recovers.
        failures: Arc<Mutex<u32>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                pending: Vec::new(),
                flushed: Arc::new(Mutex::new(Vec::new())),
                failures: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl SubIndexer for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        fn clone_delta(&self) -> Self {
            Self {
                pending: self.pending.clone(),
                flushed: self.flushed.clone(),
                failures: self.failures.clone(),
            }
        }
        fn subtract(&mut self, backup: &Self) {
            self.pending.drain(..backup.pending.len());
        }
        async fn update_db(&self) -> Result<(), IndexerError> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(IndexerError::Storage("disk full".into()));
            }
            self.flushed.lock().extend(self.pending.iter().copied());
            Ok(())
        }
        async fn check_consistency(&self) -> Result<bool, IndexerError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn twenty_blocks_with_history_six() {
        let mut compiling = Recorder::new();
        let mut coord = SnapshotCoordinator::new(6, Some(0));
        let mut actions = Vec::new();

        for height in 1..=20u64 {
            compiling.pending.push(height);
            let action = coord.step(&mut compiling, height).await.unwrap();
            let persisted = coord.persisted_height().unwrap();
            assert!(height - persisted <= 12, "lag {} at {height}", height - persisted);
            actions.push((height, action, persisted));
        }

        for (height, action, persisted) in &actions {
            match height {
                1..=5 => assert_eq!(*action, CommitAction::None),
                6 => assert_eq!(*action, CommitAction::BackupTaken { height: 6 }),
                7..=11 | 13..=17 | 19..=20 => assert_eq!(*action, CommitAction::None),
                12 => assert_eq!(*action, CommitAction::Flushed { persisted: 6, backup: 12 }),
                18 => assert_eq!(*action, CommitAction::Flushed { persisted: 12, backup: 18 }),
                _ => unreachable!(),
            }
            let expected = match height {
                1..=11 => 0,
                12..=17 => 6,
                _ => 12,
            };
            assert_eq!(*persisted, expected, "persisted at {height}");
        }

        assert_eq!(*compiling.flushed.lock(), (1..=12).collect::<Vec<_>>());
        assert_eq!(compiling.pending, (13..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn two_h_blocks_advance_by_exactly_h() {
        for h in [1u64, 3, 6, 10] {
            let p = 100;
            let mut compiling = Recorder::new();
            let mut coord = SnapshotCoordinator::new(h, Some(p));
            for height in p + 1..=p + 2 * h {
                compiling.pending.push(height);
                coord.step(&mut compiling, height).await.unwrap();
                assert!(height - coord.persisted_height().unwrap() <= 2 * h);
            }
            assert_eq!(coord.persisted_height(), Some(p + h), "h = {h}");
        }
    }

    #[tokio::test]
    async fn fresh_store_counts_genesis() {
        let mut compiling = Recorder::new();
        let mut coord = SnapshotCoordinator::new(3, None);
        for height in 0..=5u64 {
            compiling.pending.push(height);
            coord.step(&mut compiling, height).await.unwrap();
        }
        assert_eq!(coord.backup_height(), Some(5));
        assert_eq!(coord.persisted_height(), Some(2));
        assert_eq!(*compiling.flushed.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn reset_discards_backup() {
        let mut compiling = Recorder::new();
        let mut coord = SnapshotCoordinator::new(2, Some(0));
        for height in 1..=3u64 {
            compiling.pending.push(height);
            coord.step(&mut compiling, height).await.unwrap();
        }
        assert_eq!(coord.backup_height(), Some(2));
        coord.reset(Some(0));
        assert_eq!(coord.backup_height(), None);
        assert!(compiling.flushed.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_flush_is_retried_without_losing_blocks() {
        let mut compiling = Recorder::new();
        let mut coord = SnapshotCoordinator::new(2, Some(0));
        for height in 1..=3u64 {
            compiling.pending.push(height);
            coord.step(&mut compiling, height).await.unwrap();
        }
        assert_eq!(coord.backup_height(), Some(2));

        *compiling.failures.lock() = 1;
        compiling.pending.push(4);
        assert!(coord.step(&mut compiling, 4).await.is_err());
        assert_eq!(coord.persisted_height(), Some(0));
        assert_eq!(coord.backup_height(), Some(2));
        assert_eq!(compiling.pending, vec![1, 2, 3, 4]);

        for height in 5..=7u64 {
            compiling.pending.push(height);
            let action = coord.step(&mut compiling, height).await.unwrap();
            if height == 5 {
                assert_eq!(action, CommitAction::Flushed { persisted: 2, backup: 5 });
            }
        }
        assert_eq!(coord.persisted_height(), Some(5));
        assert_eq!(*compiling.flushed.lock(), vec![1, 2, 3, 4, 5]);
        assert_eq!(compiling.pending, vec![6, 7]);
    }

    #[test]
    fn unpersisted_counts() {
        assert_eq!(unpersisted_blocks(10, Some(4)), 6);
        assert_eq!(unpersisted_blocks(0, None), 1);
        assert_eq!(unpersisted_blocks(3, Some(3)), 0);
    }
}
