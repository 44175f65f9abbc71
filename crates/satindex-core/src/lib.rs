//! satindex-core: the synchronization and state-durability engine.
//!
//! # Architecture
//!
//! ```text
//! BlockSource → SyncEngine ──▶ BlockProcessor (sub-indexers)
//!                   │               ├── RangeIntervalStore (sat range ownership)
//!                   │               └── PointIndex         (sat → block)
//!                   ├── SnapshotCoordinator (compiling → backup → persisted)
//!                   │        └── PersistentStore (memory / SQLite)
//!                   └── RpcSnapshot (read model for query callers)
//! ```

pub mod config;
pub mod delta;
pub mod error;
pub mod ids;
pub mod point_index;
pub mod range;
pub mod range_store;
pub mod rpc_snapshot;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod sync;
pub mod sync_state;
pub mod types;

pub use config::{IndexerConfig, IndexerState};
pub use delta::{Lookup, PendingMap};
pub use error::IndexerError;
pub use ids::{AddressId, OutPoint, UtxoId};
pub use point_index::PointIndex;
pub use range::Range;
pub use range_store::RangeIntervalStore;
pub use rpc_snapshot::RpcSnapshot;
pub use snapshot::{CommitAction, SnapshotCoordinator, SubIndexer};
pub use source::{BlockSource, MemoryBlockSource, RetryConfig};
pub use store::{KvOp, PersistentStore};
pub use sync::{BlockProcessor, SyncEngine, SyncOutcome};
pub use sync_state::SyncState;
pub use types::{Block, BlockSummary, Envelope, Transaction, TxOutput};
