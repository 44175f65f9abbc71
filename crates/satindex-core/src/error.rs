//! Error types for the satindex pipeline.

use thiserror::Error;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Block source error: {0}")]
    Source(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Required key missing from store: {key}")]
    MissingKey { key: String },

    #[error("Database version mismatch: code expects {expected}, store has {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("Unrecoverable reorg at block {height}: persisted tip {persisted} is no longer canonical")]
    UnrecoverableReorg { height: u64, persisted: u64 },

    #[error("{what} value {value} does not fit the surrogate id layout")]
    IdOverflow { what: &'static str, value: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` for errors that indicate corruption or a deployment
    /// mistake. The index loop stops instead of retrying on these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingKey { .. }
                | Self::VersionMismatch { .. }
                | Self::UnrecoverableReorg { .. }
                | Self::IdOverflow { .. }
                | Self::InvalidConfig(_)
        )
    }

    /// Returns `true` if the error came from the block source and the sync
    /// round can simply be retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Source(_))
    }

    pub fn missing_key(key: impl AsRef<[u8]>) -> Self {
        Self::MissingKey {
            key: String::from_utf8_lossy(key.as_ref()).into_owned(),
        }
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
