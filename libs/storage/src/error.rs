//! Dead-letter storage errors

use std::path::PathBuf;
use thiserror::Error;

use crate::shard::ShardId;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Root directory absent at open; the proxy refuses to start
    #[error("Dead-letter root {path:?} does not exist or is not a directory")]
    RootMissing { path: PathBuf },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File does not start with the shard magic
    #[error("Shard {path:?} has an invalid header")]
    InvalidHeader { path: PathBuf },

    #[error("Shard {id} not found")]
    NotFound { id: ShardId },

    /// Key or value longer than a record length field can describe
    #[error("Record of {len} bytes is too large for a shard")]
    RecordTooLarge { len: usize },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
