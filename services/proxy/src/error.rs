//! Service-level errors
//!
//! Per-request problems are answered on the wire and never surface here;
//! per-batch problems stay inside the forwarder as [`crate::ForwardOutcome`].
//! What remains are startup and listener failures.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Dead-letter root must exist before the proxy accepts traffic
    #[error("Dead-letter directory {path:?} is missing; create it before starting")]
    StartupStorageMissing { path: PathBuf },

    #[error("Dead-letter storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build downstream client: {0}")]
    Client(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why one downstream request did not count as delivered
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

impl ProxyError {
    pub fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for ForwardError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}
