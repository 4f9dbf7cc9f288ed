//! # Proxyhouse Dead-Letter Storage
//!
//! ## Purpose
//!
//! Durable holding area for batches the database refused. Each failure
//! becomes one shard file whose name carries its retry level, so a directory
//! listing alone is enough to decide what to retry next.
//!
//! ## Layout
//!
//! ```text
//! errors/
//!   11731000000000000001   level 1, retried first
//!   11731000000000000042
//!   21731000000000000007   level 2
//!   x1731000000000000099   terminal, left for an operator
//! ```
//!
//! ## What This Crate Contains
//! - `ShardId` / `ShardKind`: name encoding and ordering
//! - `ShardContents`, `write_shard`, `read_shard`: checksummed file format
//! - `DeadLetterStore`: persist, scan, read, remove
//!
//! Everything here is synchronous.

pub mod engine;
pub mod error;
pub mod shard;
pub mod store;

pub use engine::{read_shard, write_shard, ShardContents, SHARD_MAGIC};
pub use error::{Result, StorageError};
pub use shard::{ShardClock, ShardId, ShardKind, TERMINAL_MARKER};
pub use store::{DeadLetterStore, ShardCounts};
