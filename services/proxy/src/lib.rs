//! # Proxyhouse
//!
//! ## Purpose
//!
//! Write-buffering proxy in front of a ClickHouse HTTP interface. Many small
//! INSERT requests are coalesced per request target and flushed downstream
//! as larger batches on a fixed interval. Batches the database refuses are
//! kept on disk and retried with increasing severity until they are either
//! delivered or parked as terminal.
//!
//! ## Data Flow
//!
//! ```text
//! socket → FrameDemux → RequestClassifier → IngestBuffer
//!                                               │ (flush interval)
//!                                               ▼
//!                                         FlushScheduler → Forwarder → database
//!                                                              │ failure
//!                                                              ▼
//!                          RecoveryLoop ◀──────────────── DeadLetterStore
//! ```
//!
//! ## Delivery Guarantee
//!
//! At-least-once. A retried batch may reach the database twice. Data still
//! in the buffer when the process is killed without a graceful shutdown is
//! lost.

pub mod buffer;
pub mod classifier;
pub mod error;
pub mod forwarder;
pub mod key;
pub mod recovery;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod stats;
pub mod test_utils;

pub use buffer::{IngestBuffer, PendingBatch};
pub use classifier::{ClassifierSettings, RequestClassifier};
pub use error::{ForwardError, ProxyError};
pub use forwarder::{
    AddressPolicy, Downstream, DownstreamResponse, ForwardOutcome, Forwarder, HttpDownstream,
};
pub use key::BatchFormat;
pub use recovery::{RecoveryLoop, RecoveryReport};
pub use scheduler::{FlushReport, FlushScheduler};
pub use server::{ConnectionEnd, IngestServer};
pub use service::{ProxyService, RunningProxy};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use stats::{HealthStatus, HealthThresholds, ProxyStats, StatsSnapshot, StatusReport};
