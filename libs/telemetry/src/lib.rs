//! # Proxyhouse Telemetry
//!
//! Counter-style metrics emitted by the proxy. Components record through the
//! [`Telemetry`] trait; the binary decides whether totals go to Graphite or
//! nowhere.
//!
//! ## Metric Names
//!
//! | name | meaning |
//! |---|---|
//! | `receive` | write request accepted into the buffer |
//! | `error400` | request rejected |
//! | `send` | batch delivered downstream |
//! | `error` | batch delivery failed |
//! | `value` | rows delivered |
//! | `dead_letter` | batch persisted for retry |
//! | `recovered` | dead-letter record delivered on retry |
//! | `bytes_to_milliseconds` | derived throughput of successful sends |

use std::fmt::Debug;

pub mod aggregator;
pub mod graphite;
pub mod test_utils;

pub use aggregator::MetricAggregator;
pub use graphite::{format_line, GraphiteTelemetry};

/// Metric names shared by every component
pub mod names {
    pub const RECEIVE: &str = "receive";
    pub const ERROR_400: &str = "error400";
    pub const SEND: &str = "send";
    pub const ERROR: &str = "error";
    pub const ROWS: &str = "value";
    pub const DEAD_LETTER: &str = "dead_letter";
    pub const DROPPED: &str = "dropped";
    pub const RECOVERED: &str = "recovered";
    pub const BYTES_SENT: &str = "bytes_sent";
    pub const SEND_DURATION_MS: &str = "send_duration_ms";
    pub const BYTES_TO_MILLISECONDS: &str = "bytes_to_milliseconds";
}

/// Destination for counters
pub trait Telemetry: Send + Sync + Debug {
    /// Add one to `name`
    fn increment(&self, name: &str);

    /// Add `value` to `name`
    fn update(&self, name: &str, value: u64);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn increment(&self, _name: &str) {}

    fn update(&self, _name: &str, _value: u64) {}
}
