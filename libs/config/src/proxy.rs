//! Proxy configuration sections
//!
//! Every section deserializes with `#[serde(default)]`, so a TOML file only
//! needs the fields it changes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Complete proxy configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub forward: ForwardConfig,
    pub buffer: BufferConfig,
    pub flush: FlushConfig,
    pub recovery: RecoveryConfig,
    pub dead_letter: DeadLetterConfig,
    pub status: StatusConfig,
    pub telemetry: TelemetryConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
}

/// Ingestion listener settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenConfig {
    pub bind_address: String,
    pub port: u16,
    /// Additional unix domain socket listener
    pub unix_socket: Option<PathBuf>,
    /// Idle read timeout per connection, 0 disables it
    pub max_connections_idle_seconds: u64,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8124,
            unix_socket: None,
            max_connections_idle_seconds: 10,
            max_header_bytes: 64 * 1024,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ListenConfig {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.max_connections_idle_seconds > 0)
            .then(|| Duration::from_secs(self.max_connections_idle_seconds))
    }
}

/// Downstream database settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ForwardConfig {
    /// Base URL of the database HTTP interface
    pub address: String,
    /// Substring of the batching key replaced by `address`
    pub key_substitution: Option<String>,
    pub timeout_seconds: u64,
    /// Only this status counts as delivered
    pub success_status: u16,
    pub pool_idle_timeout_seconds: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:8123".to_string(),
            key_substitution: None,
            timeout_seconds: 30,
            success_status: 200,
            pool_idle_timeout_seconds: 90,
        }
    }
}

impl ForwardConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_seconds)
    }
}

/// Ingest buffer settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// Inserted between appended payloads of non line-oriented formats
    pub row_delimiter: String,
    /// Initial capacity of a new per-key batch
    pub preallocation_size: usize,
    /// Reject POSTs whose query is not an INSERT statement
    pub require_insert_query: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            row_delimiter: ",".to_string(),
            preallocation_size: 64 * 1024,
            require_insert_query: true,
        }
    }
}

/// Flush scheduler settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FlushConfig {
    pub interval_seconds: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 2,
        }
    }
}

impl FlushConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Recovery loop settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Recovery runs every `interval_steps` flush intervals
    pub interval_steps: u32,
    /// Pause between two shards of one pass
    pub shard_delay_ms: u64,
    /// Level at which a shard becomes terminal (1..=9)
    pub retry_severity_ceiling: u8,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_steps: 30,
            shard_delay_ms: 200,
            retry_severity_ceiling: 5,
        }
    }
}

impl RecoveryConfig {
    pub fn shard_delay(&self) -> Duration {
        Duration::from_millis(self.shard_delay_ms)
    }
}

/// Dead-letter storage settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Must exist before startup
    pub root: PathBuf,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("errors"),
        }
    }
}

/// Status endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    pub path: String,
    /// Pending shard count at which health becomes degraded
    pub warning_shards: u64,
    /// Pending shard count at which health becomes unhealthy
    pub critical_shards: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            path: "/status".to_string(),
            warning_shards: 10,
            critical_shards: 100,
        }
    }
}

/// Graphite metrics settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Metrics are discarded when unset
    pub graphite_host: Option<String>,
    pub graphite_port: u16,
    pub prefix: String,
    pub flush_interval_seconds: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            graphite_host: None,
            graphite_port: 2023,
            prefix: "proxyhouse".to_string(),
            flush_interval_seconds: 2,
        }
    }
}

impl TelemetryConfig {
    pub fn graphite_addr(&self) -> Option<String> {
        self.graphite_host
            .as_ref()
            .map(|host| format!("{}:{}", host, self.graphite_port))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_seconds: 10 }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ProxyConfig {
    /// Interval between two recovery passes
    pub fn recovery_interval(&self) -> Duration {
        self.flush
            .interval()
            .saturating_mul(self.recovery.interval_steps)
    }
}
