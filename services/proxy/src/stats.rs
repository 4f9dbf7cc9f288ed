//! Process-wide counters and the status report
//!
//! Counters are plain atomics updated from connection tasks and background
//! loops. The status report is a snapshot serialized as JSON for the status
//! path; its health is derived from the number of dead-letter shards still
//! waiting for retry.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use storage::{ShardCounts, ShardKind};

/// Service health status levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Retry backlog below the warning threshold
    Healthy,
    /// Backlog at or above the warning threshold, still accepting writes
    Degraded,
    /// Backlog at or above the critical threshold
    Unhealthy,
}

impl HealthStatus {
    /// HTTP status returned on the status path
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Healthy => 200,
            Self::Degraded => 500,
            Self::Unhealthy => 503,
        }
    }
}

/// Shard counts at which health degrades
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub warning_shards: u64,
    pub critical_shards: u64,
}

impl HealthThresholds {
    pub fn evaluate(&self, pending_shards: u64) -> HealthStatus {
        if pending_shards >= self.critical_shards {
            HealthStatus::Unhealthy
        } else if pending_shards >= self.warning_shards {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug)]
pub struct ProxyStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    forwarded: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    recovered: AtomicU64,
    recovery_cycles: AtomicU64,
    total_connections: AtomicU64,
    current_connections: AtomicU64,
    pending_shards: AtomicU64,
    terminal_shards: AtomicU64,
    last_error: RwLock<Option<String>>,
    started: Instant,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub malformed: u64,
    pub forwarded: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub recovered: u64,
    pub recovery_cycles: u64,
    pub total_connections: u64,
    pub current_connections: u64,
    pub pending_shards: u64,
    pub terminal_shards: u64,
}

/// Body of the status response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub last_error: Option<String>,
    pub counters: StatsSnapshot,
}

impl StatusReport {
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec())
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            recovery_cycles: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            current_connections: AtomicU64::new(0),
            pending_shards: AtomicU64::new(0),
            terminal_shards: AtomicU64::new(0),
            last_error: RwLock::new(None),
            started: Instant::now(),
        }
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self, batches: u64) {
        self.forwarded.fetch_add(batches, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovered(&self) {
        self.recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, message: impl Into<String>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(message.into());
    }

    /// A new shard appeared on disk
    pub fn record_dead_lettered(&self, kind: ShardKind) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        match kind {
            ShardKind::Terminal => self.terminal_shards.fetch_add(1, Ordering::Relaxed),
            ShardKind::Retryable(_) => self.pending_shards.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_dropped(&self, message: impl Into<String>) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(message.into());
    }

    /// A retryable shard was drained and deleted
    pub fn record_shard_removed(&self) {
        let _ = self
            .pending_shards
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn record_recovery_cycle(&self) {
        self.recovery_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Replace the shard gauges with counts read from disk
    pub fn set_shard_counts(&self, counts: ShardCounts) {
        self.pending_shards.store(counts.retryable, Ordering::Relaxed);
        self.terminal_shards.store(counts.terminal, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.current_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .current_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn pending_shards(&self) -> u64 {
        self.pending_shards.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            recovery_cycles: self.recovery_cycles.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            current_connections: self.current_connections.load(Ordering::Relaxed),
            pending_shards: self.pending_shards.load(Ordering::Relaxed),
            terminal_shards: self.terminal_shards.load(Ordering::Relaxed),
        }
    }

    pub fn status_report(&self, thresholds: &HealthThresholds) -> StatusReport {
        let counters = self.snapshot();
        StatusReport {
            status: thresholds.evaluate(counters.pending_shards),
            uptime_seconds: self.started.elapsed().as_secs(),
            last_error: self.last_error(),
            counters,
        }
    }
}
