//! Recovery Loop
//!
//! Retries dead-lettered batches. One pass lists retryable shards in
//! (level, age) order and resends every record of a shard with the shard's
//! level, so a failure lands one level higher. The shard is deleted once all
//! its records have an outcome, unless one of them could not be persisted
//! again; then it stays for the next pass.
//!
//! A pass runs once before the listener opens and then every
//! `flush interval * recovery.interval_steps`.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use storage::{DeadLetterStore, ShardContents, ShardId, StorageError};
use telemetry::{names, Telemetry};

use crate::forwarder::{ForwardOutcome, Forwarder};
use crate::shutdown::ShutdownSignal;
use crate::stats::ProxyStats;

/// Counts from one recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub shards: usize,
    pub records: usize,
    pub delivered: usize,
    pub escalated: usize,
    pub dropped: usize,
    /// Shards left on disk after the pass
    pub kept: usize,
}

#[derive(Debug, Clone)]
pub struct RecoveryLoop {
    store: Arc<DeadLetterStore>,
    forwarder: Arc<Forwarder>,
    stats: Arc<ProxyStats>,
    telemetry: Arc<dyn Telemetry>,
    interval: Duration,
    shard_delay: Duration,
    shutdown: ShutdownSignal,
}

impl RecoveryLoop {
    pub fn new(
        store: Arc<DeadLetterStore>,
        forwarder: Arc<Forwarder>,
        stats: Arc<ProxyStats>,
        telemetry: Arc<dyn Telemetry>,
        interval: Duration,
        shard_delay: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            store,
            forwarder,
            stats,
            telemetry,
            interval,
            shard_delay,
            shutdown,
        }
    }

    /// One full pass over the retryable shards
    ///
    /// Stops between shards once shutdown is requested.
    pub async fn run_once(&self) -> RecoveryReport {
        self.stats.record_recovery_cycle();
        let mut report = RecoveryReport::default();

        let store = self.store.clone();
        let listed = tokio::task::spawn_blocking(move || {
            let reaped = store.reap_temporary()?;
            if reaped > 0 {
                warn!(reaped, "Removed interrupted shard writes");
            }
            store.list_retryable()
        })
        .await;

        let shards = match listed {
            Ok(Ok(shards)) => shards,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to scan dead-letter store");
                return report;
            }
            Err(e) => {
                error!(error = %e, "Dead-letter scan task failed");
                return report;
            }
        };

        if !shards.is_empty() {
            info!(shards = shards.len(), "Recovery pass started");
        }

        for (idx, id) in shards.into_iter().enumerate() {
            if self.shutdown.is_shutdown() {
                debug!("Recovery pass interrupted by shutdown");
                break;
            }
            if idx > 0 && !self.shard_delay.is_zero() {
                tokio::time::sleep(self.shard_delay).await;
            }
            report.shards += 1;
            self.recover_shard(id, &mut report).await;
        }

        self.refresh_gauges().await;

        if report.shards > 0 {
            info!(
                shards = report.shards,
                records = report.records,
                delivered = report.delivered,
                escalated = report.escalated,
                kept = report.kept,
                "Recovery pass complete"
            );
        }
        report
    }

    async fn recover_shard(&self, id: ShardId, report: &mut RecoveryReport) {
        let Some(level) = id.kind.level() else {
            return;
        };

        let contents = match self.read(id).await {
            Ok(contents) => contents,
            Err(StorageError::NotFound { .. }) => {
                debug!(shard = %id, "Shard vanished before recovery");
                return;
            }
            Err(e) => {
                error!(shard = %id, error = %e, "Unreadable shard left in place");
                report.kept += 1;
                return;
            }
        };

        let mut keep = false;
        for (key, payload) in contents.into_records() {
            report.records += 1;
            match self
                .forwarder
                .forward(&key, Bytes::from(payload), 0, level)
                .await
            {
                ForwardOutcome::Delivered => {
                    report.delivered += 1;
                    self.stats.record_recovered();
                    self.telemetry.increment(names::RECOVERED);
                }
                ForwardOutcome::DeadLettered(next) => {
                    report.escalated += 1;
                    debug!(from = %id, to = %next, "Record escalated");
                }
                ForwardOutcome::Dropped => {
                    report.dropped += 1;
                    keep = true;
                }
                ForwardOutcome::FailedEmpty => {}
            }
        }

        if keep {
            warn!(shard = %id, "Keeping shard, a record could not be persisted again");
            report.kept += 1;
            return;
        }

        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.remove(&id)).await {
            Ok(Ok(())) => self.stats.record_shard_removed(),
            Ok(Err(e)) => {
                error!(shard = %id, error = %e, "Failed to delete drained shard");
                report.kept += 1;
            }
            Err(e) => {
                error!(shard = %id, error = %e, "Shard delete task failed");
                report.kept += 1;
            }
        }
    }

    async fn read(&self, id: ShardId) -> Result<ShardContents, StorageError> {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.read(&id)).await {
            Ok(result) => result,
            Err(e) => Err(StorageError::io(
                self.store.root(),
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )),
        }
    }

    async fn refresh_gauges(&self) {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.counts()).await {
            Ok(Ok(counts)) => self.stats.set_shard_counts(counts),
            Ok(Err(e)) => warn!(error = %e, "Failed to count shards"),
            Err(e) => warn!(error = %e, "Shard count task failed"),
        }
    }

    /// Pass every interval until shutdown
    ///
    /// The startup pass is run separately, so the first pass here happens
    /// one full interval after start.
    pub async fn run(self) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(interval_s = self.interval.as_secs(), "Recovery loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.wait() => {
                    info!("Recovery loop stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use crate::test_utils::StubDownstream;
    use proxy_config::ForwardConfig;
    use storage::ShardKind;
    use telemetry::NoopTelemetry;
    use tempfile::tempdir;

    const KEY: &str = "/?query=INSERT%20INTO%20t%20VALUES";

    struct Harness {
        store: Arc<DeadLetterStore>,
        downstream: Arc<StubDownstream>,
        stats: Arc<ProxyStats>,
        recovery: RecoveryLoop,
        trigger: shutdown::ShutdownTrigger,
    }

    fn harness(root: &std::path::Path, ceiling: u8, status: u16) -> Harness {
        let store = Arc::new(DeadLetterStore::open(root, ceiling).unwrap());
        let downstream = Arc::new(StubDownstream::with_status(status));
        let stats = Arc::new(ProxyStats::new());
        let forwarder = Arc::new(Forwarder::new(
            downstream.clone(),
            &ForwardConfig::default(),
            store.clone(),
            stats.clone(),
            Arc::new(NoopTelemetry),
        ));
        let (trigger, signal) = shutdown::channel();
        let recovery = RecoveryLoop::new(
            store.clone(),
            forwarder,
            stats.clone(),
            Arc::new(NoopTelemetry),
            Duration::from_secs(60),
            Duration::ZERO,
            signal,
        );
        Harness {
            store,
            downstream,
            stats,
            recovery,
            trigger,
        }
    }

    #[tokio::test]
    async fn test_delivered_shard_is_deleted() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), 5, 200);
        h.store.persist(KEY, b"(1),(2)", 1).unwrap();

        let report = h.recovery.run_once().await;

        assert_eq!(report.shards, 1);
        assert_eq!(report.delivered, 1);
        assert!(h.store.list_retryable().unwrap().is_empty());
        assert_eq!(h.downstream.bodies_for(KEY), vec![Bytes::from_static(b"(1),(2)")]);
        assert_eq!(h.stats.snapshot().recovery_cycles, 1);
        assert_eq!(h.stats.pending_shards(), 0);
    }

    #[tokio::test]
    async fn test_failure_escalates_one_level() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), 5, 500);
        let original = h.store.persist(KEY, b"(1)", 2).unwrap();

        let report = h.recovery.run_once().await;
        assert_eq!(report.escalated, 1);

        let shards = h.store.list_retryable().unwrap();
        assert_eq!(shards.len(), 1);
        assert_ne!(shards[0], original);
        assert_eq!(shards[0].kind, ShardKind::Retryable(3));
        assert_eq!(h.store.read(&shards[0]).unwrap().get(KEY), Some(&b"(1)"[..]));
    }

    #[tokio::test]
    async fn test_shards_processed_in_level_then_age_order() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), 5, 200);
        h.store.persist("/second", b"b", 2).unwrap();
        h.store.persist("/first", b"a", 1).unwrap();
        h.store.persist("/third", b"c", 2).unwrap();

        h.recovery.run_once().await;

        let urls: Vec<String> = h.downstream.requests().into_iter().map(|(url, _)| url).collect();
        assert_eq!(
            urls,
            vec![
                "http://localhost:8123/first",
                "http://localhost:8123/second",
                "http://localhost:8123/third",
            ]
        );
    }

    #[tokio::test]
    async fn test_terminal_shards_never_retried() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), 3, 200);
        h.store.persist(KEY, b"(1)", 3).unwrap();

        let report = h.recovery.run_once().await;

        assert_eq!(report.shards, 0);
        assert_eq!(h.downstream.request_count(), 0);
        assert_eq!(h.store.list_terminal().unwrap().len(), 1);
        assert_eq!(h.stats.snapshot().terminal_shards, 1);
    }

    #[tokio::test]
    async fn test_foreign_files_skipped() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), 5, 200);
        std::fs::write(dir.path().join("0123"), b"junk").unwrap();
        std::fs::write(dir.path().join("readme"), b"junk").unwrap();

        let report = h.recovery.run_once().await;
        assert_eq!(report.shards, 0);
        assert!(dir.path().join("0123").exists());
    }

    #[tokio::test]
    async fn test_corrupt_shard_kept() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), 5, 200);
        std::fs::write(dir.path().join("1123"), b"garbage").unwrap();

        let report = h.recovery.run_once().await;
        assert_eq!(report.kept, 1);
        assert!(dir.path().join("1123").exists());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_between_shards() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), 5, 200);
        h.store.persist("/a", b"1", 1).unwrap();
        h.trigger.trigger();

        let report = h.recovery.run_once().await;
        assert_eq!(report.shards, 0);
        assert_eq!(h.store.list_retryable().unwrap().len(), 1);
    }
}
