//! Flush Scheduler
//!
//! Drains the ingest buffer on a fixed interval and forwards every detached
//! batch concurrently. A tick finishes when all of its forwards have an
//! outcome. The loop stops ticking on shutdown; [`FlushScheduler::final_drain`]
//! is run by the owner once no connection can append anymore.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::buffer::IngestBuffer;
use crate::forwarder::{ForwardOutcome, Forwarder};
use crate::shutdown::ShutdownSignal;
use crate::stats::ProxyStats;

/// Outcomes of one flush tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches: usize,
    pub delivered: usize,
    pub dead_lettered: usize,
    pub dropped: usize,
}

impl FlushReport {
    fn record(&mut self, outcome: &ForwardOutcome) {
        match outcome {
            ForwardOutcome::Delivered => self.delivered += 1,
            ForwardOutcome::DeadLettered(_) => self.dead_lettered += 1,
            ForwardOutcome::Dropped | ForwardOutcome::FailedEmpty => self.dropped += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlushScheduler {
    buffer: Arc<IngestBuffer>,
    forwarder: Arc<Forwarder>,
    stats: Arc<ProxyStats>,
    interval: Duration,
}

impl FlushScheduler {
    pub fn new(
        buffer: Arc<IngestBuffer>,
        forwarder: Arc<Forwarder>,
        stats: Arc<ProxyStats>,
        interval: Duration,
    ) -> Self {
        Self {
            buffer,
            forwarder,
            stats,
            interval,
        }
    }

    /// Detach everything buffered and forward it
    pub async fn flush_once(&self) -> FlushReport {
        let detached = self.buffer.detach_all();
        let mut report = FlushReport::default();
        if detached.is_empty() {
            return report;
        }

        report.batches = detached.len();
        self.stats.record_forwarded(detached.len() as u64);

        let mut tasks = JoinSet::new();
        for (key, batch) in detached {
            let forwarder = self.forwarder.clone();
            let rows = batch.rows();
            tasks.spawn(async move { forwarder.forward(&key, batch.into_bytes(), rows, 0).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!(error = %e, "Forward task panicked");
                    report.dropped += 1;
                }
            }
        }

        debug!(
            batches = report.batches,
            delivered = report.delivered,
            dead_lettered = report.dead_lettered,
            "Flush tick complete"
        );
        report
    }

    /// Tick until shutdown
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(interval_ms = self.interval.as_millis() as u64, "Flush scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                _ = shutdown.wait() => {
                    break;
                }
            }
        }
        info!("Flush scheduler stopped");
    }

    /// Last flush before exit
    ///
    /// Must run after every writer to the buffer has stopped, otherwise rows
    /// appended afterwards stay in memory.
    pub async fn final_drain(&self) -> FlushReport {
        let report = self.flush_once().await;
        info!(
            batches = report.batches,
            delivered = report.delivered,
            dead_lettered = report.dead_lettered,
            "Final drain complete"
        );
        report
    }
}
