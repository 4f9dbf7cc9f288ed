//! Component wiring and lifecycle
//!
//! Builds every component from a [`ProxyConfig`], runs the startup recovery
//! pass, then starts the listener and both background loops. Stopping is
//! driven by a [`ShutdownSignal`]; [`RunningProxy::wait`] stops the
//! listeners, waits for open connections, joins the loops and only then
//! drains the buffer one last time.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use codec::FrameLimits;
use proxy_config::ProxyConfig;
use storage::{DeadLetterStore, StorageError};
use telemetry::Telemetry;

use crate::buffer::IngestBuffer;
use crate::classifier::{ClassifierSettings, RequestClassifier};
use crate::error::ProxyError;
use crate::forwarder::{Downstream, Forwarder};
use crate::recovery::{RecoveryLoop, RecoveryReport};
use crate::scheduler::FlushScheduler;
use crate::server::{log_join_error, IngestServer};
use crate::shutdown::ShutdownSignal;
use crate::stats::{HealthThresholds, ProxyStats};

#[derive(Debug)]
pub struct ProxyService {
    config: ProxyConfig,
    buffer: Arc<IngestBuffer>,
    stats: Arc<ProxyStats>,
    store: Arc<DeadLetterStore>,
    forwarder: Arc<Forwarder>,
    telemetry: Arc<dyn Telemetry>,
}

impl ProxyService {
    /// Build all components
    ///
    /// Fails with [`ProxyError::StartupStorageMissing`] when the dead-letter
    /// root does not exist.
    pub fn new(
        config: ProxyConfig,
        downstream: Arc<dyn Downstream>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, ProxyError> {
        let store = DeadLetterStore::open(
            &config.dead_letter.root,
            config.recovery.retry_severity_ceiling,
        )
        .map_err(|e| match e {
            StorageError::RootMissing { path } => ProxyError::StartupStorageMissing { path },
            other => ProxyError::Storage(other),
        })?;
        let store = Arc::new(store);

        let stats = Arc::new(ProxyStats::new());
        stats.set_shard_counts(store.counts()?);

        let buffer = Arc::new(IngestBuffer::new(
            config.buffer.row_delimiter.as_bytes(),
            config.buffer.preallocation_size,
        ));

        let forwarder = Arc::new(Forwarder::new(
            downstream,
            &config.forward,
            store.clone(),
            stats.clone(),
            telemetry.clone(),
        ));

        Ok(Self {
            config,
            buffer,
            stats,
            store,
            forwarder,
            telemetry,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        self.stats.clone()
    }

    pub fn buffer(&self) -> Arc<IngestBuffer> {
        self.buffer.clone()
    }

    pub fn store(&self) -> Arc<DeadLetterStore> {
        self.store.clone()
    }

    pub fn flush_scheduler(&self) -> FlushScheduler {
        FlushScheduler::new(
            self.buffer.clone(),
            self.forwarder.clone(),
            self.stats.clone(),
            self.config.flush.interval(),
        )
    }

    pub fn recovery_loop(&self, shutdown: ShutdownSignal) -> RecoveryLoop {
        RecoveryLoop::new(
            self.store.clone(),
            self.forwarder.clone(),
            self.stats.clone(),
            self.telemetry.clone(),
            self.config.recovery_interval(),
            self.config.recovery.shard_delay(),
            shutdown,
        )
    }

    pub fn ingest_server(&self) -> Arc<IngestServer> {
        let classifier = Arc::new(RequestClassifier::new(
            self.buffer.clone(),
            self.stats.clone(),
            self.telemetry.clone(),
            ClassifierSettings {
                status_path: self.config.status.path.clone(),
                thresholds: HealthThresholds {
                    warning_shards: self.config.status.warning_shards,
                    critical_shards: self.config.status.critical_shards,
                },
                require_insert_query: self.config.buffer.require_insert_query,
            },
        ));

        Arc::new(IngestServer::new(
            classifier,
            self.stats.clone(),
            FrameLimits {
                max_header_bytes: self.config.listen.max_header_bytes,
                max_body_bytes: self.config.listen.max_body_bytes,
            },
            self.config.listen.idle_timeout(),
        ))
    }

    /// Run the startup recovery pass, then start serving
    pub async fn start(
        self,
        listener: TcpListener,
        unix_listener: Option<UnixListener>,
        shutdown: ShutdownSignal,
    ) -> RunningProxy {
        let recovery = self.recovery_loop(shutdown.clone());
        let report = recovery.run_once().await;
        log_startup_recovery(&report);

        let server = self.ingest_server();
        let scheduler = self.flush_scheduler();

        let mut listeners: Vec<(&'static str, JoinHandle<()>)> = vec![(
            "listener",
            tokio::spawn(server.clone().serve_tcp(listener, shutdown.clone())),
        )];
        if let Some(unix_listener) = unix_listener {
            listeners.push((
                "unix-listener",
                tokio::spawn(server.clone().serve_unix(unix_listener, shutdown.clone())),
            ));
        }

        let loops = vec![
            ("flush", tokio::spawn(scheduler.clone().run(shutdown.clone()))),
            ("recovery", tokio::spawn(recovery.run())),
        ];

        RunningProxy {
            listeners,
            loops,
            server,
            scheduler,
            stats: self.stats,
        }
    }
}

fn log_startup_recovery(report: &RecoveryReport) {
    if report.shards == 0 {
        info!("No dead-letter shards pending at startup");
    } else {
        info!(
            shards = report.shards,
            delivered = report.delivered,
            escalated = report.escalated,
            kept = report.kept,
            "Startup recovery complete"
        );
    }
}

/// Handles of a started proxy
#[derive(Debug)]
pub struct RunningProxy {
    listeners: Vec<(&'static str, JoinHandle<()>)>,
    loops: Vec<(&'static str, JoinHandle<()>)>,
    server: Arc<IngestServer>,
    scheduler: FlushScheduler,
    stats: Arc<ProxyStats>,
}

impl RunningProxy {
    pub fn stats(&self) -> Arc<ProxyStats> {
        self.stats.clone()
    }

    /// Wait for every task after shutdown was signalled, then drain
    ///
    /// The final drain runs only after the listeners and every connection
    /// stopped, so each acknowledged row is either forwarded or dead-lettered.
    /// Returns `false` when the grace period ran out first; tasks still
    /// running are aborted, the final drain still runs.
    pub async fn wait(self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        let mut clean = join_until(deadline, self.listeners).await;

        if tokio::time::timeout_at(deadline, self.server.drain_connections())
            .await
            .is_err()
        {
            warn!("Grace period elapsed, aborting open connections");
            clean = false;
        }

        clean &= join_until(deadline, self.loops).await;

        self.scheduler.final_drain().await;
        clean
    }
}

async fn join_until(
    deadline: tokio::time::Instant,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
) -> bool {
    let mut clean = true;
    for (name, mut handle) in tasks {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(result) => log_join_error(name, result),
            Err(_) => {
                warn!(task = name, "Grace period elapsed, aborting task");
                handle.abort();
                clean = false;
            }
        }
    }
    clean
}
