//! Proxyhouse binary - buffered INSERT proxy for ClickHouse
//!
//! Usage:
//!   proxyhouse --config proxyhouse.toml
//!   proxyhouse --port 8124 --fwd http://clickhouse:8123 --syncsec 2

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use proxy_config::ProxyConfig;
use proxyhouse::{shutdown, HttpDownstream, ProxyError, ProxyService};
use telemetry::{GraphiteTelemetry, NoopTelemetry, Telemetry};

#[derive(Parser, Debug)]
#[command(name = "proxyhouse")]
#[command(about = "Write-buffering INSERT proxy for ClickHouse")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port to accept inserts on
    #[arg(short, long)]
    port: Option<u16>,

    /// Additional unix socket to accept inserts on
    #[arg(long)]
    unix_socket: Option<PathBuf>,

    /// Forward batches to this server
    #[arg(long)]
    fwd: Option<String>,

    /// Delimiter between VALUES rows of one batch
    #[arg(long)]
    delim: Option<String>,

    /// Flush interval in seconds
    #[arg(long)]
    syncsec: Option<u64>,

    /// Idle connection timeout in seconds (0 disables it)
    #[arg(long)]
    keepalive: Option<u64>,

    /// Directory holding dead-letter shards (must exist)
    #[arg(long)]
    dead_letter_dir: Option<PathBuf>,

    #[arg(long)]
    graphite_host: Option<String>,

    #[arg(long)]
    graphite_port: Option<u16>,

    #[arg(long)]
    graphite_prefix: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(path) = &self.unix_socket {
            config.listen.unix_socket = Some(path.clone());
        }
        if let Some(fwd) = &self.fwd {
            config.forward.address = fwd.clone();
        }
        if let Some(delim) = &self.delim {
            config.buffer.row_delimiter = delim.clone();
        }
        if let Some(syncsec) = self.syncsec {
            config.flush.interval_seconds = syncsec;
        }
        if let Some(keepalive) = self.keepalive {
            config.listen.max_connections_idle_seconds = keepalive;
        }
        if let Some(dir) = &self.dead_letter_dir {
            config.dead_letter.root = dir.clone();
        }
        if let Some(host) = &self.graphite_host {
            config.telemetry.graphite_host = Some(host.clone());
        }
        if let Some(port) = self.graphite_port {
            config.telemetry.graphite_port = port;
        }
        if let Some(prefix) = &self.graphite_prefix {
            config.telemetry.prefix = prefix.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let logging = init_logging(&args);

    info!("Starting proxyhouse");

    let mut config = ProxyConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    let config = config.expand_paths()?;
    config.validate()?;
    logging.apply(&config);

    info!(
        port = config.listen.port,
        forward = %config.forward.address,
        flush_s = config.flush.interval_seconds,
        dead_letter = ?config.dead_letter.root,
        "Configuration loaded"
    );

    let (trigger, signal) = shutdown::channel();

    let mut telemetry_task = None;
    let telemetry: Arc<dyn Telemetry> = match config.telemetry.graphite_addr() {
        Some(addr) => {
            let graphite = GraphiteTelemetry::new(config.telemetry.prefix.clone());
            let handle = graphite
                .spawn(addr, config.telemetry.flush_interval(), signal.receiver())
                .await
                .context("Failed to start graphite telemetry")?;
            telemetry_task = Some(handle);
            Arc::new(graphite)
        }
        None => Arc::new(NoopTelemetry),
    };

    let downstream = Arc::new(HttpDownstream::new(&config.forward)?);
    let service = match ProxyService::new(config.clone(), downstream, telemetry) {
        Ok(service) => service,
        Err(e @ ProxyError::StartupStorageMissing { .. }) => {
            error!("{}", e);
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    let addr = config.listen.socket_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ProxyError::bind(addr.clone(), e))?;

    let unix_listener = match &config.listen.unix_socket {
        Some(path) => Some(
            proxyhouse::server::bind_unix(path)
                .map_err(|e| ProxyError::bind(path.display().to_string(), e))?,
        ),
        None => None,
    };

    let running = service.start(listener, unix_listener, signal).await;
    let stats = running.stats();

    wait_for_signal().await;
    info!(
        grace_s = config.shutdown.grace_seconds,
        "Received shutdown signal, draining"
    );

    trigger.trigger();
    if !running.wait(config.shutdown.grace()).await {
        error!("Shutdown grace period elapsed before all tasks finished");
    }
    if let Some(handle) = telemetry_task {
        let _ = tokio::time::timeout(config.shutdown.grace(), handle).await;
    }

    let snapshot = stats.snapshot();
    info!(
        accepted = snapshot.accepted,
        forwarded = snapshot.forwarded,
        delivered = snapshot.delivered,
        dead_lettered = snapshot.dead_lettered,
        recovery_cycles = snapshot.recovery_cycles,
        "Final counters"
    );
    println!("{}", serde_json::to_string(&snapshot)?);

    Ok(())
}

/// Logging set up before the configuration is known
struct Logging {
    handle: reload::Handle<EnvFilter, Registry>,
    level_fixed: bool,
    json: bool,
}

impl Logging {
    /// Switch to the configured level unless `RUST_LOG` or `--log-level` won
    fn apply(&self, config: &ProxyConfig) {
        if !self.level_fixed {
            if let Err(e) = self.handle.reload(EnvFilter::new(&config.logging.level)) {
                warn!(error = %e, "Failed to apply configured log level");
            }
        }
        if config.logging.json && !self.json {
            warn!("logging.json takes effect only with --json-logs");
        }
    }
}

/// Directives to start with, and whether the config file may replace them
fn startup_directives(rust_log: Option<String>, cli_level: Option<&str>) -> (String, bool) {
    match (rust_log.filter(|v| !v.trim().is_empty()), cli_level) {
        (Some(directives), _) => (directives, true),
        (None, Some(level)) => (level.to_string(), true),
        (None, None) => ("info".to_string(), false),
    }
}

fn init_logging(args: &Args) -> Logging {
    let (directives, level_fixed) = startup_directives(
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        args.log_level.as_deref(),
    );
    let (filter, handle) = reload::Layer::new(EnvFilter::new(directives));
    let registry = tracing_subscriber::registry().with(filter);

    if args.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    Logging {
        handle,
        level_fixed,
        json: args.json_logs,
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install CTRL+C signal handler: {}", e);
    }
}
