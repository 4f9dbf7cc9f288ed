//! # Proxyhouse Configuration
//!
//! Typed configuration for the proxy service with one section per
//! component. Values come from built-in defaults, an optional TOML file and
//! `PROXYHOUSE_*` environment variables, in that order.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use proxy_config::ProxyConfig;
//! use std::path::Path;
//!
//! let config = ProxyConfig::load(Some(Path::new("proxyhouse.toml")))?;
//! println!("forwarding to {}", config.forward.address);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Environment keys use `__` between section and field:
//!
//! ```text
//! PROXYHOUSE_FORWARD__ADDRESS=http://clickhouse:8123
//! PROXYHOUSE_RECOVERY__RETRY_SEVERITY_CEILING=3
//! ```

pub mod loader;
pub mod proxy;

pub use loader::{ENV_PREFIX, MAX_SEVERITY_CEILING};
pub use proxy::{
    BufferConfig, DeadLetterConfig, FlushConfig, ForwardConfig, ListenConfig, LoggingConfig,
    ProxyConfig, RecoveryConfig, ShutdownConfig, StatusConfig, TelemetryConfig,
};
