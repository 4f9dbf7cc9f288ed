//! Layered configuration loading
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. Optional TOML file
//! 3. Environment variables, `PROXYHOUSE_<SECTION>__<FIELD>`
//!
//! Command-line overrides are applied by the binary on top of the result.

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::proxy::ProxyConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PROXYHOUSE";

/// Highest retry level that fits the single-digit shard name
pub const MAX_SEVERITY_CEILING: u8 = 9;

impl ProxyConfig {
    /// Load defaults, then `path` if given, then `PROXYHOUSE_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Same as [`ProxyConfig::load`] with a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading configuration file: {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ProxyConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        let config = config.expand_paths()?;
        config.validate()?;
        debug!(?config, "Configuration loaded");
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults, without environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ProxyConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        let config = config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    /// Expand `~` and `$VAR` in filesystem paths
    pub fn expand_paths(mut self) -> Result<Self> {
        self.dead_letter.root = expand(&self.dead_letter.root)?;
        if let Some(socket) = &self.listen.unix_socket {
            self.listen.unix_socket = Some(expand(socket)?);
        }
        Ok(self)
    }

    /// Reject settings the proxy cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.flush.interval_seconds == 0 {
            bail!("flush.interval_seconds must be greater than 0");
        }
        if self.recovery.interval_steps == 0 {
            bail!("recovery.interval_steps must be greater than 0");
        }
        let ceiling = self.recovery.retry_severity_ceiling;
        if !(1..=MAX_SEVERITY_CEILING).contains(&ceiling) {
            bail!(
                "recovery.retry_severity_ceiling must be within 1..={}, got {}",
                MAX_SEVERITY_CEILING,
                ceiling
            );
        }
        if self.status.warning_shards > self.status.critical_shards {
            bail!(
                "status.warning_shards ({}) must not exceed status.critical_shards ({})",
                self.status.warning_shards,
                self.status.critical_shards
            );
        }
        if !self.status.path.starts_with('/') {
            bail!("status.path must start with '/', got {:?}", self.status.path);
        }
        if self.listen.max_header_bytes == 0 {
            bail!("listen.max_header_bytes must be greater than 0");
        }

        let url = url::Url::parse(&self.forward.address)
            .with_context(|| format!("Invalid forward.address {:?}", self.forward.address))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("forward.address must be http or https, got {}", url.scheme());
        }

        if let Some(pattern) = &self.forward.key_substitution {
            if pattern.is_empty() {
                bail!("forward.key_substitution must not be empty when set");
            }
        }

        Ok(())
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path {:?}", path))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
