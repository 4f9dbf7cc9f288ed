//! Forwarder
//!
//! Sends one batch to the database and turns the result into an outcome.
//! A batch that is not delivered is written to the dead-letter store one
//! level above the severity it was sent with; there is no synchronous
//! retry. Errors never escape this module as `Err`.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use proxy_config::ForwardConfig;
use storage::{DeadLetterStore, ShardId};
use telemetry::{names, Telemetry};

use crate::error::{ForwardError, ProxyError};
use crate::stats::ProxyStats;

/// Longest downstream error body kept for the status report
const MAX_ERROR_BODY: usize = 512;

/// Status and body of one downstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP endpoint batches are posted to
#[async_trait]
pub trait Downstream: Send + Sync + Debug {
    async fn post(&self, url: &str, body: Bytes) -> Result<DownstreamResponse, ForwardError>;
}

/// reqwest-backed downstream with connection pooling
#[derive(Debug, Clone)]
pub struct HttpDownstream {
    client: reqwest::Client,
}

impl HttpDownstream {
    pub fn new(config: &ForwardConfig) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(config.pool_idle_timeout())
            .timeout(config.timeout())
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ProxyError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn post(&self, url: &str, body: Bytes) -> Result<DownstreamResponse, ForwardError> {
        let response = self.client.post(url).body(body).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(DownstreamResponse { status, body })
    }
}

/// Static mapping from batching key to downstream URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPolicy {
    /// `base` followed by the key
    PathSuffix { base: String },
    /// First occurrence of `pattern` in the key replaced by `base`;
    /// keys without the pattern fall back to the path suffix
    Substitute { base: String, pattern: String },
}

impl AddressPolicy {
    pub fn from_config(config: &ForwardConfig) -> Self {
        let base = config.address.trim_end_matches('/').to_string();
        match &config.key_substitution {
            Some(pattern) => Self::Substitute {
                base,
                pattern: pattern.clone(),
            },
            None => Self::PathSuffix { base },
        }
    }

    pub fn resolve(&self, key: &str) -> String {
        match self {
            Self::PathSuffix { base } => format!("{base}{key}"),
            Self::Substitute { base, pattern } if key.contains(pattern.as_str()) => {
                key.replacen(pattern.as_str(), base, 1)
            }
            Self::Substitute { base, .. } => format!("{base}{key}"),
        }
    }
}

/// What happened to one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered,
    /// Not delivered, persisted for retry (or terminal) in this shard
    DeadLettered(ShardId),
    /// Not delivered, and persisting it failed; the data is gone
    Dropped,
    /// Not delivered, empty payload so nothing was persisted
    FailedEmpty,
}

impl ForwardOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

#[derive(Debug)]
pub struct Forwarder {
    downstream: Arc<dyn Downstream>,
    policy: AddressPolicy,
    success_status: u16,
    store: Arc<DeadLetterStore>,
    stats: Arc<ProxyStats>,
    telemetry: Arc<dyn Telemetry>,
}

impl Forwarder {
    pub fn new(
        downstream: Arc<dyn Downstream>,
        config: &ForwardConfig,
        store: Arc<DeadLetterStore>,
        stats: Arc<ProxyStats>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            downstream,
            policy: AddressPolicy::from_config(config),
            success_status: config.success_status,
            store,
            stats,
            telemetry,
        }
    }

    pub fn policy(&self) -> &AddressPolicy {
        &self.policy
    }

    /// Post `payload` for `key`; `severity` is the level it was read at
    /// (0 for a fresh batch)
    pub async fn forward(
        &self,
        key: &str,
        payload: Bytes,
        rows: u64,
        severity: u8,
    ) -> ForwardOutcome {
        let url = self.policy.resolve(key);
        let started = Instant::now();

        let result = match self.downstream.post(&url, payload.clone()).await {
            Ok(response) if response.status == self.success_status => Ok(()),
            Ok(response) => Err(ForwardError::Status {
                status: response.status,
                body: truncate(&response.body),
            }),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.stats.record_delivered();
                self.telemetry.increment(names::SEND);
                self.telemetry.update(names::ROWS, rows);
                self.telemetry.update(names::BYTES_SENT, payload.len() as u64);
                self.telemetry.update(names::SEND_DURATION_MS, elapsed_ms);
                debug!(key, bytes = payload.len(), rows, elapsed_ms, "Batch delivered");
                ForwardOutcome::Delivered
            }
            Err(e) => {
                warn!(key, bytes = payload.len(), severity, error = %e, "Forward failed");
                self.stats.record_failure(e.to_string());
                self.telemetry.increment(names::ERROR);

                if payload.is_empty() {
                    return ForwardOutcome::FailedEmpty;
                }
                self.dead_letter(key, payload, severity.saturating_add(1)).await
            }
        }
    }

    async fn dead_letter(&self, key: &str, payload: Bytes, level: u8) -> ForwardOutcome {
        let store = self.store.clone();
        let owned_key = key.to_string();
        let bytes = payload.len();

        let persisted =
            tokio::task::spawn_blocking(move || store.persist(&owned_key, &payload, level)).await;

        match persisted {
            Ok(Ok(id)) => {
                self.stats.record_dead_lettered(id.kind);
                self.telemetry.increment(names::DEAD_LETTER);
                if id.kind.is_terminal() {
                    warn!(key, shard = %id, "Batch reached retry ceiling, stored as terminal");
                } else {
                    debug!(key, shard = %id, level, "Batch stored for retry");
                }
                ForwardOutcome::DeadLettered(id)
            }
            Ok(Err(e)) => {
                error!(key, bytes, error = %e, "Failed to persist batch, dropping it");
                self.stats.record_dropped(e.to_string());
                self.telemetry.increment(names::DROPPED);
                ForwardOutcome::Dropped
            }
            Err(e) => {
                error!(key, bytes, error = %e, "Persist task failed, dropping batch");
                self.stats.record_dropped(e.to_string());
                self.telemetry.increment(names::DROPPED);
                ForwardOutcome::Dropped
            }
        }
    }
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= MAX_ERROR_BODY {
        return trimmed.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::StubDownstream;
    use storage::ShardKind;
    use telemetry::test_utils::RecordingTelemetry;
    use tempfile::tempdir;

    const KEY: &str = "/?query=INSERT%20INTO%20t%20VALUES";

    fn forwarder(
        downstream: Arc<StubDownstream>,
        store: Arc<DeadLetterStore>,
    ) -> (Forwarder, Arc<ProxyStats>, RecordingTelemetry) {
        let stats = Arc::new(ProxyStats::new());
        let telemetry = RecordingTelemetry::new();
        let forwarder = Forwarder::new(
            downstream,
            &ForwardConfig::default(),
            store,
            stats.clone(),
            Arc::new(telemetry.clone()),
        );
        (forwarder, stats, telemetry)
    }

    #[test]
    fn test_address_policies() {
        let suffix = AddressPolicy::PathSuffix {
            base: "http://db:8123".to_string(),
        };
        assert_eq!(suffix.resolve(KEY), format!("http://db:8123{KEY}"));

        let substitute = AddressPolicy::Substitute {
            base: "http://db:8123".to_string(),
            pattern: "/ch".to_string(),
        };
        assert_eq!(
            substitute.resolve("/ch/?query=INSERT"),
            "http://db:8123/?query=INSERT"
        );
        assert_eq!(substitute.resolve("/other"), "http://db:8123/other");
    }

    #[test]
    fn test_policy_from_config_trims_slash() {
        let config = ForwardConfig {
            address: "http://db:8123/".to_string(),
            ..ForwardConfig::default()
        };
        assert_eq!(
            AddressPolicy::from_config(&config).resolve("/x"),
            "http://db:8123/x"
        );
    }

    #[tokio::test]
    async fn test_success_has_no_side_effects() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DeadLetterStore::open(dir.path(), 5).unwrap());
        let downstream = Arc::new(StubDownstream::with_status(200));
        let (forwarder, stats, telemetry) = forwarder(downstream.clone(), store.clone());

        let outcome = forwarder.forward(KEY, Bytes::from_static(b"(1),(2)"), 2, 0).await;

        assert_eq!(outcome, ForwardOutcome::Delivered);
        assert!(store.list_retryable().unwrap().is_empty());
        assert_eq!(stats.snapshot().delivered, 1);
        assert_eq!(telemetry.get(names::SEND), 1);
        assert_eq!(telemetry.get(names::ROWS), 2);

        let requests = downstream.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, format!("http://localhost:8123{KEY}"));
        assert_eq!(&requests[0].1[..], b"(1),(2)");
    }

    #[tokio::test]
    async fn test_failure_persists_one_level_up() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DeadLetterStore::open(dir.path(), 5).unwrap());
        let downstream = Arc::new(StubDownstream::with_status(500));
        let (forwarder, stats, telemetry) = forwarder(downstream, store.clone());

        let outcome = forwarder.forward(KEY, Bytes::from_static(b"(1)"), 1, 0).await;
        let ForwardOutcome::DeadLettered(id) = outcome else {
            panic!("expected dead-letter, got {outcome:?}");
        };
        assert_eq!(id.kind, ShardKind::Retryable(1));
        assert_eq!(store.read(&id).unwrap().get(KEY), Some(&b"(1)"[..]));

        let outcome = forwarder.forward(KEY, Bytes::from_static(b"(1)"), 1, 3).await;
        let ForwardOutcome::DeadLettered(id) = outcome else {
            panic!("expected dead-letter, got {outcome:?}");
        };
        assert_eq!(id.kind, ShardKind::Retryable(4));

        assert_eq!(stats.snapshot().failed, 2);
        assert_eq!(stats.pending_shards(), 2);
        assert!(stats.last_error().unwrap().contains("500"));
        assert_eq!(telemetry.get(names::ERROR), 2);
        assert_eq!(telemetry.get(names::DEAD_LETTER), 2);
    }

    #[tokio::test]
    async fn test_non_success_2xx_is_failure() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DeadLetterStore::open(dir.path(), 5).unwrap());
        let (forwarder, _, _) = forwarder(Arc::new(StubDownstream::with_status(204)), store);

        let outcome = forwarder.forward(KEY, Bytes::from_static(b"(1)"), 1, 0).await;
        assert!(matches!(outcome, ForwardOutcome::DeadLettered(_)));
    }

    #[tokio::test]
    async fn test_transport_error_is_failure() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DeadLetterStore::open(dir.path(), 5).unwrap());
        let downstream = Arc::new(StubDownstream::with_status(200));
        downstream.fail_transport(true);
        let (forwarder, stats, _) = forwarder(downstream, store);

        let outcome = forwarder.forward(KEY, Bytes::from_static(b"(1)"), 1, 0).await;
        assert!(matches!(outcome, ForwardOutcome::DeadLettered(_)));
        assert!(stats.last_error().unwrap().contains("Transport"));
    }

    #[tokio::test]
    async fn test_empty_payload_not_persisted() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DeadLetterStore::open(dir.path(), 5).unwrap());
        let downstream = Arc::new(StubDownstream::with_status(500));
        let (forwarder, _, _) = forwarder(downstream, store.clone());

        let outcome = forwarder.forward(KEY, Bytes::new(), 0, 0).await;
        assert_eq!(outcome, ForwardOutcome::FailedEmpty);
        assert!(store.list_retryable().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_drops() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("errors");
        std::fs::create_dir(&root).unwrap();
        let store = Arc::new(DeadLetterStore::open(&root, 5).unwrap());
        std::fs::remove_dir(&root).unwrap();

        let (forwarder, stats, _) = forwarder(Arc::new(StubDownstream::with_status(500)), store);
        let outcome = forwarder.forward(KEY, Bytes::from_static(b"(1)"), 1, 0).await;

        assert_eq!(outcome, ForwardOutcome::Dropped);
        assert_eq!(stats.snapshot().dropped, 1);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(MAX_ERROR_BODY);
        let cut = truncate(&body);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
