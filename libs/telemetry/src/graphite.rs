//! Graphite plaintext sink over UDP
//!
//! Lines look like `<prefix>.<name> <value> <unix seconds>\n`. Aggregated
//! totals are flushed on a fixed interval by a background task; a final
//! flush runs when the shutdown signal arrives.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregator::MetricAggregator;
use crate::Telemetry;

/// Largest datagram assembled before starting a new one
const MAX_DATAGRAM: usize = 1400;

/// Telemetry that aggregates locally and ships to Graphite
#[derive(Debug, Clone)]
pub struct GraphiteTelemetry {
    aggregator: Arc<MetricAggregator>,
    prefix: String,
}

impl GraphiteTelemetry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            aggregator: Arc::new(MetricAggregator::new()),
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Render the pending totals as plaintext lines and clear them
    pub fn render(&self, timestamp: u64) -> Vec<String> {
        self.aggregator
            .drain()
            .into_iter()
            .map(|(name, value)| format_line(&self.prefix, &name, value, timestamp))
            .collect()
    }

    /// Start the flush loop against `addr`
    pub async fn spawn(
        &self,
        addr: String,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&addr).await?;
        info!(%addr, prefix = %self.prefix, "Graphite telemetry enabled");

        let telemetry = self.clone();
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        telemetry.flush(&socket).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            telemetry.flush(&socket).await;
                            debug!("Graphite telemetry stopped");
                            break;
                        }
                    }
                }
            }
        }))
    }

    async fn flush(&self, socket: &UdpSocket) {
        let lines = self.render(unix_seconds());
        for datagram in pack(&lines) {
            if let Err(e) = socket.send(datagram.as_bytes()).await {
                warn!(error = %e, "Failed to send metrics to graphite");
                return;
            }
        }
    }
}

impl Telemetry for GraphiteTelemetry {
    fn increment(&self, name: &str) {
        self.aggregator.increment(name);
    }

    fn update(&self, name: &str, value: u64) {
        self.aggregator.update(name, value);
    }
}

pub fn format_line(prefix: &str, name: &str, value: u64, timestamp: u64) -> String {
    if prefix.is_empty() {
        format!("{name} {value} {timestamp}\n")
    } else {
        format!("{prefix}.{name} {value} {timestamp}\n")
    }
}

/// Group lines into datagrams below the size limit
fn pack(lines: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in lines {
        if !current.is_empty() && current.len() + line.len() > MAX_DATAGRAM {
            out.push(std::mem::take(&mut current));
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names;

    #[test]
    fn test_format_line() {
        assert_eq!(
            format_line("relap.count.proxyhouse", "send", 3, 1700000000),
            "relap.count.proxyhouse.send 3 1700000000\n"
        );
        assert_eq!(format_line("", "send", 3, 1), "send 3 1\n");
    }

    #[test]
    fn test_render_drains() {
        let telemetry = GraphiteTelemetry::new("ph");
        telemetry.increment(names::SEND);
        telemetry.update(names::ROWS, 7);

        let lines = telemetry.render(10);
        assert_eq!(lines, vec!["ph.send 1 10\n", "ph.value 7 10\n"]);
        assert!(telemetry.render(11).is_empty());
    }

    #[test]
    fn test_pack_splits_large_batches() {
        let lines: Vec<String> = (0..200)
            .map(|i| format_line("prefix", &format!("metric{i}"), i, 1))
            .collect();
        let datagrams = pack(&lines);
        assert!(datagrams.len() > 1);
        assert!(datagrams.iter().all(|d| d.len() <= MAX_DATAGRAM));
        assert_eq!(datagrams.concat(), lines.concat());
    }

    #[tokio::test]
    async fn test_flush_reaches_udp_listener() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap().to_string();

        let telemetry = GraphiteTelemetry::new("ph");
        let (tx, rx) = watch::channel(false);
        let handle = telemetry
            .spawn(addr, Duration::from_millis(20), rx)
            .await
            .unwrap();

        telemetry.increment(names::RECEIVE);

        let mut buf = [0u8; 1500];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let text = std::str::from_utf8(&buf[..len]).unwrap();
        assert!(text.starts_with("ph.receive 1 "));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
