//! Ingestion listener
//!
//! One task per connection. Each task owns a [`FrameDemux`], reads into a
//! fixed buffer and writes back the replies produced by that read before
//! reading again. The handler is generic over the stream type so TCP, unix
//! sockets and in-memory pipes share the same path.
//!
//! Connection tasks are tracked so shutdown can wait for every one of them
//! to stop appending before the buffer is drained for the last time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use codec::{FrameDemux, FrameLimits};

use crate::classifier::RequestClassifier;
use crate::shutdown::ShutdownSignal;
use crate::stats::ProxyStats;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub struct IngestServer {
    classifier: Arc<RequestClassifier>,
    stats: Arc<ProxyStats>,
    limits: FrameLimits,
    idle_timeout: Option<Duration>,
    connections: Mutex<JoinSet<()>>,
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    PeerClosed,
    ClosedByProxy,
    IdleTimeout,
    Shutdown,
}

impl IngestServer {
    pub fn new(
        classifier: Arc<RequestClassifier>,
        stats: Arc<ProxyStats>,
        limits: FrameLimits,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            classifier,
            stats,
            limits,
            idle_timeout,
            connections: Mutex::new(JoinSet::new()),
        }
    }

    /// Accept TCP connections until shutdown
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener, mut shutdown: ShutdownSignal) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Accepting connections");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        self.spawn_connection(stream, peer.to_string(), shutdown.clone());
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown.wait() => {
                    info!("Listener stopped");
                    return;
                }
            }
        }
    }

    /// Accept unix socket connections until shutdown
    pub async fn serve_unix(self: Arc<Self>, listener: UnixListener, mut shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        self.spawn_connection(stream, "unix".to_string(), shutdown.clone());
                    }
                    Err(e) => {
                        warn!(error = %e, "Unix accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown.wait() => {
                    info!("Unix listener stopped");
                    return;
                }
            }
        }
    }

    fn spawn_connection<S>(self: &Arc<Self>, stream: S, peer: String, shutdown: ShutdownSignal)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.clone();
        let mut connections = self.connections.lock();
        while connections.try_join_next().is_some() {}
        connections.spawn(async move {
            match server.handle_connection(stream, shutdown).await {
                Ok(end) => debug!(%peer, ?end, "Connection finished"),
                Err(e) => debug!(%peer, error = %e, "Connection error"),
            }
        });
    }

    /// Connection tasks that have not finished yet
    pub fn open_connections(&self) -> usize {
        let mut connections = self.connections.lock();
        while connections.try_join_next().is_some() {}
        connections.len()
    }

    /// Wait until every spawned connection task has ended
    ///
    /// Call after the listeners stopped; connections accepted later are not
    /// waited for. Dropping the future aborts the remaining tasks.
    pub async fn drain_connections(&self) {
        let mut connections = std::mem::take(&mut *self.connections.lock());
        if !connections.is_empty() {
            info!(open = connections.len(), "Waiting for connections to close");
        }
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Connection task ended abnormally");
            }
        }
    }

    /// Drive one connection to completion
    pub async fn handle_connection<S>(
        &self,
        mut stream: S,
        mut shutdown: ShutdownSignal,
    ) -> std::io::Result<ConnectionEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.stats.connection_opened();
        let result = self.connection_loop(&mut stream, &mut shutdown).await;
        self.stats.connection_closed();

        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "Failed to shut down stream");
        }
        result
    }

    async fn connection_loop<S>(
        &self,
        stream: &mut S,
        shutdown: &mut ShutdownSignal,
    ) -> std::io::Result<ConnectionEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut demux = FrameDemux::new(self.limits);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            // Shutdown wins over pending input.
            let read = tokio::select! {
                biased;

                _ = shutdown.wait() => return Ok(ConnectionEnd::Shutdown),
                read = read_with_timeout(stream, &mut buf, self.idle_timeout) => read,
            };

            let n = match read {
                Some(Ok(0)) => {
                    if demux.pending() > 0 {
                        debug!(pending = demux.pending(), "Peer closed mid-request");
                    }
                    return Ok(ConnectionEnd::PeerClosed);
                }
                Some(Ok(n)) => n,
                Some(Err(e)) => return Err(e),
                None => return Ok(ConnectionEnd::IdleTimeout),
            };

            let feed = demux.feed(&buf[..n], |frame| self.classifier.classify(frame));
            for response in &feed.responses {
                stream.write_all(response).await?;
            }
            if !feed.responses.is_empty() {
                stream.flush().await?;
            }
            if feed.close {
                return Ok(ConnectionEnd::ClosedByProxy);
            }
        }
    }
}

/// `None` when the idle timeout elapsed first
async fn read_with_timeout<S>(
    stream: &mut S,
    buf: &mut [u8],
    idle: Option<Duration>,
) -> Option<std::io::Result<usize>>
where
    S: AsyncRead + Unpin,
{
    match idle {
        Some(limit) => tokio::time::timeout(limit, stream.read(buf)).await.ok(),
        None => Some(stream.read(buf).await),
    }
}

/// Bind a unix socket, replacing a stale socket file
pub fn bind_unix(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(?path, "Accepting unix socket connections");
    Ok(listener)
}

/// Log a listener task that ended with a panic
pub(crate) fn log_join_error(task: &str, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(task, error = %e, "Task ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::IngestBuffer;
    use crate::classifier::ClassifierSettings;
    use crate::shutdown;
    use crate::stats::HealthThresholds;
    use codec::response::ACCEPTED;
    use telemetry::NoopTelemetry;
    use tokio::io::duplex;
    use tokio::net::TcpStream;

    const INSERT: &[u8] =
        b"POST /?query=INSERT%20INTO%20t%20VALUES HTTP/1.1\r\nContent-Length: 3\r\n\r\n";

    fn server(idle: Option<Duration>) -> (Arc<IngestServer>, Arc<IngestBuffer>) {
        let buffer = Arc::new(IngestBuffer::new(",", 64));
        let stats = Arc::new(ProxyStats::new());
        let classifier = Arc::new(RequestClassifier::new(
            buffer.clone(),
            stats.clone(),
            Arc::new(NoopTelemetry),
            ClassifierSettings {
                status_path: "/status".to_string(),
                thresholds: HealthThresholds {
                    warning_shards: 10,
                    critical_shards: 100,
                },
                require_insert_query: true,
            },
        ));
        let server = Arc::new(IngestServer::new(
            classifier,
            stats,
            FrameLimits::default(),
            idle,
        ));
        (server, buffer)
    }

    async fn read_all(stream: &mut tokio::io::DuplexStream) -> String {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_pipelined_requests_get_ordered_responses() {
        let (server, buffer) = server(None);
        let (mut client, conn) = duplex(4096);
        let (_trigger, signal) = shutdown::channel();

        let handle = tokio::spawn(async move { server.handle_connection(conn, signal).await });

        let mut input = INSERT.to_vec();
        input.extend_from_slice(b"(1)");
        input.extend_from_slice(b"PUT /x HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        input.extend_from_slice(INSERT);
        input.extend_from_slice(b"(2)");
        client.write_all(&input).await.unwrap();
        client.shutdown().await.unwrap();

        let text = read_all(&mut client).await;
        let statuses: Vec<&str> = text
            .split("\r\n\r\n")
            .filter(|s| !s.is_empty())
            .map(|s| &s[9..12])
            .collect();
        assert_eq!(statuses, vec!["202", "400", "202"]);

        assert_eq!(handle.await.unwrap().unwrap(), ConnectionEnd::PeerClosed);
        let detached = buffer.detach_all();
        assert_eq!(
            detached["/?query=INSERT%20INTO%20t%20VALUES"].payload(),
            b"(1),(2)"
        );
    }

    #[tokio::test]
    async fn test_split_body_across_reads() {
        let (server, buffer) = server(None);
        let (mut client, conn) = duplex(4096);
        let (_trigger, signal) = shutdown::channel();
        let handle = tokio::spawn(async move { server.handle_connection(conn, signal).await });

        client.write_all(INSERT).await.unwrap();
        client.write_all(b"(1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.pending_keys(), 0);

        client.write_all(b")").await.unwrap();
        client.shutdown().await.unwrap();
        assert!(read_all(&mut client).await.starts_with("HTTP/1.1 202"));

        handle.await.unwrap().unwrap();
        assert_eq!(buffer.pending_keys(), 1);
    }

    #[tokio::test]
    async fn test_malformed_request_closes_connection() {
        let (server, _) = server(None);
        let (mut client, conn) = duplex(4096);
        let (_trigger, signal) = shutdown::channel();
        let handle = tokio::spawn(async move { server.handle_connection(conn, signal).await });

        client
            .write_all(b"POST /?query=INSERT%20INTO%20t%20VALUES HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        assert!(read_all(&mut client).await.starts_with("HTTP/1.1 400"));
        assert_eq!(handle.await.unwrap().unwrap(), ConnectionEnd::ClosedByProxy);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (server, _) = server(Some(Duration::from_millis(30)));
        let (_client, conn) = duplex(4096);
        let (_trigger, signal) = shutdown::channel();

        let end = server.handle_connection(conn, signal).await.unwrap();
        assert_eq!(end, ConnectionEnd::IdleTimeout);
    }

    #[tokio::test]
    async fn test_shutdown_ends_idle_connection() {
        let (server, _) = server(None);
        let (_client, conn) = duplex(4096);
        let (trigger, signal) = shutdown::channel();
        let handle = tokio::spawn(async move { server.handle_connection(conn, signal).await });

        trigger.trigger();
        let end = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(end, ConnectionEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_pending_input_is_not_read_after_shutdown() {
        for _ in 0..50 {
            let (server, buffer) = server(None);
            let (mut client, conn) = duplex(4096);
            let (trigger, signal) = shutdown::channel();

            client.write_all(INSERT).await.unwrap();
            client.write_all(b"(1)").await.unwrap();
            trigger.trigger();

            let end = server.handle_connection(conn, signal).await.unwrap();
            assert_eq!(end, ConnectionEnd::Shutdown);
            assert!(read_all(&mut client).await.is_empty());
            assert_eq!(buffer.pending_keys(), 0);
        }
    }

    #[tokio::test]
    async fn test_drain_waits_for_open_connections() {
        let (server, buffer) = server(None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (trigger, signal) = shutdown::channel();
        let accept = tokio::spawn(server.clone().serve_tcp(listener, signal));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(INSERT).await.unwrap();
        client.write_all(b"(1)").await.unwrap();
        let mut reply = vec![0u8; ACCEPTED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, ACCEPTED);
        assert_eq!(server.open_connections(), 1);

        trigger.trigger();
        accept.await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), server.drain_connections())
            .await
            .unwrap();

        assert_eq!(server.open_connections(), 0);
        assert_eq!(buffer.pending_keys(), 1);
    }
}
