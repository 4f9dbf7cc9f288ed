use crate::error::ForwardError;
use crate::forwarder::{Downstream, DownstreamResponse};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

/// A downstream that records every request and answers with scripted statuses
#[derive(Debug)]
pub struct StubDownstream {
    /// Returned once each, in order, before falling back to `status`
    scripted: Mutex<VecDeque<u16>>,
    status: AtomicU16,
    fail_transport: AtomicBool,
    requests: Mutex<Vec<(String, Bytes)>>,
}

impl StubDownstream {
    /// Create a stub answering every request with `status`
    pub fn with_status(status: u16) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            status: AtomicU16::new(status),
            fail_transport: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Change the status returned from now on
    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::Relaxed);
    }

    /// Queue statuses for the next requests
    pub fn script(&self, statuses: impl IntoIterator<Item = u16>) {
        self.scripted.lock().extend(statuses);
    }

    /// Configure to fail with a transport error
    pub fn fail_transport(&self, fail: bool) {
        self.fail_transport.store(fail, Ordering::Relaxed);
    }

    /// Get all received requests as `(url, body)`
    pub fn requests(&self) -> Vec<(String, Bytes)> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Bodies received for URLs ending with `suffix`
    pub fn bodies_for(&self, suffix: &str) -> Vec<Bytes> {
        self.requests
            .lock()
            .iter()
            .filter(|(url, _)| url.ends_with(suffix))
            .map(|(_, body)| body.clone())
            .collect()
    }
}

impl Default for StubDownstream {
    fn default() -> Self {
        Self::with_status(200)
    }
}

#[async_trait]
impl Downstream for StubDownstream {
    async fn post(&self, url: &str, body: Bytes) -> Result<DownstreamResponse, ForwardError> {
        self.requests.lock().push((url.to_string(), body));

        if self.fail_transport.load(Ordering::Relaxed) {
            return Err(ForwardError::Transport("connection refused".to_string()));
        }

        let status = self
            .scripted
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.status.load(Ordering::Relaxed));

        Ok(DownstreamResponse {
            status,
            body: if status == 200 {
                String::new()
            } else {
                format!("Code: {status}. stub failure")
            },
        })
    }
}
