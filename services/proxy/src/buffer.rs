//! Ingest Buffer
//!
//! Per-key accumulation of request bodies behind a single mutex. The lock
//! covers memory copies and the detach swap only; format detection and the
//! allocation of new batches happen outside it.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::key::BatchFormat;

/// Payload accumulated for one batching key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBatch {
    payload: Vec<u8>,
    rows: u64,
    format: BatchFormat,
}

impl PendingBatch {
    fn new(format: BatchFormat, capacity: usize) -> Self {
        Self {
            payload: Vec::with_capacity(capacity),
            rows: 0,
            format,
        }
    }

    fn push(&mut self, data: &[u8], delimiter: &[u8]) {
        match self.format {
            BatchFormat::Values => {
                if !self.payload.is_empty() {
                    self.payload.extend_from_slice(delimiter);
                }
                self.payload.extend_from_slice(data);
                self.rows += 1;
            }
            BatchFormat::LineOriented => {
                if self.payload.last().is_some_and(|b| *b != b'\n') {
                    self.payload.push(b'\n');
                }
                self.payload.extend_from_slice(data);
                let newlines = data.iter().filter(|b| **b == b'\n').count() as u64;
                let unterminated = u64::from(data.last() != Some(&b'\n'));
                self.rows += newlines + unterminated;
            }
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn format(&self) -> BatchFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Hand the payload off without copying
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.payload)
    }
}

/// Concurrent keyed batch accumulator
#[derive(Debug)]
pub struct IngestBuffer {
    batches: Mutex<HashMap<String, PendingBatch>>,
    delimiter: Vec<u8>,
    preallocation: usize,
}

impl IngestBuffer {
    pub fn new(delimiter: impl Into<Vec<u8>>, preallocation: usize) -> Self {
        Self {
            batches: Mutex::new(HashMap::new()),
            delimiter: delimiter.into(),
            preallocation,
        }
    }

    /// Append one request body to the batch for `key`
    ///
    /// Empty bodies leave the buffer untouched.
    pub fn append(&self, key: &str, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        {
            let mut batches = self.batches.lock();
            if let Some(batch) = batches.get_mut(key) {
                batch.push(data, &self.delimiter);
                return;
            }
        }

        let fresh = PendingBatch::new(
            BatchFormat::detect(key),
            self.preallocation.max(data.len()),
        );

        let mut batches = self.batches.lock();
        batches
            .entry(key.to_string())
            .or_insert(fresh)
            .push(data, &self.delimiter);
    }

    /// Swap the live map for an empty one and return what was buffered
    pub fn detach_all(&self) -> HashMap<String, PendingBatch> {
        std::mem::take(&mut *self.batches.lock())
    }

    pub fn pending_keys(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.batches.lock().values().map(PendingBatch::len).sum()
    }
}
