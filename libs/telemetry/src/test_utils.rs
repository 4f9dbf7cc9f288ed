use crate::{MetricAggregator, Telemetry};
use std::sync::Arc;

/// Telemetry that keeps totals for assertions
#[derive(Debug, Default, Clone)]
pub struct RecordingTelemetry {
    totals: Arc<MetricAggregator>,
    seen: Arc<parking_lot::Mutex<std::collections::HashMap<String, u64>>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total recorded for `name` so far
    pub fn get(&self, name: &str) -> u64 {
        self.seen.lock().get(name).copied().unwrap_or(0)
    }

    /// Drain as the Graphite flush would
    pub fn drain(&self) -> Vec<(String, u64)> {
        self.totals.drain()
    }
}

impl Telemetry for RecordingTelemetry {
    fn increment(&self, name: &str) {
        self.update(name, 1);
    }

    fn update(&self, name: &str, value: u64) {
        self.totals.update(name, value);
        *self.seen.lock().entry(name.to_string()).or_insert(0) += value;
    }
}
