//! In-memory metric aggregation between flushes

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::names;

/// Sums counters until drained
#[derive(Debug, Default)]
pub struct MetricAggregator {
    storage: Mutex<HashMap<String, u64>>,
}

impl MetricAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str) {
        self.update(name, 1);
    }

    /// Add `value` to the running total for `name`
    pub fn update(&self, name: &str, value: u64) {
        let mut storage = self.storage.lock();
        match storage.get_mut(name) {
            Some(total) => *total = total.saturating_add(value),
            None => {
                storage.insert(name.to_string(), value);
            }
        }
    }

    /// Take every total accumulated since the previous drain
    ///
    /// Byte and duration totals are folded into a single throughput ratio,
    /// emitted only when both are non-zero.
    pub fn drain(&self) -> Vec<(String, u64)> {
        let mut storage = std::mem::take(&mut *self.storage.lock());

        let bytes = storage.remove(names::BYTES_SENT).unwrap_or(0);
        let millis = storage.remove(names::SEND_DURATION_MS).unwrap_or(0);

        let mut out: Vec<(String, u64)> = storage.into_iter().collect();
        if bytes != 0 && millis != 0 {
            out.push((names::BYTES_TO_MILLISECONDS.to_string(), bytes / millis));
        }
        out.sort();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.storage.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_update_accumulate() {
        let agg = MetricAggregator::new();
        agg.increment(names::RECEIVE);
        agg.increment(names::RECEIVE);
        agg.update(names::ROWS, 10);
        agg.update(names::ROWS, 5);

        assert_eq!(
            agg.drain(),
            vec![(names::RECEIVE.to_string(), 2), (names::ROWS.to_string(), 15)]
        );
        assert!(agg.is_empty());
        assert!(agg.drain().is_empty());
    }

    #[test]
    fn test_throughput_ratio() {
        let agg = MetricAggregator::new();
        agg.update(names::BYTES_SENT, 1000);
        agg.update(names::SEND_DURATION_MS, 4);

        assert_eq!(
            agg.drain(),
            vec![(names::BYTES_TO_MILLISECONDS.to_string(), 250)]
        );
    }

    #[test]
    fn test_ratio_skipped_without_duration() {
        let agg = MetricAggregator::new();
        agg.update(names::BYTES_SENT, 1000);
        assert!(agg.drain().is_empty());
    }
}
