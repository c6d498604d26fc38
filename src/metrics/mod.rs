//! Business counters.
//!
//! Services record through a [`MetricsSink`] handed to them at construction.
//! Production uses the `metrics` facade; tests use [`InMemoryMetrics`] and
//! read the counts back.

use std::sync::Arc;

use dashmap::DashMap;

pub const CHECKOUT_STARTED: &str = "checkout_started_total";
pub const PAYMENT_APPROVED: &str = "payment_approved_total";
pub const RESERVATION_CONSUMED: &str = "reservation_consumed_total";
pub const RESERVATION_RELEASED: &str = "reservation_released_total";
pub const ADDRESS_SELECT_SUCCESS: &str = "checkout.address.select.success";
pub const ADDRESS_CONFIRM_SUCCESS: &str = "checkout.address.confirm.success";
pub const WEBHOOK_REJECTED: &str = "payment_webhook_rejected_total";

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, value: u64);
}

/// Forwards to whatever recorder is installed for the `metrics` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsRecorderSink;

impl MetricsSink for MetricsRecorderSink {
    fn increment(&self, name: &'static str, value: u64) {
        ::metrics::counter!(name, value);
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryMetrics {
    counters: Arc<DashMap<&'static str, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &'static str, value: u64) {
        *self.counters.entry(name).or_insert(0) += value;
    }
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

pub fn recorder() -> SharedMetrics {
    Arc::new(MetricsRecorderSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_metrics_accumulate() {
        let m = InMemoryMetrics::new();
        m.increment(CHECKOUT_STARTED, 1);
        m.increment(CHECKOUT_STARTED, 2);
        assert_eq!(m.get(CHECKOUT_STARTED), 3);
        assert_eq!(m.get(PAYMENT_APPROVED), 0);
    }

    #[test]
    fn recorder_sink_is_a_noop_without_recorder() {
        recorder().increment(WEBHOOK_REJECTED, 1);
    }
}
