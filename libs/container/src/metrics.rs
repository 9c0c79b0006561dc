//! Container Runtime Metrics
//!
//! Lock-free counters over the request pipeline, recorded only when the
//! `stats` start option is on. Purely observational; routing never reads
//! them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Atomic counters over the request pipeline.
#[derive(Debug, Default)]
pub struct ContainerMetrics {
    enabled: AtomicBool,
    requests_sent: AtomicU64,
    requests_delivered: AtomicU64,
    responses_sent: AtomicU64,
    responses_received: AtomicU64,
    drops: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    searches: AtomicU64,
}

/// Point-in-time snapshot of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub requests_sent: u64,
    pub requests_delivered: u64,
    pub responses_sent: u64,
    pub responses_received: u64,
    pub drops: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub searches: u64,
}

impl ContainerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    fn bump(&self, counter: &AtomicU64) {
        if self.enabled.load(Ordering::Relaxed) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_send(&self) {
        self.bump(&self.requests_sent);
    }

    pub fn record_delivery(&self) {
        self.bump(&self.requests_delivered);
    }

    pub fn record_response_sent(&self) {
        self.bump(&self.responses_sent);
    }

    pub fn record_response_received(&self) {
        self.bump(&self.responses_received);
    }

    pub fn record_drop(&self) {
        self.bump(&self.drops);
    }

    pub fn record_retry(&self) {
        self.bump(&self.retries);
    }

    pub fn record_timeout(&self) {
        self.bump(&self.timeouts);
    }

    pub fn record_search(&self) {
        self.bump(&self.searches);
    }

    pub fn snapshot(&self) -> ContainerStats {
        ContainerStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_delivered: self.requests_delivered.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_metrics_stay_flat() {
        let metrics = ContainerMetrics::new();
        metrics.record_send();
        metrics.record_timeout();
        assert_eq!(metrics.snapshot(), ContainerStats::default());
    }

    #[test]
    fn enabled_metrics_count() {
        let metrics = ContainerMetrics::new();
        metrics.set_enabled(true);
        metrics.record_send();
        metrics.record_send();
        metrics.record_response_received();
        let stats = metrics.snapshot();
        assert_eq!(stats.requests_sent, 2);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.drops, 0);
    }
}
