use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use crate::models::{ProbeKind, ResultStatus};

const DURATION_BUCKETS_MS: [u64; 12] = [10, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000, 120_000];

#[derive(Default)]
struct Histogram {
    buckets: [AtomicU64; 13], // one extra "+Inf" bucket
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn observe(&self, value_ms: u64) {
        let idx = DURATION_BUCKETS_MS.iter().position(|b| value_ms <= *b).unwrap_or(DURATION_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<u64>,
    pub sum_ms: u64,
    pub count: u64,
}

/// C7: in-memory counters/histogram per target+kind(+status), plus the
/// service-wide counters named explicitly in §4.7/§5/§4.8. Every counter is
/// a plain atomic; there is no global lock, so a snapshot read may see
/// slightly different instants across counters — acceptable per §5.
pub struct MetricsAggregator {
    started: DashMap<(String, ProbeKind), AtomicU64>,
    results: DashMap<(String, ProbeKind, ResultStatus), AtomicU64>,
    durations: DashMap<(String, ProbeKind), Histogram>,
    heartbeats_total: AtomicU64,
    queue_overflow_total: AtomicU64,
    dropped_events_total: DashMap<String, AtomicU64>,
    start_time: Instant,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self {
            started: DashMap::new(),
            results: DashMap::new(),
            durations: DashMap::new(),
            heartbeats_total: AtomicU64::new(0),
            queue_overflow_total: AtomicU64::new(0),
            dropped_events_total: DashMap::new(),
            start_time: Instant::now(),
        }
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self, target: &str, kind: ProbeKind) {
        self.started.entry((target.to_string(), kind)).or_default().fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result(&self, target: &str, kind: ProbeKind, status: ResultStatus, duration_ms: u64) {
        self.results.entry((target.to_string(), kind, status)).or_default().fetch_add(1, Ordering::Relaxed);
        self.durations.entry((target.to_string(), kind)).or_insert_with(Histogram::default).observe(duration_ms);
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_overflow(&self) {
        self.queue_overflow_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_event(&self, subscriber: &str) {
        self.dropped_events_total.entry(subscriber.to_string()).or_default().fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_events_for(&self, subscriber: &str) -> u64 {
        self.dropped_events_total.get(subscriber).map(|v| v.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Zeros every counter and histogram. Used by tests; not exposed over
    /// the external interface.
    pub fn reset(&self) {
        self.started.clear();
        self.results.clear();
        self.durations.clear();
        self.heartbeats_total.store(0, Ordering::Relaxed);
        self.queue_overflow_total.store(0, Ordering::Relaxed);
        self.dropped_events_total.clear();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            probes_started_total: self
                .started
                .iter()
                .map(|e| (format!("{}:{}", e.key().0, e.key().1.as_str()), e.value().load(Ordering::Relaxed)))
                .collect(),
            probes_result_total: self
                .results
                .iter()
                .map(|e| (format!("{}:{}:{}", e.key().0, e.key().1.as_str(), e.key().2.as_str()), e.value().load(Ordering::Relaxed)))
                .collect(),
            probe_duration_ms: self
                .durations
                .iter()
                .map(|e| (format!("{}:{}", e.key().0, e.key().1.as_str()), e.value().snapshot()))
                .collect(),
            heartbeats_total: self.heartbeats_total.load(Ordering::Relaxed),
            queue_overflow_total: self.queue_overflow_total.load(Ordering::Relaxed),
            dropped_events_total: self
                .dropped_events_total
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub probes_started_total: Vec<(String, u64)>,
    pub probes_result_total: Vec<(String, u64)>,
    pub probe_duration_ms: Vec<(String, HistogramSnapshot)>,
    pub heartbeats_total: u64,
    pub queue_overflow_total: u64,
    pub dropped_events_total: Vec<(String, u64)>,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_and_result_counters_are_independent_per_target_kind() {
        let m = MetricsAggregator::new();
        m.record_started("api", ProbeKind::Http);
        m.record_started("api", ProbeKind::Http);
        m.record_result("api", ProbeKind::Http, ResultStatus::Healthy, 42);

        let snap = m.snapshot();
        let started = snap.probes_started_total.iter().find(|(k, _)| k == "api:http").unwrap().1;
        assert_eq!(started, 2);
        let results = snap.probes_result_total.iter().find(|(k, _)| k == "api:http:healthy").unwrap().1;
        assert_eq!(results, 1);
    }

    #[test]
    fn reset_clears_everything() {
        let m = MetricsAggregator::new();
        m.record_heartbeat();
        m.record_queue_overflow();
        m.reset();
        let snap = m.snapshot();
        assert_eq!(snap.heartbeats_total, 0);
        assert_eq!(snap.queue_overflow_total, 0);
    }

    #[test]
    fn dropped_events_tracked_per_subscriber() {
        let m = MetricsAggregator::new();
        m.record_dropped_event("sub-1");
        m.record_dropped_event("sub-1");
        m.record_dropped_event("sub-2");
        assert_eq!(m.dropped_events_for("sub-1"), 2);
        assert_eq!(m.dropped_events_for("sub-2"), 1);
    }
}
