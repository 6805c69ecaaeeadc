//! Placement metrics
//!
//! Counters and gauges for the control loops plus a latency histogram for
//! check passes, rendered in Prometheus text format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for check pass durations (in milliseconds)
const PASS_BUCKETS: [f64; 10] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0, 5000.0, 30000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default pass buckets
    pub fn new() -> Self {
        Self::with_buckets(&PASS_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as microseconds for precision
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, last entry is +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics owned by one coordinator instance
#[derive(Debug)]
pub struct PlacementMetrics {
    pub check_passes: Counter,
    pub check_passes_skipped: Counter,
    pub check_passes_stale: Counter,
    pub check_requests_dropped: Counter,
    pub check_pass_duration: Histogram,

    pub migrations: Counter,
    pub evictions: Counter,
    pub replicas_added: Counter,
    pub replicas_removed: Counter,
    pub update_conflicts: Counter,
    pub balance_moves: Counter,

    pub leader_transitions: Counter,
    pub membership_epoch: Gauge,
    pub live_nodes: Gauge,
    pub removing_nodes: Gauge,

    start_time: Instant,
}

impl PlacementMetrics {
    pub fn new() -> Self {
        Self {
            check_passes: Counter::new(),
            check_passes_skipped: Counter::new(),
            check_passes_stale: Counter::new(),
            check_requests_dropped: Counter::new(),
            check_pass_duration: Histogram::new(),
            migrations: Counter::new(),
            evictions: Counter::new(),
            replicas_added: Counter::new(),
            replicas_removed: Counter::new(),
            update_conflicts: Counter::new(),
            balance_moves: Counter::new(),
            leader_transitions: Counter::new(),
            membership_epoch: Gauge::new(),
            live_nodes: Gauge::new(),
            removing_nodes: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Record the duration of a completed check pass
    pub fn record_check_pass(&self, duration: Duration) {
        self.check_passes.inc();
        self.check_pass_duration
            .observe(duration.as_secs_f64() * 1000.0);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("check_passes_total", "Completed namespace check passes", &self.check_passes),
            ("check_passes_skipped_total", "Check triggers skipped while a pass was running", &self.check_passes_skipped),
            ("check_passes_stale_total", "Check passes aborted on membership change", &self.check_passes_stale),
            ("check_requests_dropped_total", "On-demand check requests dropped on a full queue", &self.check_requests_dropped),
            ("migrations_total", "Partition migrations executed", &self.migrations),
            ("evictions_total", "Replicas evicted from over-replicated partitions", &self.evictions),
            ("replicas_added_total", "Replicas added to partitions", &self.replicas_added),
            ("replicas_removed_total", "Replicas removed from partitions", &self.replicas_removed),
            ("update_conflicts_total", "Replica updates rejected by the register", &self.update_conflicts),
            ("balance_moves_total", "Replicas moved by the rebalancer", &self.balance_moves),
            ("leader_transitions_total", "Leadership transitions observed", &self.leader_transitions),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP minikv_pd_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minikv_pd_{} counter", name);
            let _ = writeln!(out, "minikv_pd_{} {}", name, counter.get());
        }

        let gauges = [
            ("membership_epoch", "Current membership epoch", self.membership_epoch.get()),
            ("live_nodes", "Live data nodes", self.live_nodes.get()),
            ("removing_nodes", "Nodes being drained", self.removing_nodes.get()),
            ("uptime_seconds", "Coordinator uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP minikv_pd_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minikv_pd_{} gauge", name);
            let _ = writeln!(out, "minikv_pd_{} {}", name, value);
        }

        out.push_str("# HELP minikv_pd_check_pass_duration_ms Check pass duration in milliseconds\n");
        out.push_str("# TYPE minikv_pd_check_pass_duration_ms histogram\n");
        for (le, count) in self.check_pass_duration.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "minikv_pd_check_pass_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "minikv_pd_check_pass_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "minikv_pd_check_pass_duration_ms_sum {}", self.check_pass_duration.sum());
        let _ = writeln!(out, "minikv_pd_check_pass_duration_ms_count {}", self.check_pass_duration.count());

        out
    }
}

impl Default for PlacementMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50_000.0);

        assert_eq!(hist.count(), 3);

        let buckets = hist.get_buckets();
        assert_eq!(buckets.last().unwrap().1, 3);
        // 5ms lands in the le=5 bucket
        assert_eq!(buckets[1], (5.0, 1));
    }

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::new();
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = PlacementMetrics::new();
        metrics.migrations.inc();
        metrics.membership_epoch.set(6);
        metrics.record_check_pass(Duration::from_millis(12));

        let out = metrics.to_prometheus();
        assert!(out.contains("minikv_pd_migrations_total 1"));
        assert!(out.contains("minikv_pd_membership_epoch 6"));
        assert!(out.contains("minikv_pd_check_passes_total 1"));
        assert!(out.contains("minikv_pd_check_pass_duration_ms_count 1"));
    }
}
