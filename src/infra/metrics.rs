//! Lock-free runtime metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total ticks ever processed across all sessions (monotonic)
    ticks_total: AtomicU64,
    /// Ticks since last report (reset on report)
    ticks_since_report: AtomicU64,
    /// Sum of tick latencies in microseconds (reset on report)
    tick_latency_sum_us: AtomicU64,
    /// Max tick latency in microseconds (reset on report)
    tick_latency_max_us: AtomicU64,
    /// Tick processing latency histogram buckets (reset on report)
    tick_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sessions started (monotonic)
    sessions_started: AtomicU64,
    /// Sessions stopped (monotonic)
    sessions_stopped: AtomicU64,
    /// Subscribers attached (monotonic)
    subscribers_attached: AtomicU64,
    /// Subscribers dropped for lagging or disconnecting (monotonic)
    subscribers_dropped: AtomicU64,
    /// Gate crossings recorded (monotonic)
    crossings_total: AtomicU64,
    /// Anomaly events emitted (monotonic)
    anomalies_total: AtomicU64,
    /// Alerts created (monotonic)
    alerts_total: AtomicU64,
    /// Upstream source failures observed (monotonic)
    source_errors_total: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            ticks_since_report: AtomicU64::new(0),
            tick_latency_sum_us: AtomicU64::new(0),
            tick_latency_max_us: AtomicU64::new(0),
            tick_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sessions_started: AtomicU64::new(0),
            sessions_stopped: AtomicU64::new(0),
            subscribers_attached: AtomicU64::new(0),
            subscribers_dropped: AtomicU64::new(0),
            crossings_total: AtomicU64::new(0),
            anomalies_total: AtomicU64::new(0),
            alerts_total: AtomicU64::new(0),
            source_errors_total: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Record a completed tick with its processing latency (lock-free)
    #[inline]
    pub fn record_tick(&self, latency_us: u64) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.ticks_since_report.fetch_add(1, Ordering::Relaxed);
        self.tick_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.tick_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.tick_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_stopped(&self) {
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscriber_attached(&self) {
        self.subscribers_attached.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscriber_dropped(&self) {
        self.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_crossings(&self, count: u64) {
        if count > 0 {
            self.crossings_total.fetch_add(count, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_anomalies(&self, count: u64) {
        if count > 0 {
            self.anomalies_total.fetch_add(count, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_alert_created(&self) {
        self.alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_source_error(&self) {
        self.source_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total ticks processed
    #[inline]
    pub fn ticks_total(&self) -> u64 {
        self.ticks_total.load(Ordering::Relaxed)
    }

    /// Get subscribers dropped total
    #[inline]
    pub fn subscribers_dropped(&self) -> u64 {
        self.subscribers_dropped.load(Ordering::Relaxed)
    }

    /// Currently active session count (started minus stopped)
    #[inline]
    pub fn sessions_active(&self) -> u64 {
        self.sessions_started
            .load(Ordering::Relaxed)
            .saturating_sub(self.sessions_stopped.load(Ordering::Relaxed))
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let ticks_count = self.ticks_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.tick_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.tick_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.tick_latency_buckets);

        let ticks_total = self.ticks_total.load(Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let ticks_per_sec = if elapsed.as_secs_f64() > 0.0 {
            ticks_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if ticks_count > 0 { latency_sum / ticks_count } else { 0 };

        MetricsSummary {
            ticks_total,
            ticks_per_sec,
            avg_tick_latency_us: avg_latency,
            max_tick_latency_us: max_latency,
            tick_lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            tick_lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            tick_lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            sessions_active: self.sessions_active(),
            subscribers_attached: self.subscribers_attached.load(Ordering::Relaxed),
            subscribers_dropped: self.subscribers_dropped.load(Ordering::Relaxed),
            crossings_total: self.crossings_total.load(Ordering::Relaxed),
            anomalies_total: self.anomalies_total.load(Ordering::Relaxed),
            alerts_total: self.alerts_total.load(Ordering::Relaxed),
            source_errors_total: self.source_errors_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub ticks_total: u64,
    pub ticks_per_sec: f64,
    pub avg_tick_latency_us: u64,
    pub max_tick_latency_us: u64,
    /// 50th percentile tick latency (µs)
    pub tick_lat_p50_us: u64,
    /// 95th percentile tick latency (µs)
    pub tick_lat_p95_us: u64,
    /// 99th percentile tick latency (µs)
    pub tick_lat_p99_us: u64,
    pub sessions_active: u64,
    pub subscribers_attached: u64,
    pub subscribers_dropped: u64,
    pub crossings_total: u64,
    pub anomalies_total: u64,
    pub alerts_total: u64,
    pub source_errors_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            ticks_total = %self.ticks_total,
            ticks_per_sec = format!("{:.1}", self.ticks_per_sec),
            avg_latency_us = %self.avg_tick_latency_us,
            max_latency_us = %self.max_tick_latency_us,
            p50_us = %self.tick_lat_p50_us,
            p95_us = %self.tick_lat_p95_us,
            p99_us = %self.tick_lat_p99_us,
            sessions = %self.sessions_active,
            subs_dropped = %self.subscribers_dropped,
            crossings = %self.crossings_total,
            anomalies = %self.anomalies_total,
            alerts = %self.alerts_total,
            "metrics"
        );
    }
}
