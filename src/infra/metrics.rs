//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations so the scan loop and the detector
//! tasks never contend on a mutex. Reporting swaps the periodic counters.
//!
//! NOTE: Relaxed ordering throughout. These are statistical counters only;
//! nothing may branch on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Upper bound of each latency bucket in microseconds. The final bucket
/// is open-ended and reports twice the previous bound.
const BUCKET_UPPER_US: [u64; NUM_BUCKETS] =
    [500, 1000, 2000, 4000, 8000, 16000, 32000, 64000, 128000, 256000, 512000];
const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_UPPER_US[..NUM_BUCKETS - 1].partition_point(|&bound| bound < latency_us)
}

/// Decode latency since the last report
struct LatencyHistogram {
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
    buckets: [AtomicU64; NUM_BUCKETS],
}

/// Drained contents of a `LatencyHistogram`
struct LatencyWindow {
    count: u64,
    sum_us: u64,
    max_us: u64,
    buckets: [u64; NUM_BUCKETS],
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    fn record(&self, latency_us: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
        self.buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    /// Take the window and start a fresh one
    fn drain(&self) -> LatencyWindow {
        LatencyWindow {
            count: self.count.swap(0, Ordering::Relaxed),
            sum_us: self.sum_us.swap(0, Ordering::Relaxed),
            max_us: self.max_us.swap(0, Ordering::Relaxed),
            buckets: std::array::from_fn(|i| self.buckets[i].swap(0, Ordering::Relaxed)),
        }
    }
}

impl LatencyWindow {
    fn avg_us(&self) -> u64 {
        self.sum_us.checked_div(self.count).unwrap_or(0)
    }

    /// Upper bound of the bucket holding quantile `q`, 0 for an empty window
    fn quantile_us(&self, q: f64) -> u64 {
        let total: u64 = self.buckets.iter().sum();
        if total == 0 {
            return 0;
        }
        let rank = ((total as f64 * q).ceil() as u64).max(1);
        let mut seen = 0u64;
        self.buckets
            .iter()
            .zip(BUCKET_UPPER_US)
            .find_map(|(&count, bound)| {
                seen += count;
                (seen >= rank).then_some(bound)
            })
            .unwrap_or(BUCKET_UPPER_US[NUM_BUCKETS - 1])
    }
}

/// Lock-free metrics collector shared by the scan loop and detector tasks
pub struct Metrics {
    /// Scan loop ticks (monotonic)
    ticks_total: AtomicU64,
    /// Decode attempts, both strategies (monotonic)
    decode_attempts_total: AtomicU64,
    decode_latency: LatencyHistogram,
    /// Transient decode failures (monotonic)
    decode_failures_total: AtomicU64,
    /// Payloads extracted from frames (monotonic)
    payloads_total: AtomicU64,
    /// Payloads ignored as repeats of the held badge (monotonic)
    duplicates_suppressed: AtomicU64,
    /// Detector results dropped for an old session/epoch (monotonic)
    stale_detections_dropped: AtomicU64,
    /// Ticks skipped because the detector was saturated (monotonic)
    detections_skipped: AtomicU64,
    /// Detector calls currently running (gauge)
    detections_in_flight: AtomicU64,
    /// Participants matched (monotonic)
    found_total: AtomicU64,
    /// Payloads that matched nobody (monotonic)
    not_found_total: AtomicU64,
    /// Updates dropped because the presentation layer lagged (monotonic)
    updates_dropped: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            decode_attempts_total: AtomicU64::new(0),
            decode_latency: LatencyHistogram::new(),
            decode_failures_total: AtomicU64::new(0),
            payloads_total: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            stale_detections_dropped: AtomicU64::new(0),
            detections_skipped: AtomicU64::new(0),
            detections_in_flight: AtomicU64::new(0),
            found_total: AtomicU64::new(0),
            not_found_total: AtomicU64::new(0),
            updates_dropped: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_tick(&self) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one decode attempt and its latency (lock-free)
    #[inline]
    pub fn record_decode_attempt(&self, latency_us: u64) {
        self.decode_attempts_total.fetch_add(1, Ordering::Relaxed);
        self.decode_latency.record(latency_us);
    }

    #[inline]
    pub fn record_decode_failure(&self) {
        self.decode_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_payload(&self) {
        self.payloads_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_detection(&self) {
        self.stale_detections_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_detection_skipped(&self) {
        self.detections_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn detection_started(&self) {
        self.detections_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn detection_finished(&self) {
        // Saturating: a gauge must never wrap
        let _ = self.detections_in_flight.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    #[inline]
    pub fn record_match(&self, found: bool) {
        if found {
            self.found_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.not_found_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_update_dropped(&self) {
        self.updates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decode_attempts_total(&self) -> u64 {
        self.decode_attempts_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn duplicates_suppressed(&self) -> u64 {
        self.duplicates_suppressed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn stale_detections_dropped(&self) -> u64 {
        self.stale_detections_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn detections_in_flight(&self) -> u64 {
        self.detections_in_flight.load(Ordering::Relaxed)
    }

    /// Generate a summary report, resetting the periodic counters
    pub fn report(&self) -> MetricsSummary {
        let window = self.decode_latency.drain();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let attempts_per_sec = if elapsed.as_secs_f64() > 0.0 {
            window.count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            decode_attempts_total: self.decode_attempts_total.load(Ordering::Relaxed),
            decode_attempts_per_sec: attempts_per_sec,
            decode_avg_us: window.avg_us(),
            decode_max_us: window.max_us,
            decode_p50_us: window.quantile_us(0.50),
            decode_p95_us: window.quantile_us(0.95),
            decode_p99_us: window.quantile_us(0.99),
            decode_buckets: window.buckets,
            decode_failures_total: self.decode_failures_total.load(Ordering::Relaxed),
            payloads_total: self.payloads_total.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            stale_detections_dropped: self.stale_detections_dropped.load(Ordering::Relaxed),
            detections_skipped: self.detections_skipped.load(Ordering::Relaxed),
            detections_in_flight: self.detections_in_flight.load(Ordering::Relaxed),
            found_total: self.found_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            updates_dropped: self.updates_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub ticks_total: u64,
    pub decode_attempts_total: u64,
    pub decode_attempts_per_sec: f64,
    pub decode_avg_us: u64,
    pub decode_max_us: u64,
    /// Bounds: ≤500, ≤1000, ... ≤256000, >256000 µs
    pub decode_buckets: [u64; NUM_BUCKETS],
    pub decode_p50_us: u64,
    pub decode_p95_us: u64,
    pub decode_p99_us: u64,
    pub decode_failures_total: u64,
    pub payloads_total: u64,
    pub duplicates_suppressed: u64,
    pub stale_detections_dropped: u64,
    pub detections_skipped: u64,
    pub detections_in_flight: u64,
    pub found_total: u64,
    pub not_found_total: u64,
    pub updates_dropped: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            ticks = %self.ticks_total,
            decode_attempts = %self.decode_attempts_total,
            decode_per_sec = format!("{:.1}", self.decode_attempts_per_sec),
            decode_avg_us = %self.decode_avg_us,
            decode_max_us = %self.decode_max_us,
            p50_us = %self.decode_p50_us,
            p95_us = %self.decode_p95_us,
            p99_us = %self.decode_p99_us,
            payloads = %self.payloads_total,
            duplicates = %self.duplicates_suppressed,
            stale = %self.stale_detections_dropped,
            skipped = %self.detections_skipped,
            in_flight = %self.detections_in_flight,
            found = %self.found_total,
            not_found = %self.not_found_total,
            updates_dropped = %self.updates_dropped,
            "metrics"
        );
    }
}
