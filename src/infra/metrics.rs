//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Totals are monotonic; frame latency statistics reset on each report.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::ReadingSource;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for frame processing latency (microseconds)
/// Buckets: ≤1ms, ≤2ms, ≤4ms, ... ≤512ms, >512ms
const BUCKET_BOUNDS: [u64; 10] =
    [1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000, 512_000];
pub const METRICS_NUM_BUCKETS: usize = 11;

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
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile).ceil() as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] = [
        1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000, 512_000, 1_024_000,
    ];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

#[inline]
fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[inline]
fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Lock-free metrics collector shared by the gate and session loops
pub struct Metrics {
    /// Sensor reads that produced a fresh trimmed mean
    reads_fresh: AtomicU64,
    /// Sensor reads smoothed against the previous value
    reads_smoothed: AtomicU64,
    /// Sensor reads that reused the previous value
    reads_held: AtomicU64,
    /// Sensor reads with no usable value
    reads_none: AtomicU64,
    /// Gate ready events
    gate_triggers: AtomicU64,
    /// Frames successfully pulled from the source
    frames_pulled: AtomicU64,
    /// Cycles where the source had no frame
    frames_empty: AtomicU64,
    /// Frames pulled but skipped by decode_every
    frames_skipped: AtomicU64,
    /// Region proposals accepted for decoding
    regions_proposed: AtomicU64,
    /// Individual (variant, rotation) reader invocations
    decode_attempts: AtomicU64,
    /// Whole-frame fallback decodes
    fallback_decodes: AtomicU64,
    /// Distinct payloads decoded (per frame)
    payloads_decoded: AtomicU64,
    /// Payloads matched against the manifest for the first time
    matched: AtomicU64,
    /// Payloads matching an already-found manifest code
    duplicates: AtomicU64,
    /// Payloads not in the manifest
    not_in_manifest: AtomicU64,
    /// Frame processing latency histogram (reset on report)
    frame_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    frame_latency_sum_us: AtomicU64,
    frame_latency_max_us: AtomicU64,
    frames_since_report: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            reads_fresh: AtomicU64::new(0),
            reads_smoothed: AtomicU64::new(0),
            reads_held: AtomicU64::new(0),
            reads_none: AtomicU64::new(0),
            gate_triggers: AtomicU64::new(0),
            frames_pulled: AtomicU64::new(0),
            frames_empty: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            regions_proposed: AtomicU64::new(0),
            decode_attempts: AtomicU64::new(0),
            fallback_decodes: AtomicU64::new(0),
            payloads_decoded: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            not_in_manifest: AtomicU64::new(0),
            frame_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            frame_latency_sum_us: AtomicU64::new(0),
            frame_latency_max_us: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record the outcome of one sensor read (`None` = no reading)
    #[inline]
    pub fn record_sensor_read(&self, source: Option<ReadingSource>) {
        let counter = match source {
            Some(ReadingSource::Fresh) => &self.reads_fresh,
            Some(ReadingSource::Smoothed) => &self.reads_smoothed,
            Some(ReadingSource::Held) => &self.reads_held,
            None => &self.reads_none,
        };
        bump(counter, 1);
    }

    #[inline]
    pub fn record_gate_trigger(&self) {
        bump(&self.gate_triggers, 1);
    }

    #[inline]
    pub fn record_frame_pulled(&self) {
        bump(&self.frames_pulled, 1);
    }

    #[inline]
    pub fn record_frame_empty(&self) {
        bump(&self.frames_empty, 1);
    }

    #[inline]
    pub fn record_frame_skipped(&self) {
        bump(&self.frames_skipped, 1);
    }

    #[inline]
    pub fn record_regions(&self, count: usize) {
        bump(&self.regions_proposed, count as u64);
    }

    #[inline]
    pub fn record_decode_attempts(&self, attempts: usize) {
        bump(&self.decode_attempts, attempts as u64);
    }

    #[inline]
    pub fn record_fallback_decode(&self) {
        bump(&self.fallback_decodes, 1);
    }

    #[inline]
    pub fn record_payload_decoded(&self) {
        bump(&self.payloads_decoded, 1);
    }

    #[inline]
    pub fn record_match(&self, duplicate: bool) {
        if duplicate {
            bump(&self.duplicates, 1);
        } else {
            bump(&self.matched, 1);
        }
    }

    #[inline]
    pub fn record_not_in_manifest(&self) {
        bump(&self.not_in_manifest, 1);
    }

    /// Record time spent proposing, decoding and matching one frame
    #[inline]
    pub fn record_frame_latency(&self, latency_us: u64) {
        bump(&self.frames_since_report, 1);
        bump(&self.frame_latency_sum_us, latency_us);
        update_atomic_max(&self.frame_latency_max_us, latency_us);
        bump(&self.frame_latency_buckets[bucket_index(latency_us)], 1);
    }

    pub fn frames_pulled(&self) -> u64 {
        load(&self.frames_pulled)
    }

    pub fn matched(&self) -> u64 {
        load(&self.matched)
    }

    /// Produce a summary; latency statistics are swapped to zero
    pub fn report(&self) -> MetricsSummary {
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed().as_secs_f64();
            *last = Instant::now();
            elapsed
        };

        let frames = self.frames_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.frame_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.frame_latency_max_us.swap(0, Ordering::Relaxed);
        let buckets = swap_buckets(&self.frame_latency_buckets);

        MetricsSummary {
            reads_fresh: load(&self.reads_fresh),
            reads_smoothed: load(&self.reads_smoothed),
            reads_held: load(&self.reads_held),
            reads_none: load(&self.reads_none),
            gate_triggers: load(&self.gate_triggers),
            frames_pulled: load(&self.frames_pulled),
            frames_empty: load(&self.frames_empty),
            frames_skipped: load(&self.frames_skipped),
            regions_proposed: load(&self.regions_proposed),
            decode_attempts: load(&self.decode_attempts),
            fallback_decodes: load(&self.fallback_decodes),
            payloads_decoded: load(&self.payloads_decoded),
            matched: load(&self.matched),
            duplicates: load(&self.duplicates),
            not_in_manifest: load(&self.not_in_manifest),
            frames_per_sec: if elapsed_secs > 0.0 { frames as f64 / elapsed_secs } else { 0.0 },
            avg_frame_latency_us: if frames > 0 { latency_sum / frames } else { 0 },
            max_frame_latency_us: latency_max,
            frame_latency_p50_us: percentile_from_buckets(&buckets, 0.50),
            frame_latency_p95_us: percentile_from_buckets(&buckets, 0.95),
            frame_latency_buckets: buckets,
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub reads_fresh: u64,
    pub reads_smoothed: u64,
    pub reads_held: u64,
    pub reads_none: u64,
    pub gate_triggers: u64,
    pub frames_pulled: u64,
    pub frames_empty: u64,
    pub frames_skipped: u64,
    pub regions_proposed: u64,
    pub decode_attempts: u64,
    pub fallback_decodes: u64,
    pub payloads_decoded: u64,
    pub matched: u64,
    pub duplicates: u64,
    pub not_in_manifest: u64,
    pub frames_per_sec: f64,
    pub avg_frame_latency_us: u64,
    pub max_frame_latency_us: u64,
    pub frame_latency_p50_us: u64,
    pub frame_latency_p95_us: u64,
    pub frame_latency_buckets: [u64; METRICS_NUM_BUCKETS],
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            reads_fresh = %self.reads_fresh,
            reads_smoothed = %self.reads_smoothed,
            reads_held = %self.reads_held,
            reads_none = %self.reads_none,
            gate_triggers = %self.gate_triggers,
            frames_pulled = %self.frames_pulled,
            frames_empty = %self.frames_empty,
            frames_skipped = %self.frames_skipped,
            regions = %self.regions_proposed,
            decode_attempts = %self.decode_attempts,
            fallback_decodes = %self.fallback_decodes,
            decoded = %self.payloads_decoded,
            matched = %self.matched,
            duplicates = %self.duplicates,
            not_in_manifest = %self.not_in_manifest,
            fps = %format!("{:.1}", self.frames_per_sec),
            avg_frame_us = %self.avg_frame_latency_us,
            max_frame_us = %self.max_frame_latency_us,
            p50_frame_us = %self.frame_latency_p50_us,
            p95_frame_us = %self.frame_latency_p95_us,
            "metrics"
        );
    }
}
