//! Pipeline Statistics
//!
//! Lock-free per-core counters. Each worker writes only its own slot;
//! aggregation reads them without synchronization since the numbers are
//! advisory.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-core stats (cache-line aligned)
#[repr(C, align(64))]
#[derive(Default)]
pub struct CoreStats {
    /// Packets dequeued
    pub rx_packets: AtomicU64,
    /// Bytes dequeued
    pub rx_bytes: AtomicU64,
    /// Packets enqueued downstream
    pub tx_packets: AtomicU64,
    /// Bytes enqueued downstream
    pub tx_bytes: AtomicU64,
    /// Non-empty enqueue bursts
    pub tx_batches: AtomicU64,
    /// Packets marked dropped by the stage
    pub filtered: AtomicU64,
    /// Packets marked dropped after a stage error
    pub stage_errors: AtomicU64,
    /// Packets handed to the accelerator
    pub offloaded: AtomicU64,
}

impl CoreStats {
    /// Count a dequeued burst
    #[inline(always)]
    pub fn record_rx(&self, packets: u64, bytes: u64) {
        self.rx_packets.fetch_add(packets, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count an enqueued burst
    #[inline(always)]
    pub fn record_tx(&self, packets: u64, bytes: u64) {
        self.tx_packets.fetch_add(packets, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count one enqueue burst
    #[inline(always)]
    pub fn record_tx_batch(&self) {
        self.tx_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a filtered packet
    #[inline(always)]
    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a stage error
    #[inline(always)]
    pub fn record_stage_error(&self) {
        self.stage_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an offloaded packet
    #[inline(always)]
    pub fn record_offload(&self) {
        self.offloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> CoreStatsSnapshot {
        CoreStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_batches: self.tx_batches.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            stage_errors: self.stage_errors.load(Ordering::Relaxed),
            offloaded: self.offloaded.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStatsSnapshot {
    /// Packets dequeued
    pub rx_packets: u64,
    /// Bytes dequeued
    pub rx_bytes: u64,
    /// Packets enqueued downstream
    pub tx_packets: u64,
    /// Bytes enqueued downstream
    pub tx_bytes: u64,
    /// Non-empty enqueue bursts
    pub tx_batches: u64,
    /// Packets filtered
    pub filtered: u64,
    /// Stage errors
    pub stage_errors: u64,
    /// Packets offloaded
    pub offloaded: u64,
}

impl CoreStatsSnapshot {
    /// Gbps over `elapsed_secs`
    pub fn throughput_gbps(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 { return 0.0; }
        (self.tx_bytes as f64 * 8.0) / (elapsed_secs * 1_000_000_000.0)
    }

    /// Mpps over `elapsed_secs`
    pub fn packet_rate_mpps(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 { return 0.0; }
        self.tx_packets as f64 / (elapsed_secs * 1_000_000.0)
    }
}

impl AddAssign for CoreStatsSnapshot {
    fn add_assign(&mut self, s: Self) {
        self.rx_packets += s.rx_packets;
        self.rx_bytes += s.rx_bytes;
        self.tx_packets += s.tx_packets;
        self.tx_bytes += s.tx_bytes;
        self.tx_batches += s.tx_batches;
        self.filtered += s.filtered;
        self.stage_errors += s.stage_errors;
        self.offloaded += s.offloaded;
    }
}

/// Aggregate stats across all cores
///
/// Slot 0 belongs to the ingress core; worker `i` owns slot `i + 1`.
pub struct AggregateStats {
    cores: Vec<CoreStats>,
}

impl AggregateStats {
    /// Counters for `num_cores` slots
    pub fn new(num_cores: usize) -> Self {
        let mut cores = Vec::with_capacity(num_cores);
        cores.resize_with(num_cores, CoreStats::default);
        Self { cores }
    }

    /// Slot `idx`
    pub fn core(&self, idx: usize) -> &CoreStats {
        &self.cores[idx]
    }

    /// Number of slots
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    /// Ingress core counters
    pub fn ingress(&self) -> &CoreStats {
        &self.cores[0]
    }

    /// Sum of all worker slots (ingress excluded)
    pub fn workers_total(&self) -> CoreStatsSnapshot {
        let mut total = CoreStatsSnapshot::default();
        for core in self.cores.iter().skip(1) {
            total += core.snapshot();
        }
        total
    }
}

/// Regex accelerator counters for one worker queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegexStats {
    /// Responses without error flags
    pub rx_valid: u64,
    /// Valid responses with at least one match
    pub rx_buf_match_cnt: u64,
    /// Matches reported across valid responses
    pub rx_total_match: u64,
    /// Responses carrying any error flag
    pub rx_invalid: u64,
    /// Scan timeouts
    pub rx_timeout: u64,
    /// Match limit hits
    pub rx_max_match: u64,
    /// Prefix limit hits
    pub rx_max_prefix: u64,
    /// Oversized payloads
    pub rx_resource_limit: u64,
    /// Time the device refused submissions
    pub tx_busy: Duration,
    /// Time spent polling with ops outstanding but none ready
    pub rx_idle: Duration,
}

impl AddAssign for RegexStats {
    fn add_assign(&mut self, s: Self) {
        self.rx_valid += s.rx_valid;
        self.rx_buf_match_cnt += s.rx_buf_match_cnt;
        self.rx_total_match += s.rx_total_match;
        self.rx_invalid += s.rx_invalid;
        self.rx_timeout += s.rx_timeout;
        self.rx_max_match += s.rx_max_match;
        self.rx_max_prefix += s.rx_max_prefix;
        self.rx_resource_limit += s.rx_resource_limit;
        self.tx_busy += s.tx_busy;
        self.rx_idle += s.rx_idle;
    }
}

/// Latency samples kept for percentiles (most recent win)
pub const LATENCY_SAMPLES: usize = 1 << 14;

/// Egress-side latency accumulator
///
/// Fed by the egress core only, so no atomics. Min, max and mean cover
/// every packet; percentiles come from the sample ring.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    packets: u64,
    total: Duration,
    min: Duration,
    max: Duration,
    samples: Vec<Duration>,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self {
            packets: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
            samples: Vec::new(),
        }
    }
}

impl LatencyStats {
    /// Add one packet's latency
    #[inline]
    pub fn record(&mut self, latency: Duration) {
        if self.samples.len() < LATENCY_SAMPLES {
            self.samples.push(latency);
        } else {
            self.samples[(self.packets as usize) & (LATENCY_SAMPLES - 1)] = latency;
        }
        self.packets += 1;
        self.total += latency;
        self.min = self.min.min(latency);
        self.max = self.max.max(latency);
    }

    /// Packets measured
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// `None` until something was measured
    pub fn summary(&self) -> Option<LatencySummary> {
        if self.packets == 0 {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let tail = |permille: usize| sorted[(sorted.len() * permille / 1000).min(sorted.len() - 1)];

        Some(LatencySummary {
            packets: self.packets,
            samples: sorted.len(),
            min: self.min,
            max: self.max,
            mean: Duration::from_nanos((self.total.as_nanos() / self.packets as u128) as u64),
            p90: tail(900),
            p95: tail(950),
            p99: tail(990),
            p999: tail(999),
        })
    }
}

/// Per-packet latency, ingress (or the last `timestamp` stage) to egress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    /// Packets measured
    pub packets: u64,
    /// Samples behind the percentiles
    pub samples: usize,
    /// Fastest packet
    pub min: Duration,
    /// Slowest packet
    pub max: Duration,
    /// Mean over every packet
    pub mean: Duration,
    /// 90th percentile
    pub p90: Duration,
    /// 95th percentile
    pub p95: Duration,
    /// 99th percentile
    pub p99: Duration,
    /// 99.9th percentile
    pub p999: Duration,
}
