use a2a_common::protocol::{CircuitState, WorkerId};
use a2a_common::telemetry::{CallOutcome, Operation};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::snapshot::{LatencyMetrics, MetricsSnapshot, OutcomeCounts, WorkerMetrics};

/// Decades covered by the histogram: 1us up to 100s.
const DECADES: usize = 8;
/// Bins per decade, one per leading digit 1-9.
const BINS_PER_DECADE: usize = 9;
const NUM_HISTOGRAM_BINS: usize = DECADES * BINS_PER_DECADE;

/// Logarithmic histogram for percentile estimation.
///
/// Each power of ten is split into nine bins by leading digit, so a sample
/// is placed within ~10% of its value. Recording is a single atomic
/// increment; memory use is constant regardless of sample count.
///
/// # Bin Structure
///
/// - Bins 0-8: 1-9us
/// - Bins 9-17: 10-99us
/// - Bins 18-26: 100-999us
/// - ... up to bins 63-71: 10-99s (everything slower lands in bin 71)
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    /// Running sum for the average
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::latency_to_bin(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_to_bin(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }

        let decade = latency_us.ilog10() as usize;
        if decade >= DECADES {
            return NUM_HISTOGRAM_BINS - 1;
        }
        let leading_digit = (latency_us / 10u64.pow(decade as u32)) as usize;
        decade * BINS_PER_DECADE + leading_digit - 1
    }

    /// Lower bound of a bin in microseconds.
    fn bin_to_latency(bin: usize) -> u64 {
        let decade = (bin / BINS_PER_DECADE) as u32;
        let digit = (bin % BINS_PER_DECADE) as u64 + 1;
        digit * 10u64.pow(decade)
    }

    /// Estimates the value at `percentile` (0-100), interpolating linearly
    /// inside the bin that holds it.
    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile).div_ceil(100)).max(1);
        let mut cumulative = 0;

        for (bin_idx, bin) in self.bins.iter().enumerate() {
            let count = bin.load(Ordering::Relaxed);
            if count > 0 && cumulative + count >= target {
                let start = Self::bin_to_latency(bin_idx);
                let end = Self::bin_to_latency(bin_idx + 1);
                let fraction = (target - cumulative - 1) as f64 / count as f64;
                return start + (fraction * (end - start) as f64) as u64;
            }
            cumulative += count;
        }

        Self::bin_to_latency(NUM_HISTOGRAM_BINS)
    }

    fn snapshot(&self) -> LatencyMetrics {
        let count = self.sample_count.load(Ordering::Relaxed);
        if count == 0 {
            return LatencyMetrics::default();
        }

        LatencyMetrics {
            count,
            avg_us: self.total_latency.load(Ordering::Relaxed) / count,
            p50_us: self.estimate_percentile(50),
            p95_us: self.estimate_percentile(95),
            p99_us: self.estimate_percentile(99),
        }
    }
}

/// Counters for one worker. All lock-free.
#[derive(Debug)]
struct WorkerStats {
    outcomes: [AtomicU64; 6],
    latencies: [LatencyHistogram; 4],
    /// Last breaker state reported, encoded by `encode_state`
    breaker_state: AtomicU8,
    breaker_transitions: AtomicU64,
    times_opened: AtomicU64,
    late_responses: AtomicU64,
}

const STATE_UNKNOWN: u8 = 0;

fn encode_state(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 1,
        CircuitState::Open => 2,
        CircuitState::HalfOpen => 3,
    }
}

fn decode_state(raw: u8) -> Option<CircuitState> {
    match raw {
        1 => Some(CircuitState::Closed),
        2 => Some(CircuitState::Open),
        3 => Some(CircuitState::HalfOpen),
        _ => None,
    }
}

fn outcome_index(outcome: CallOutcome) -> usize {
    match outcome {
        CallOutcome::Pending => 0,
        CallOutcome::Success => 1,
        CallOutcome::Failure => 2,
        CallOutcome::Timeout => 3,
        CallOutcome::CircuitOpen => 4,
        CallOutcome::Expired => 5,
    }
}

fn operation_index(op: Operation) -> usize {
    match op {
        Operation::Send => 0,
        Operation::Probe => 1,
        Operation::QueueWait => 2,
        Operation::FanOut => 3,
    }
}

fn outcome_counts(counters: &[AtomicU64; 6]) -> OutcomeCounts {
    let load = |outcome| counters[outcome_index(outcome)].load(Ordering::Relaxed);
    OutcomeCounts {
        success: load(CallOutcome::Success),
        failure: load(CallOutcome::Failure),
        timeout: load(CallOutcome::Timeout),
        circuit_open: load(CallOutcome::CircuitOpen),
        expired: load(CallOutcome::Expired),
    }
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            outcomes: std::array::from_fn(|_| AtomicU64::new(0)),
            latencies: std::array::from_fn(|_| LatencyHistogram::new()),
            breaker_state: AtomicU8::new(STATE_UNKNOWN),
            breaker_transitions: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
            late_responses: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> WorkerMetrics {
        let latency = |op| self.latencies[operation_index(op)].snapshot();
        WorkerMetrics {
            outcomes: outcome_counts(&self.outcomes),
            send_latency: latency(Operation::Send),
            probe_latency: latency(Operation::Probe),
            queue_wait: latency(Operation::QueueWait),
            fan_out_latency: latency(Operation::FanOut),
            breaker_state: decode_state(self.breaker_state.load(Ordering::Relaxed)),
            breaker_transitions: self.breaker_transitions.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe store for broker metrics.
///
/// Hot-path updates are atomic increments on per-worker stats; the map of
/// workers sits behind an `RwLock` that is only written when a worker is
/// seen for the first time.
#[derive(Debug)]
pub struct MetricsRegistry {
    workers: RwLock<HashMap<WorkerId, Arc<WorkerStats>>>,
    totals: [AtomicU64; 6],
    started_at: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            totals: std::array::from_fn(|_| AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    fn stats(&self, worker: &WorkerId) -> Arc<WorkerStats> {
        {
            let workers = self.workers.read().unwrap_or_else(|p| p.into_inner());
            if let Some(stats) = workers.get(worker) {
                return stats.clone();
            }
        }

        let mut workers = self.workers.write().unwrap_or_else(|p| p.into_inner());
        workers
            .entry(worker.clone())
            .or_insert_with(|| Arc::new(WorkerStats::new()))
            .clone()
    }

    pub fn record_latency(&self, worker: &WorkerId, op: Operation, duration: Duration) {
        let latency_us = duration.as_micros().min(u64::MAX as u128) as u64;
        self.stats(worker).latencies[operation_index(op)].record(latency_us);
    }

    pub fn record_outcome(&self, worker: &WorkerId, outcome: CallOutcome) {
        let idx = outcome_index(outcome);
        self.stats(worker).outcomes[idx].fetch_add(1, Ordering::Relaxed);
        self.totals[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self, worker: &WorkerId, to: CircuitState) {
        let stats = self.stats(worker);
        stats.breaker_state.store(encode_state(to), Ordering::Relaxed);
        stats.breaker_transitions.fetch_add(1, Ordering::Relaxed);
        if to == CircuitState::Open {
            stats.times_opened.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_late_response(&self, worker: &WorkerId) {
        self.stats(worker).late_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let workers: BTreeMap<_, _> = self
            .workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(id, stats)| (id.to_string(), stats.snapshot()))
            .collect();

        MetricsSnapshot {
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            totals: outcome_counts(&self.totals),
            workers,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
