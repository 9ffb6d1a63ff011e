//! Throughput and latency of finalized transactions
//!
//! [`PerformanceMonitor`] only observes: it is fed committed batches through
//! [`FinalityListener`] and reads ledger and engine statistics for reports.
//! Each payload reference of a finalized node counts as one transaction.

use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::MetricsConfig;
use crate::consensus::{ConsensusEngine, ConsensusStats, FinalityListener, FinalizedBatch};
use crate::dag::{DagLedger, DagStatistics};
use crate::error::{Result, SdupiError};
use crate::types::{Timestamp, now_millis};

/// Shortest span used as the TPS denominator
const MIN_TPS_SPAN_MS: i64 = 1_000;

#[derive(Debug, Clone, Copy)]
struct FinalitySample {
    finalized_at: Timestamp,
    latency_ms: u64,
}

/// Interpolated latency percentile.
///
/// `low_confidence` is set when the window holds fewer samples than needed
/// to resolve the requested percentile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentileEstimate {
    pub percentile: f64,
    pub value_ms: f64,
    pub samples: usize,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub generated_at: Timestamp,
    pub tps: f64,
    pub peak_tps: f64,
    pub average_latency_ms: f64,
    pub p50: PercentileEstimate,
    pub p95: PercentileEstimate,
    pub p99: PercentileEstimate,
    pub window_samples: usize,
    pub total_finalized: u64,
    pub ledger: DagStatistics,
    pub consensus: ConsensusStats,
}

#[derive(Default)]
struct Window {
    samples: VecDeque<FinalitySample>,
    peak_tps: f64,
    total_finalized: u64,
}

/// Sliding-window performance monitor
pub struct PerformanceMonitor {
    config: MetricsConfig,
    window: RwLock<Window>,
}

impl PerformanceMonitor {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            window: RwLock::new(Window::default()),
        }
    }

    /// Record `count` transactions of one node, finalized at `finalized_at`
    pub fn record_finalized(&self, finalized_at: Timestamp, created_at: Timestamp, count: usize) {
        if count == 0 {
            return;
        }
        let latency_ms = u64::try_from(finalized_at - created_at).unwrap_or(0);

        let mut window = self.window.write();
        for _ in 0..count {
            window.samples.push_back(FinalitySample {
                finalized_at,
                latency_ms,
            });
        }
        window.total_finalized += count as u64;
        self.evict(&mut window, finalized_at);

        let tps = Self::tps_of(window.samples.iter());
        if tps > window.peak_tps {
            window.peak_tps = tps;
        }
    }

    /// Finalized transactions per second over the current window, 0 when empty
    pub fn compute_tps(&self) -> f64 {
        self.compute_tps_at(now_millis())
    }

    /// TPS over the samples still inside the window at `now`
    pub fn compute_tps_at(&self, now: Timestamp) -> f64 {
        let window = self.window.read();
        let cutoff = now - self.config.window_ms as i64;
        Self::tps_of(window.samples.iter().filter(|s| s.finalized_at > cutoff))
    }

    /// Highest TPS ever observed; never decreases
    pub fn peak_tps(&self) -> f64 {
        self.window.read().peak_tps
    }

    pub fn total_finalized(&self) -> u64 {
        self.window.read().total_finalized
    }

    pub fn sample_count(&self) -> usize {
        self.window.read().samples.len()
    }

    pub fn average_latency_ms(&self) -> f64 {
        let window = self.window.read();
        if window.samples.is_empty() {
            return 0.0;
        }
        let sum: u128 = window.samples.iter().map(|s| u128::from(s.latency_ms)).sum();
        sum as f64 / window.samples.len() as f64
    }

    /// Latency at percentile `p` (0..=100), linearly interpolated between
    /// the closest ranks. An empty window yields 0 flagged low-confidence.
    pub fn compute_latency_percentile(&self, p: f64) -> Result<PercentileEstimate> {
        if !p.is_finite() || !(0.0..=100.0).contains(&p) {
            return Err(SdupiError::Validation(format!(
                "percentile must be within 0..=100, got {}",
                p
            )));
        }

        let mut latencies: Vec<u64> = self.window.read().samples.iter().map(|s| s.latency_ms).collect();
        let samples = latencies.len();
        if samples == 0 {
            return Ok(PercentileEstimate {
                percentile: p,
                value_ms: 0.0,
                samples,
                low_confidence: true,
            });
        }
        latencies.sort_unstable();

        let rank = p / 100.0 * (samples - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        let fraction = rank - lower as f64;
        let value_ms =
            latencies[lower] as f64 + (latencies[upper] as f64 - latencies[lower] as f64) * fraction;

        Ok(PercentileEstimate {
            percentile: p,
            value_ms,
            samples,
            low_confidence: samples < self.config.min_percentile_samples
                || samples < required_samples(p),
        })
    }

    pub fn report(&self, ledger: &DagLedger, engine: &ConsensusEngine) -> Result<PerformanceReport> {
        Ok(PerformanceReport {
            generated_at: now_millis(),
            tps: self.compute_tps(),
            peak_tps: self.peak_tps(),
            average_latency_ms: self.average_latency_ms(),
            p50: self.compute_latency_percentile(50.0)?,
            p95: self.compute_latency_percentile(95.0)?,
            p99: self.compute_latency_percentile(99.0)?,
            window_samples: self.sample_count(),
            total_finalized: self.total_finalized(),
            ledger: ledger.get_statistics(),
            consensus: engine.get_consensus_stats(),
        })
    }

    fn evict(&self, window: &mut Window, newest: Timestamp) {
        let cutoff = newest - self.config.window_ms as i64;
        while let Some(front) = window.samples.front() {
            if window.samples.len() > self.config.window_size || front.finalized_at <= cutoff {
                window.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn tps_of<'a>(samples: impl Iterator<Item = &'a FinalitySample>) -> f64 {
        let mut count = 0usize;
        let mut oldest = Timestamp::MAX;
        let mut newest = Timestamp::MIN;
        for sample in samples {
            count += 1;
            oldest = oldest.min(sample.finalized_at);
            newest = newest.max(sample.finalized_at);
        }
        if count == 0 {
            return 0.0;
        }
        let span_ms = (newest - oldest).max(MIN_TPS_SPAN_MS);
        count as f64 * 1000.0 / span_ms as f64
    }
}

/// Samples needed before the tail holding `p` has at least one observation
fn required_samples(p: f64) -> usize {
    let tail = p.min(100.0 - p);
    if tail <= 0.0 {
        return 1;
    }
    (100.0 / tail).ceil() as usize
}

impl FinalityListener for PerformanceMonitor {
    fn on_finalized(&self, batch: &FinalizedBatch) {
        for node in &batch.nodes {
            self.record_finalized(batch.committed_at, node.created_at, node.payload_count);
        }
        tracing::debug!(
            "Recorded {} finalized nodes from round {}",
            batch.nodes.len(),
            batch.round_id
        );
    }
}
