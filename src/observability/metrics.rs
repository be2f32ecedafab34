// =============================================================================
// Metrics Service — signal counters, rejection histogram, latency series
// =============================================================================
//
// Signal acceptance/rejection counts (with a per-reason histogram) and
// latency series for signal processing, decisioning, and execution, each
// summarized as avg/min/max/p50/p95/p99 over a capped window. Position
// aggregates come from the store and are composed at the API layer.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

/// Samples retained per latency series.
const LATENCY_WINDOW: usize = 1024;

/// Tracked latency series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyKind {
    SignalProcessing,
    Decision,
    Execution,
}

impl LatencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignalProcessing => "signal_processing",
            Self::Decision => "decision",
            Self::Execution => "execution",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalMetrics {
    pub accepted: u64,
    pub rejected: u64,
    /// accepted / (accepted + rejected), in [0, 1].
    pub acceptance_rate: f64,
    pub rejection_reasons: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

pub struct MetricsService {
    accepted: AtomicU64,
    rejected: AtomicU64,
    rejection_reasons: RwLock<HashMap<String, u64>>,
    latencies: RwLock<HashMap<LatencyKind, Vec<f64>>>,
}

impl MetricsService {
    pub fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            rejection_reasons: RwLock::new(HashMap::new()),
            latencies: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_signal_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_rejected(&self, reason: &str) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        *self
            .rejection_reasons
            .write()
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_latency(&self, kind: LatencyKind, millis: f64) {
        let mut latencies = self.latencies.write();
        let series = latencies.entry(kind).or_default();
        if series.len() >= LATENCY_WINDOW {
            series.remove(0);
        }
        series.push(millis);
    }

    pub fn signal_metrics(&self) -> SignalMetrics {
        let accepted = self.accepted.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let total = accepted + rejected;
        SignalMetrics {
            accepted,
            rejected,
            acceptance_rate: if total > 0 {
                accepted as f64 / total as f64
            } else {
                0.0
            },
            rejection_reasons: self.rejection_reasons.read().clone(),
        }
    }

    pub fn latency_metrics(&self) -> HashMap<&'static str, LatencySummary> {
        let latencies = self.latencies.read();
        let mut out = HashMap::new();
        for (kind, series) in latencies.iter() {
            if let Some(summary) = summarize(series) {
                out.insert(kind.as_str(), summary);
            }
        }
        out
    }
}

fn summarize(series: &[f64]) -> Option<LatencySummary> {
    if series.is_empty() {
        return None;
    }
    let mut sorted = series.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    Some(LatencySummary {
        count,
        avg_ms: sum / count as f64,
        min_ms: sorted[0],
        max_ms: sorted[count - 1],
        p50_ms: percentile(&sorted, 0.50),
        p95_ms: percentile(&sorted, 0.95),
        p99_ms: percentile(&sorted, 0.99),
    })
}

/// Nearest-rank percentile over an ascending slice.
fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    let rank = ((sorted.len() as f64 * fraction).ceil() as usize).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

impl Default for MetricsService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let signals = self.signal_metrics();
        f.debug_struct("MetricsService")
            .field("accepted", &signals.accepted)
            .field("rejected", &signals.rejected)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_rate_bounded_and_reasons_sum() {
        let metrics = MetricsService::new();
        assert!((metrics.signal_metrics().acceptance_rate - 0.0).abs() < f64::EPSILON);

        metrics.record_signal_accepted();
        metrics.record_signal_accepted();
        metrics.record_signal_rejected("duplicate");
        metrics.record_signal_rejected("stale_signal");
        metrics.record_signal_rejected("duplicate");

        let snapshot = metrics.signal_metrics();
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.rejected, 3);
        assert!((snapshot.acceptance_rate - 0.4).abs() < f64::EPSILON);
        assert!((0.0..=1.0).contains(&snapshot.acceptance_rate));

        let reason_total: u64 = snapshot.rejection_reasons.values().sum();
        assert_eq!(reason_total, snapshot.rejected);
        assert_eq!(snapshot.rejection_reasons["duplicate"], 2);
    }

    #[test]
    fn latency_percentiles() {
        let metrics = MetricsService::new();
        for ms in 1..=100 {
            metrics.record_latency(LatencyKind::Decision, ms as f64);
        }

        let summary = &metrics.latency_metrics()["decision"];
        assert_eq!(summary.count, 100);
        assert!((summary.min_ms - 1.0).abs() < f64::EPSILON);
        assert!((summary.max_ms - 100.0).abs() < f64::EPSILON);
        assert!((summary.p50_ms - 50.0).abs() < f64::EPSILON);
        assert!((summary.p95_ms - 95.0).abs() < f64::EPSILON);
        assert!((summary.p99_ms - 99.0).abs() < f64::EPSILON);
        assert!((summary.avg_ms - 50.5).abs() < f64::EPSILON);
    }

    #[test]
    fn latency_window_is_capped() {
        let metrics = MetricsService::new();
        for ms in 0..(LATENCY_WINDOW + 100) {
            metrics.record_latency(LatencyKind::Execution, ms as f64);
        }
        let summary = &metrics.latency_metrics()["execution"];
        assert_eq!(summary.count, LATENCY_WINDOW);
        // Oldest samples were evicted.
        assert!(summary.min_ms >= 100.0);
    }

    #[test]
    fn empty_series_is_absent() {
        let metrics = MetricsService::new();
        assert!(metrics.latency_metrics().is_empty());
    }
}
