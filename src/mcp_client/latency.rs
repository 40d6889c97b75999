//! Rolling round-trip statistics per session.
//!
//! Each operation kind keeps a bounded window of successful durations plus
//! attempt/failure counters. Failed operations are counted but never sampled.
//! The duration statistics cover the window only; the counters and the
//! success rate cover the session's lifetime.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use super::types::OpKind;

/// Default number of samples retained per operation kind.
pub const DEFAULT_LATENCY_CAPACITY: usize = 1000;

/// Snapshot of one operation kind's latency window. Durations are in
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Samples currently in the window.
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub stddev_ms: f64,
    /// Lifetime attempts, not limited to the window.
    pub attempts: u64,
    /// Lifetime failures, not limited to the window.
    pub failures: u64,
    /// Lifetime successes over lifetime attempts; 1.0 when nothing has been
    /// attempted. Evicting samples from the window does not change it.
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct SampleWindow {
    samples: VecDeque<f64>,
    attempts: u64,
    failures: u64,
}

/// Bounded per-kind latency recorder.
#[derive(Debug)]
pub struct LatencyTracker {
    capacity: usize,
    windows: Mutex<HashMap<OpKind, SampleWindow>>,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_CAPACITY)
    }
}

impl LatencyTracker {
    /// Create a tracker keeping at most `capacity` samples per kind.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a completed operation's round trip.
    pub fn record_success(&self, kind: OpKind, elapsed: Duration) {
        let mut windows = self.lock();
        let window = windows.entry(kind).or_default();
        window.attempts += 1;
        if window.samples.len() == self.capacity {
            window.samples.pop_front();
        }
        window.samples.push_back(elapsed.as_secs_f64() * 1000.0);
    }

    /// Record an operation that failed or timed out.
    pub fn record_failure(&self, kind: OpKind) {
        let mut windows = self.lock();
        let window = windows.entry(kind).or_default();
        window.attempts += 1;
        window.failures += 1;
    }

    /// Compute statistics over the retained window.
    pub fn stats(&self, kind: OpKind) -> LatencyStats {
        let windows = self.lock();
        match windows.get(&kind) {
            Some(window) => summarize(window),
            None => summarize(&SampleWindow::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<OpKind, SampleWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn summarize(window: &SampleWindow) -> LatencyStats {
    let success_rate = if window.attempts == 0 {
        1.0
    } else {
        (window.attempts - window.failures) as f64 / window.attempts as f64
    };

    let count = window.samples.len();
    if count == 0 {
        return LatencyStats {
            count: 0,
            min_ms: 0.0,
            max_ms: 0.0,
            mean_ms: 0.0,
            median_ms: 0.0,
            stddev_ms: 0.0,
            attempts: window.attempts,
            failures: window.failures,
            success_rate,
        };
    }

    let mut sorted: Vec<f64> = window.samples.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);

    let n = count as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let variance = sorted.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    let median = if count % 2 == 1 {
        sorted[count / 2]
    } else {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    };

    LatencyStats {
        count,
        min_ms: sorted[0],
        max_ms: sorted[count - 1],
        mean_ms: mean,
        median_ms: median,
        stddev_ms: variance.sqrt(),
        attempts: window.attempts,
        failures: window.failures,
        success_rate,
    }
}
