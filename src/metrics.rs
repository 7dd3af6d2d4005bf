//! Pipeline metrics: a sliding sample window per stage plus running counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Samples kept per stage; older ones fall out.
const WINDOW: usize = 512;

/// What a sample measures. Durations are in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Whole cycle, dedup to last callback.
    Cycle,
    /// One backend `translate` call including retries.
    BackendCall,
    /// Longest time a request of the cycle sat in the queue.
    QueueWait,
    /// Fragments per outgoing batch.
    BatchFragments,
    /// Characters per outgoing batch.
    BatchChars,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Cycle,
        Stage::BackendCall,
        Stage::QueueWait,
        Stage::BatchFragments,
        Stage::BatchChars,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub count: usize,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub stages: Vec<StageSummary>,
    pub cycles: u64,
    pub delivered: u64,
    pub failed_batches: u64,
    pub trips: u64,
}

impl MetricsSnapshot {
    pub fn stage(&self, stage: Stage) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

#[derive(Default)]
struct Window {
    samples: VecDeque<f64>,
}

impl Window {
    fn push(&mut self, value: f64) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn summary(&self, stage: Stage) -> StageSummary {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        StageSummary {
            stage,
            count: sorted.len(),
            p50: nearest_rank(&sorted, 50.0),
            p95: nearest_rank(&sorted, 95.0),
            p99: nearest_rank(&sorted, 99.0),
        }
    }
}

fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

pub struct PipelineMetrics {
    windows: Mutex<Vec<Window>>,
    cycles: AtomicU64,
    delivered: AtomicU64,
    failed_batches: AtomicU64,
    trips: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(Stage::ALL.iter().map(|_| Window::default()).collect()),
            cycles: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, stage: Stage, value: f64) {
        if let Some(window) = self.windows.lock().get_mut(stage.slot()) {
            window.push(value);
        }
        tracing::trace!(?stage, value, "metric observed");
    }

    pub fn observe_duration(&self, stage: Stage, elapsed: Duration) {
        self.observe(stage, elapsed.as_micros() as f64);
    }

    pub fn cycle_finished(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callbacks_delivered(&self, count: usize) {
        self.delivered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn batch_failed(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn breaker_tripped(&self) {
        self.trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let windows = self.windows.lock();
        MetricsSnapshot {
            stages: Stage::ALL
                .iter()
                .zip(windows.iter())
                .map(|(&stage, window)| window.summary(stage))
                .collect(),
            cycles: self.cycles.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            trips: self.trips.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        let metrics = PipelineMetrics::new();
        for v in 1..=100 {
            metrics.observe(Stage::BatchChars, v as f64);
        }
        let snapshot = metrics.snapshot();
        let chars = snapshot.stage(Stage::BatchChars).unwrap();
        assert_eq!(chars.count, 100);
        assert_eq!(chars.p50, 50.0);
        assert_eq!(chars.p99, 99.0);
        assert_eq!(snapshot.stage(Stage::Cycle).unwrap().p50, 0.0);
    }

    #[test]
    fn window_drops_oldest_samples() {
        let mut window = Window::default();
        window.push(1_000_000.0);
        for _ in 0..WINDOW {
            window.push(1.0);
        }
        let summary = window.summary(Stage::QueueWait);
        assert_eq!(summary.count, WINDOW);
        assert_eq!(summary.p99, 1.0);
    }

    #[test]
    fn counters_accumulate() {
        let metrics = PipelineMetrics::new();
        metrics.cycle_finished();
        metrics.callbacks_delivered(3);
        metrics.callbacks_delivered(2);
        metrics.batch_failed();
        metrics.observe_duration(Stage::BackendCall, Duration::from_millis(2));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.delivered, 5);
        assert_eq!(snapshot.failed_batches, 1);
        assert_eq!(snapshot.trips, 0);
        assert_eq!(snapshot.stage(Stage::BackendCall).unwrap().p50, 2000.0);
    }
}
