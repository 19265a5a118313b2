//! Rolling in-memory engine metrics.
//!
//! The average execution time is recomputed incrementally from a running
//! total and sample count; no per-sample history is kept.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Thread-safe metrics collector shared between the engine, the executor,
/// and the health monitor.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    total_jobs_processed: AtomicU64,
    successful_jobs: AtomicU64,
    failed_jobs: AtomicU64,
    execution_time_total_ms: AtomicU64,
    execution_time_samples: AtomicU64,
    healthy: AtomicBool,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time view of the metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total_jobs_processed: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub average_execution_time_ms: f64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub is_healthy: bool,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        metrics.healthy.store(true, Ordering::Relaxed);
        metrics
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.total_jobs_processed.fetch_add(1, Ordering::Relaxed);
        self.successful_jobs.fetch_add(1, Ordering::Relaxed);
        self.record_elapsed(elapsed);
    }

    pub fn record_failure(&self, elapsed: Duration) {
        self.total_jobs_processed.fetch_add(1, Ordering::Relaxed);
        self.failed_jobs.fetch_add(1, Ordering::Relaxed);
        self.record_elapsed(elapsed);
    }

    fn record_elapsed(&self, elapsed: Duration) {
        self.execution_time_total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.execution_time_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn record_health_check(&self, at: DateTime<Utc>) {
        let mut guard = self.last_health_check.lock().expect("health check poisoned");
        *guard = Some(at);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.execution_time_samples.load(Ordering::Relaxed);
        let total_ms = self.execution_time_total_ms.load(Ordering::Relaxed);
        let average = if samples == 0 {
            0.0
        } else {
            total_ms as f64 / samples as f64
        };
        MetricsSnapshot {
            total_jobs_processed: self.total_jobs_processed.load(Ordering::Relaxed),
            successful_jobs: self.successful_jobs.load(Ordering::Relaxed),
            failed_jobs: self.failed_jobs.load(Ordering::Relaxed),
            average_execution_time_ms: average,
            last_health_check: *self.last_health_check.lock().expect("health check poisoned"),
            is_healthy: self.healthy.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_outcomes() {
        let metrics = EngineMetrics::new();
        metrics.record_success(Duration::from_millis(100));
        metrics.record_success(Duration::from_millis(200));
        metrics.record_failure(Duration::from_millis(600));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_jobs_processed, 3);
        assert_eq!(snapshot.successful_jobs, 2);
        assert_eq!(snapshot.failed_jobs, 1);
        assert!((snapshot.average_execution_time_ms - 300.0).abs() < f64::EPSILON);
    }

    #[test]
    fn average_is_zero_without_samples() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.snapshot().average_execution_time_ms, 0.0);
    }

    #[test]
    fn health_flag_and_timestamp() {
        let metrics = EngineMetrics::new();
        assert!(metrics.is_healthy());

        metrics.mark_healthy(false);
        let at = Utc::now();
        metrics.record_health_check(at);

        let snapshot = metrics.snapshot();
        assert!(!snapshot.is_healthy);
        assert_eq!(snapshot.last_health_check, Some(at));
    }
}
