//! Background health monitor.
//!
//! Periodically reclaims jobs stuck in `processing` past a threshold and
//! verifies store connectivity, flipping the shared health flag without ever
//! propagating an error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{error, info, warn};

use crate::backends::JobStore;
use crate::clock::Clock;
use crate::metrics::EngineMetrics;

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// How often to run a health sweep.
    pub interval: Duration,
    /// How long a job may sit in `processing` before it is presumed
    /// abandoned and reset for retry.
    pub stuck_job_threshold: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_job_threshold: Duration::from_secs(60 * 60),
        }
    }
}

/// Background health monitor task.
pub struct HealthMonitor<B> {
    backend: B,
    metrics: Arc<EngineMetrics>,
    clock: Arc<dyn Clock>,
    config: HealthMonitorConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B> HealthMonitor<B>
where
    B: JobStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        backend: B,
        metrics: Arc<EngineMetrics>,
        clock: Arc<dyn Clock>,
        config: HealthMonitorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backend,
            metrics,
            clock,
            config,
            shutdown_rx,
        }
    }

    /// Run the health check loop.
    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.interval.as_millis(),
            stuck_threshold_secs = self.config.stuck_job_threshold.as_secs(),
            "health monitor started"
        );

        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One health pass: reclaim stuck jobs, then probe the store.
    pub async fn sweep(&self) {
        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(self.config.stuck_job_threshold)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let stuck_before = now - threshold;

        let mut healthy = true;
        match self.backend.reclaim_stuck_jobs(stuck_before, now).await {
            Ok(0) => {}
            Ok(count) => info!(count, "reset stuck jobs for retry"),
            Err(err) => {
                error!(error = %err, "stuck job sweep failed");
                healthy = false;
            }
        }

        if let Err(err) = self.backend.ping().await {
            warn!(error = %err, "store connectivity check failed");
            healthy = false;
        }

        self.metrics.mark_healthy(healthy);
        self.metrics.record_health_check(now);
    }
}
