//! Engine core: polling loop, bounded concurrency, lifecycle, admin surface.
//!
//! A [`ReleaseEngine`] owns a poll ticker that discovers due jobs and a
//! health ticker that reclaims stuck ones. Each due job is dispatched as an
//! independent task, tracked in a shared in-flight set keyed by job id; the
//! set's size is the concurrency gate. `stop()` drains in-flight work with a
//! bounded timeout rather than aborting it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backends::{AuditSink, BackendError, Notifier, ReleaseStore};
use crate::clock::Clock;
use crate::executor::{ExecutionOutcome, JobExecutor};
use crate::health::{HealthMonitor, HealthMonitorConfig};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::models::{
    AuditEntry, CreateJobParams, CreateScheduleParams, JobId, JobStatus, ReleaseJob,
    ReleaseSchedule, ScheduleId, ScheduleStatus,
};

/// Tunables for the engine. Defaults match a single modestly loaded
/// deployment; everything is overridable through [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the poll pass looks for due jobs.
    pub poll_interval: Duration,
    /// How often the health monitor sweeps.
    pub health_check_interval: Duration,
    /// Upper bound on concurrently executing jobs.
    pub max_concurrent_jobs: usize,
    /// How long `stop()` waits for in-flight jobs before giving up.
    pub shutdown_timeout: Duration,
    /// Granularity of the drain wait loop.
    pub drain_poll_interval: Duration,
    /// How long a job may sit in `processing` before reclamation.
    pub stuck_job_threshold: Duration,
    pub default_max_retries: i32,
    pub default_retry_delay_minutes: i64,
    pub default_check_interval_minutes: i64,
    pub default_max_executions: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            max_concurrent_jobs: 5,
            shutdown_timeout: Duration::from_secs(30),
            drain_poll_interval: Duration::from_secs(1),
            stuck_job_threshold: Duration::from_secs(60 * 60),
            default_max_retries: 3,
            default_retry_delay_minutes: 5,
            default_check_interval_minutes: 60,
            default_max_executions: 10,
        }
    }
}

/// Validation-level errors surfaced to callers of the admin operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("schedule not found: {0}")]
    UnknownSchedule(ScheduleId),
    #[error("job not found: {0}")]
    UnknownJob(JobId),
    #[error("job {0} cannot be cancelled from its current status")]
    NotCancellable(JobId),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Point-in-time engine status.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub is_running: bool,
    pub active_job_count: usize,
    pub metrics: MetricsSnapshot,
}

/// The scheduled release engine.
///
/// Construct one per process with injected collaborators; clones share all
/// runtime state, so a clone can be handed to an admin API layer while the
/// original drives the background loops.
pub struct ReleaseEngine<B> {
    backend: B,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
    running: Arc<AtomicBool>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    semaphore: Arc<Semaphore>,
    shutdown_tx: Arc<Mutex<Option<watch::Sender<bool>>>>,
    loop_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<B: Clone> Clone for ReleaseEngine<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            notifier: Arc::clone(&self.notifier),
            audit: Arc::clone(&self.audit),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
            running: Arc::clone(&self.running),
            in_flight: Arc::clone(&self.in_flight),
            semaphore: Arc::clone(&self.semaphore),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            loop_handles: Arc::clone(&self.loop_handles),
        }
    }
}

impl<B> ReleaseEngine<B>
where
    B: ReleaseStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        backend: B,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            backend,
            notifier,
            audit,
            clock,
            config,
            metrics: Arc::new(EngineMetrics::new()),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            semaphore,
            shutdown_tx: Arc::new(Mutex::new(None)),
            loop_handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the polling and health loops. Idempotent.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("engine already running; start is a no-op");
            return;
        }
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            health_interval_ms = self.config.health_check_interval.as_millis(),
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "release engine starting"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().expect("shutdown channel poisoned") = Some(shutdown_tx);
        self.metrics.mark_healthy(true);

        // First pass runs immediately; the ticker takes over afterwards.
        self.poll_once().await;

        let poll_handle = {
            let engine = self.clone();
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { engine.run_poll_loop(rx).await })
        };
        let health = HealthMonitor::new(
            self.backend.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&self.clock),
            HealthMonitorConfig {
                interval: self.config.health_check_interval,
                stuck_job_threshold: self.config.stuck_job_threshold,
            },
            shutdown_rx,
        );
        let health_handle = tokio::spawn(health.run());

        let mut handles = self.loop_handles.lock().expect("loop handles poisoned");
        handles.push(poll_handle);
        handles.push(health_handle);
    }

    /// Stop issuing new work and drain in-flight jobs, bounded by the
    /// configured shutdown timeout.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("engine already stopped");
            return;
        }
        // Flag first, then the timers: every continuation re-checks the
        // flag, so clearing it before the signal keeps new work from
        // starting while old work finishes.
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .expect("shutdown channel poisoned")
            .take()
        {
            let _ = tx.send(true);
        }
        let handles: Vec<_> = {
            let mut guard = self.loop_handles.lock().expect("loop handles poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "background loop ended abnormally");
            }
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            let active = self.in_flight.lock().expect("in-flight set poisoned").len();
            if active == 0 {
                info!("release engine drained cleanly");
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    active_jobs = active,
                    "shutdown timeout elapsed; forcing shutdown with jobs still in flight"
                );
                break;
            }
            sleep(self.config.drain_poll_interval).await;
        }
    }

    async fn run_poll_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.poll_once().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("poll loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Poll pass
    // ------------------------------------------------------------------

    /// One poll pass: fetch due jobs up to remaining capacity and dispatch
    /// each as an independent task. Dispatch only happens while the engine
    /// is running; the flag is re-checked after the fetch and before every
    /// dispatch because the fetch, iteration, and a concurrent `stop()` can
    /// interleave.
    pub async fn poll_once(&self) {
        let capacity = {
            let guard = self.in_flight.lock().expect("in-flight set poisoned");
            self.config.max_concurrent_jobs.saturating_sub(guard.len())
        };
        if capacity == 0 {
            debug!("at concurrency limit; skipping poll pass");
            return;
        }

        let now = self.clock.now();
        let jobs = match self.backend.find_due_jobs(now, capacity as i64).await {
            Ok(jobs) => jobs,
            Err(err) => {
                metrics::counter!("unveil_poll_errors_total").increment(1);
                self.metrics.mark_healthy(false);
                error!(error = %err, "poll pass failed");
                return;
            }
        };
        // The fetch awaited; the engine may have been stopped meanwhile.
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if jobs.is_empty() {
            return;
        }
        debug!(count = jobs.len(), "dispatching due jobs");

        for job in jobs {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            {
                let mut guard = self.in_flight.lock().expect("in-flight set poisoned");
                if guard.len() >= self.config.max_concurrent_jobs {
                    break;
                }
                // Ids enter the set before any awaiting work begins, so a
                // job can never be double-dispatched across passes.
                if !guard.insert(job.id) {
                    continue;
                }
            }
            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.in_flight
                        .lock()
                        .expect("in-flight set poisoned")
                        .remove(&job.id);
                    break;
                }
            };
            let engine = self.clone();
            tokio::spawn(async move {
                engine.execute_tracked(job, permit).await;
            });
        }
    }

    async fn execute_tracked(&self, job: ReleaseJob, _permit: OwnedSemaphorePermit) {
        let job_id = job.id;
        let started = std::time::Instant::now();
        let executor = JobExecutor::new(
            self.backend.clone(),
            Arc::clone(&self.notifier),
            Arc::clone(&self.audit),
            Arc::clone(&self.clock),
        );
        let outcome = executor.execute(job).await;
        match outcome {
            ExecutionOutcome::Completed => self.metrics.record_success(started.elapsed()),
            ExecutionOutcome::Retrying | ExecutionOutcome::Failed => {
                metrics::counter!("unveil_job_failures_total").increment(1);
                self.metrics.record_failure(started.elapsed());
            }
            ExecutionOutcome::Skipped => {}
        }
        // The executor persisted the job's terminal or retry status before
        // returning; only now does the id leave the in-flight set.
        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .remove(&job_id);
    }

    // ------------------------------------------------------------------
    // Admin surface
    // ------------------------------------------------------------------

    /// Register a new schedule, applying engine defaults for anything the
    /// caller left unset.
    pub async fn create_schedule(
        &self,
        params: CreateScheduleParams,
    ) -> Result<ScheduleId, EngineError> {
        let now = self.clock.now();
        let schedule = ReleaseSchedule {
            id: Uuid::new_v4(),
            content_type: params.content_type,
            content_id: params.content_id,
            target_audience: params.target_audience,
            conditions: params.conditions,
            condition_logic: params.condition_logic,
            execution_count: 0,
            last_executed_at: None,
            max_executions: params
                .max_executions
                .unwrap_or(self.config.default_max_executions),
            status: ScheduleStatus::Active,
            retry_delay_minutes: params
                .retry_delay_minutes
                .unwrap_or(self.config.default_retry_delay_minutes),
            check_interval_minutes: params
                .check_interval_minutes
                .unwrap_or(self.config.default_check_interval_minutes),
            check_jitter_seconds: params.check_jitter_seconds.unwrap_or(0),
            notify_title: params.notify_title,
            notify_message: params.notify_message,
            notify_action_url: params.notify_action_url,
            personalized_data: params.personalized_data,
            ab_test_variant: params.ab_test_variant,
            created_at: now,
            updated_at: now,
        };
        self.backend.insert_schedule(&schedule).await?;
        info!(
            schedule_id = %schedule.id,
            content_type = %schedule.content_type,
            "schedule created"
        );
        Ok(ScheduleId(schedule.id))
    }

    /// Queue a job for a known schedule.
    pub async fn create_job(&self, params: CreateJobParams) -> Result<JobId, EngineError> {
        let schedule = self
            .backend
            .get_schedule(params.schedule_id)
            .await?
            .ok_or(EngineError::UnknownSchedule(params.schedule_id))?;
        let now = self.clock.now();
        let job = ReleaseJob {
            id: Uuid::new_v4(),
            schedule_id: schedule.id,
            kind: params.kind,
            status: JobStatus::Pending,
            scheduled_for: params.scheduled_for,
            priority: params.priority.unwrap_or(0),
            attempt_count: 0,
            max_retries: params.max_retries.unwrap_or(self.config.default_max_retries),
            retry_delay_minutes: params
                .retry_delay_minutes
                .unwrap_or(schedule.retry_delay_minutes),
            payload: params.payload.unwrap_or_else(|| serde_json::json!({})),
            result: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
        };
        self.backend.insert_job(&job).await?;
        info!(
            job_id = %job.id,
            schedule_id = %job.schedule_id,
            kind = job.kind.as_str(),
            scheduled_for = %job.scheduled_for,
            "job queued"
        );
        Ok(JobId(job.id))
    }

    /// Cancel a pending or retrying job.
    pub async fn cancel_job(&self, id: JobId) -> Result<(), EngineError> {
        if self.backend.cancel_job(id).await? {
            info!(job_id = %id, "job cancelled");
            return Ok(());
        }
        match self.backend.get_job(id).await? {
            Some(_) => Err(EngineError::NotCancellable(id)),
            None => Err(EngineError::UnknownJob(id)),
        }
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<ReleaseJob>, EngineError> {
        Ok(self.backend.get_job(id).await?)
    }

    pub async fn set_schedule_status(
        &self,
        id: ScheduleId,
        status: ScheduleStatus,
    ) -> Result<(), EngineError> {
        if self.backend.set_schedule_status(id, status).await? {
            info!(schedule_id = %id, status = status.as_str(), "schedule status updated");
            Ok(())
        } else {
            Err(EngineError::UnknownSchedule(id))
        }
    }

    pub async fn list_schedules(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReleaseSchedule>, EngineError> {
        Ok(self.backend.list_schedules(limit, offset).await?)
    }

    /// Audit history for one schedule, newest entries included first if the
    /// sink orders them that way.
    pub async fn audit_history(
        &self,
        schedule_id: ScheduleId,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self.audit.list_for_schedule(schedule_id, limit).await?)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            is_running: self.running.load(Ordering::SeqCst),
            active_job_count: self.in_flight.lock().expect("in-flight set poisoned").len(),
            metrics: self.metrics.snapshot(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.health_check_interval, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_jobs, 5);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.stuck_job_threshold, Duration::from_secs(3600));
        assert_eq!(config.default_max_executions, 10);
    }
}
