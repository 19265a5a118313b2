//! Per-job execution: claim, dispatch on kind, side effects, audit.
//!
//! Nothing escapes [`JobExecutor::execute`] as an error. Every failure is
//! converted into an audit entry plus a retry/failed transition; the caller
//! only learns the outcome.

use std::sync::Arc;

use rand::Rng;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backends::{AuditSink, BackendResult, Notifier, ReleaseStore};
use crate::clock::Clock;
use crate::conditions::ConditionEvaluator;
use crate::models::{
    AccessGrant, AuditEntry, JobId, JobKind, JobStatus, ReleaseJob, ReleaseSchedule, ScheduleId,
    ScheduleStatus,
};

/// Terminal outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Retrying,
    Failed,
    /// The job could not be claimed (already taken, cancelled, or the claim
    /// write failed); nothing was executed.
    Skipped,
}

struct ExecutionReport {
    result: Option<Value>,
    recipients: Vec<String>,
}

impl ExecutionReport {
    fn with_result(result: Value) -> Self {
        Self {
            result: Some(result),
            recipients: Vec::new(),
        }
    }
}

/// Executes one due job against the store and collaborators.
pub struct JobExecutor<B> {
    backend: B,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl<B> JobExecutor<B>
where
    B: ReleaseStore,
{
    pub fn new(
        backend: B,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            notifier,
            audit,
            clock,
        }
    }

    /// Execute one job to a terminal decision. Never errors.
    pub async fn execute(&self, job: ReleaseJob) -> ExecutionOutcome {
        let now = self.clock.now();
        let job = match self.backend.mark_processing(JobId(job.id), now).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %job.id, "job no longer claimable; skipping");
                return ExecutionOutcome::Skipped;
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to claim job");
                return ExecutionOutcome::Skipped;
            }
        };

        let schedule = match self.backend.get_schedule(ScheduleId(job.schedule_id)).await {
            Ok(schedule) => schedule,
            Err(err) => {
                return self.handle_failure(&job, None, err.to_string()).await;
            }
        };
        let Some(schedule) = schedule else {
            let message = format!("schedule {} not found", job.schedule_id);
            return self.handle_failure(&job, None, message).await;
        };

        match self.run(&job, &schedule).await {
            Ok(report) => {
                let now = self.clock.now();
                if let Err(err) = self
                    .backend
                    .complete_job(JobId(job.id), report.result.clone(), now)
                    .await
                {
                    error!(job_id = %job.id, error = %err, "failed to persist job completion");
                }
                self.record_audit(&job, Some(&schedule), &report.recipients, true, None)
                    .await;
                info!(
                    job_id = %job.id,
                    kind = job.kind.as_str(),
                    recipients = report.recipients.len(),
                    "job completed"
                );
                ExecutionOutcome::Completed
            }
            Err(err) => self.handle_failure(&job, Some(&schedule), err.to_string()).await,
        }
    }

    async fn run(
        &self,
        job: &ReleaseJob,
        schedule: &ReleaseSchedule,
    ) -> BackendResult<ExecutionReport> {
        if schedule.status != ScheduleStatus::Active {
            debug!(
                job_id = %job.id,
                schedule_id = %schedule.id,
                status = schedule.status.as_str(),
                "schedule is not active; skipping release side effects"
            );
            return Ok(ExecutionReport::with_result(json!({
                "skipped": true,
                "scheduleStatus": schedule.status.as_str(),
            })));
        }
        match job.kind {
            JobKind::ContentRelease => self.release_content(schedule).await,
            JobKind::Notification => self.send_notifications(schedule).await,
            JobKind::ConditionCheck => self.check_conditions(job, schedule).await,
        }
    }

    async fn release_content(
        &self,
        schedule: &ReleaseSchedule,
    ) -> BackendResult<ExecutionReport> {
        let users = self
            .backend
            .resolve_audience(schedule.target_audience.as_ref())
            .await?;
        let now = self.clock.now();
        for user_id in &users {
            let grant = AccessGrant {
                id: Uuid::new_v4(),
                user_id: user_id.clone(),
                schedule_id: schedule.id,
                content_type: schedule.content_type.clone(),
                content_id: schedule.content_id.clone(),
                access_method: "scheduled".to_string(),
                personalized_data: schedule.personalized_data.clone(),
                ab_test_variant: schedule.ab_test_variant.clone(),
                is_active: true,
                granted_at: now,
            };
            self.backend.upsert_grant(&grant).await?;
        }
        self.notify_users(&users, schedule).await;
        self.backend
            .record_execution(ScheduleId(schedule.id), now)
            .await?;
        Ok(ExecutionReport {
            result: Some(json!({"releasedTo": users.len()})),
            recipients: users,
        })
    }

    async fn send_notifications(
        &self,
        schedule: &ReleaseSchedule,
    ) -> BackendResult<ExecutionReport> {
        let users = self
            .backend
            .resolve_audience(schedule.target_audience.as_ref())
            .await?;
        self.notify_users(&users, schedule).await;
        Ok(ExecutionReport {
            result: Some(json!({"notified": users.len()})),
            recipients: users,
        })
    }

    async fn check_conditions(
        &self,
        job: &ReleaseJob,
        schedule: &ReleaseSchedule,
    ) -> BackendResult<ExecutionReport> {
        let evaluator = ConditionEvaluator::new(&self.backend, self.clock.as_ref());
        let satisfied = evaluator
            .evaluate_all(&schedule.conditions, schedule.condition_logic, schedule)
            .await;
        let now = self.clock.now();

        if satisfied {
            let release = ReleaseJob {
                id: Uuid::new_v4(),
                schedule_id: schedule.id,
                kind: JobKind::ContentRelease,
                status: JobStatus::Pending,
                scheduled_for: now,
                priority: job.priority,
                attempt_count: 0,
                max_retries: job.max_retries,
                retry_delay_minutes: job.retry_delay_minutes,
                payload: json!({"triggeredBy": job.id.to_string()}),
                result: None,
                error_message: None,
                started_at: None,
                completed_at: None,
                created_at: now,
            };
            self.backend.insert_job(&release).await?;
            info!(
                schedule_id = %schedule.id,
                release_job_id = %release.id,
                "conditions satisfied; queued immediate release"
            );
            return Ok(ExecutionReport::with_result(json!({
                "satisfied": true,
                "releaseJobId": release.id.to_string(),
            })));
        }

        let attempt = job
            .payload
            .get("checkAttempt")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if attempt < schedule.max_executions {
            let mut delay = chrono::Duration::minutes(schedule.check_interval_minutes);
            if schedule.check_jitter_seconds > 0 {
                let jitter = rand::thread_rng().gen_range(0..=schedule.check_jitter_seconds);
                delay += chrono::Duration::seconds(jitter);
            }
            let next_check = now + delay;
            let follow_up = ReleaseJob {
                id: Uuid::new_v4(),
                schedule_id: schedule.id,
                kind: JobKind::ConditionCheck,
                status: JobStatus::Pending,
                scheduled_for: next_check,
                priority: job.priority,
                attempt_count: 0,
                max_retries: job.max_retries,
                retry_delay_minutes: job.retry_delay_minutes,
                payload: json!({"checkAttempt": attempt + 1}),
                result: None,
                error_message: None,
                started_at: None,
                completed_at: None,
                created_at: now,
            };
            self.backend.insert_job(&follow_up).await?;
            debug!(
                schedule_id = %schedule.id,
                check_attempt = attempt + 1,
                next_check = %next_check,
                "conditions unmet; scheduled follow-up check"
            );
            Ok(ExecutionReport::with_result(json!({
                "satisfied": false,
                "checkAttempt": attempt,
                "nextCheckAt": next_check.to_rfc3339(),
            })))
        } else {
            debug!(
                schedule_id = %schedule.id,
                attempts = attempt,
                "condition re-check budget exhausted; schedule left unexecuted"
            );
            Ok(ExecutionReport::with_result(json!({
                "satisfied": false,
                "exhausted": true,
            })))
        }
    }

    async fn notify_users(&self, users: &[String], schedule: &ReleaseSchedule) {
        let title = schedule
            .notify_title
            .clone()
            .unwrap_or_else(|| "New content unlocked".to_string());
        let message = schedule.notify_message.clone().unwrap_or_else(|| {
            format!("A new {} is now available for you", schedule.content_type)
        });
        let metadata = json!({
            "scheduleId": schedule.id.to_string(),
            "contentType": schedule.content_type,
            "contentId": schedule.content_id,
        });
        for user_id in users {
            if let Err(err) = self
                .notifier
                .notify(
                    user_id,
                    &title,
                    &message,
                    schedule.notify_action_url.as_deref(),
                    Some(&metadata),
                )
                .await
            {
                warn!(
                    user_id = %user_id,
                    schedule_id = %schedule.id,
                    error = %err,
                    "notification dispatch failed"
                );
            }
        }
    }

    async fn handle_failure(
        &self,
        job: &ReleaseJob,
        schedule: Option<&ReleaseSchedule>,
        message: String,
    ) -> ExecutionOutcome {
        warn!(
            job_id = %job.id,
            attempt = job.attempt_count,
            max_retries = job.max_retries,
            error = %message,
            "job execution failed"
        );
        // Audit and transition share this path; a retry decision can never
        // skip the audit write.
        self.record_audit(job, schedule, &[], false, Some(&message)).await;

        let now = self.clock.now();
        if job.attempt_count <= job.max_retries {
            let next_run = now + chrono::Duration::minutes(job.retry_delay_minutes);
            if let Err(err) = self.backend.retry_job(JobId(job.id), &message, next_run).await {
                error!(job_id = %job.id, error = %err, "failed to persist retry transition");
            }
            ExecutionOutcome::Retrying
        } else {
            if let Err(err) = self.backend.fail_job(JobId(job.id), &message, now).await {
                error!(job_id = %job.id, error = %err, "failed to persist failure transition");
            }
            ExecutionOutcome::Failed
        }
    }

    async fn record_audit(
        &self,
        job: &ReleaseJob,
        schedule: Option<&ReleaseSchedule>,
        recipients: &[String],
        success: bool,
        error: Option<&str>,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            schedule_id: job.schedule_id,
            job_id: job.id,
            content_type: schedule
                .map(|s| s.content_type.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            content_id: schedule.and_then(|s| s.content_id.clone()),
            release_kind: job.kind.as_str().to_string(),
            recipients: recipients.to_vec(),
            recipient_count: recipients.len() as i64,
            success,
            error_message: error.map(str::to_string),
            recorded_at: self.clock.now(),
        };
        if let Err(err) = self.audit.record(&entry).await {
            error!(job_id = %job.id, error = %err, "failed to record audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::backends::memory::{MemoryAuditSink, MemoryBackend, MemoryNotifier};
    use crate::backends::{JobStore, ScheduleStore};
    use crate::clock::ManualClock;
    use crate::models::{ConditionLogic, UserRecord};

    fn test_schedule(conditions: Vec<Value>, logic: ConditionLogic) -> ReleaseSchedule {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        ReleaseSchedule {
            id: Uuid::new_v4(),
            content_type: "chapter".to_string(),
            content_id: Some("ch-7".to_string()),
            target_audience: None,
            conditions,
            condition_logic: logic,
            execution_count: 0,
            last_executed_at: None,
            max_executions: 10,
            status: ScheduleStatus::Active,
            retry_delay_minutes: 5,
            check_interval_minutes: 60,
            check_jitter_seconds: 0,
            notify_title: None,
            notify_message: None,
            notify_action_url: None,
            personalized_data: None,
            ab_test_variant: Some("b".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    fn test_job(schedule_id: Uuid, kind: JobKind, max_retries: i32) -> ReleaseJob {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        ReleaseJob {
            id: Uuid::new_v4(),
            schedule_id,
            kind,
            status: JobStatus::Pending,
            scheduled_for: now,
            priority: 0,
            attempt_count: 0,
            max_retries,
            retry_delay_minutes: 5,
            payload: json!({}),
            result: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
        }
    }

    struct Harness {
        backend: MemoryBackend,
        notifier: MemoryNotifier,
        audit: MemoryAuditSink,
        clock: ManualClock,
        executor: JobExecutor<MemoryBackend>,
    }

    fn harness() -> Harness {
        let backend = MemoryBackend::new();
        let notifier = MemoryNotifier::new();
        let audit = MemoryAuditSink::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap());
        let executor = JobExecutor::new(
            backend.clone(),
            Arc::new(notifier.clone()),
            Arc::new(audit.clone()),
            Arc::new(clock.clone()),
        );
        Harness {
            backend,
            notifier,
            audit,
            clock,
            executor,
        }
    }

    #[tokio::test]
    async fn release_grants_access_notifies_and_audits() {
        let h = harness();
        for id in ["u1", "u2", "u3"] {
            h.backend.add_user(UserRecord {
                id: id.to_string(),
                email: None,
                is_admin: false,
                email_verified: false,
                created_at: h.clock.now(),
            });
        }
        let schedule = test_schedule(Vec::new(), ConditionLogic::And);
        h.backend.insert_schedule(&schedule).await.unwrap();
        let job = test_job(schedule.id, JobKind::ContentRelease, 3);
        h.backend.insert_job(&job).await.unwrap();

        let outcome = h.executor.execute(job.clone()).await;
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let grants = h.backend.grants();
        assert_eq!(grants.len(), 3);
        assert!(grants.iter().all(|g| g.access_method == "scheduled"));
        assert!(grants.iter().all(|g| g.ab_test_variant.as_deref() == Some("b")));

        assert_eq!(h.notifier.sent().len(), 3);

        let stored = h.backend.schedules();
        assert_eq!(stored[0].execution_count, 1);
        assert_eq!(stored[0].last_executed_at, Some(h.clock.now()));

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(entries[0].recipient_count, 3);
    }

    #[tokio::test]
    async fn duplicate_release_does_not_duplicate_grants() {
        let h = harness();
        h.backend.add_user(UserRecord {
            id: "u1".to_string(),
            email: None,
            is_admin: false,
            email_verified: false,
            created_at: h.clock.now(),
        });
        let schedule = test_schedule(Vec::new(), ConditionLogic::And);
        h.backend.insert_schedule(&schedule).await.unwrap();

        for _ in 0..2 {
            let job = test_job(schedule.id, JobKind::ContentRelease, 3);
            h.backend.insert_job(&job).await.unwrap();
            assert_eq!(h.executor.execute(job).await, ExecutionOutcome::Completed);
        }
        assert_eq!(h.backend.grants().len(), 1);
    }

    #[tokio::test]
    async fn missing_schedule_consumes_attempts_until_failed() {
        let h = harness();
        let mut job = test_job(Uuid::new_v4(), JobKind::ContentRelease, 1);
        h.backend.insert_job(&job).await.unwrap();

        // Attempt 1 -> retrying
        assert_eq!(h.executor.execute(job.clone()).await, ExecutionOutcome::Retrying);
        job = h.backend.get_job(JobId(job.id)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(
            job.scheduled_for,
            h.clock.now() + chrono::Duration::minutes(5)
        );

        // Attempt 2 exhausts max_retries=1 -> failed
        assert_eq!(h.executor.execute(job.clone()).await, ExecutionOutcome::Failed);
        let job = h.backend.get_job(JobId(job.id)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 2);
        assert!(job.attempt_count <= job.max_retries + 1);

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| !e.success));
    }

    #[tokio::test]
    async fn cancelled_job_is_not_executed() {
        let h = harness();
        let schedule = test_schedule(Vec::new(), ConditionLogic::And);
        h.backend.insert_schedule(&schedule).await.unwrap();
        let job = test_job(schedule.id, JobKind::ContentRelease, 3);
        h.backend.insert_job(&job).await.unwrap();
        h.backend.cancel_job(JobId(job.id)).await.unwrap();

        assert_eq!(h.executor.execute(job).await, ExecutionOutcome::Skipped);
        assert!(h.backend.grants().is_empty());
        assert!(h.audit.entries().is_empty());
    }

    #[tokio::test]
    async fn satisfied_condition_check_queues_immediate_release() {
        let h = harness();
        let conditions = vec![json!({
            "type": "time_based", "timeType": "absolute",
            "value": "2026-01-01T00:00:00Z", "operator": "after"
        })];
        let schedule = test_schedule(conditions, ConditionLogic::And);
        h.backend.insert_schedule(&schedule).await.unwrap();
        let job = test_job(schedule.id, JobKind::ConditionCheck, 3);
        h.backend.insert_job(&job).await.unwrap();

        assert_eq!(h.executor.execute(job).await, ExecutionOutcome::Completed);

        let releases: Vec<_> = h
            .backend
            .jobs()
            .into_iter()
            .filter(|j| j.kind == JobKind::ContentRelease)
            .collect();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].status, JobStatus::Pending);
        assert_eq!(releases[0].scheduled_for, h.clock.now());
    }

    #[tokio::test]
    async fn unmet_condition_check_schedules_follow_up() {
        let h = harness();
        let conditions = vec![json!({
            "type": "user_attributes",
            "attribute": "isAdmin", "operator": "eq", "value": true, "threshold": 1
        })];
        let schedule = test_schedule(conditions, ConditionLogic::And);
        h.backend.insert_schedule(&schedule).await.unwrap();
        let job = test_job(schedule.id, JobKind::ConditionCheck, 3);
        h.backend.insert_job(&job).await.unwrap();

        assert_eq!(h.executor.execute(job.clone()).await, ExecutionOutcome::Completed);

        let checks: Vec<_> = h
            .backend
            .jobs()
            .into_iter()
            .filter(|j| j.kind == JobKind::ConditionCheck && j.id != job.id)
            .collect();
        assert_eq!(checks.len(), 1);
        assert_eq!(
            checks[0].scheduled_for,
            h.clock.now() + chrono::Duration::minutes(60)
        );
        assert_eq!(
            checks[0].payload.get("checkAttempt").and_then(Value::as_i64),
            Some(1)
        );
        // No release was queued.
        assert!(
            h.backend
                .jobs()
                .iter()
                .all(|j| j.kind != JobKind::ContentRelease)
        );
    }

    #[tokio::test]
    async fn exhausted_condition_check_stops_silently() {
        let h = harness();
        let conditions = vec![json!({"type": "custom_sql", "query": "SELECT 1"})];
        let mut schedule = test_schedule(conditions, ConditionLogic::And);
        schedule.max_executions = 2;
        h.backend.insert_schedule(&schedule).await.unwrap();
        let mut job = test_job(schedule.id, JobKind::ConditionCheck, 3);
        job.payload = json!({"checkAttempt": 2});
        h.backend.insert_job(&job).await.unwrap();

        assert_eq!(h.executor.execute(job.clone()).await, ExecutionOutcome::Completed);

        // Neither a follow-up check nor a release was created.
        assert_eq!(h.backend.jobs().len(), 1);
        let job = h.backend.get_job(JobId(job.id)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn paused_schedule_skips_side_effects() {
        let h = harness();
        h.backend.add_user(UserRecord {
            id: "u1".to_string(),
            email: None,
            is_admin: false,
            email_verified: false,
            created_at: h.clock.now(),
        });
        let mut schedule = test_schedule(Vec::new(), ConditionLogic::And);
        schedule.status = ScheduleStatus::Paused;
        h.backend.insert_schedule(&schedule).await.unwrap();
        let job = test_job(schedule.id, JobKind::ContentRelease, 3);
        h.backend.insert_job(&job).await.unwrap();

        assert_eq!(h.executor.execute(job).await, ExecutionOutcome::Completed);
        assert!(h.backend.grants().is_empty());
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn notifier_failure_does_not_fail_the_job() {
        let h = harness();
        h.backend.add_user(UserRecord {
            id: "u1".to_string(),
            email: None,
            is_admin: false,
            email_verified: false,
            created_at: h.clock.now(),
        });
        h.notifier.set_failing(true);
        let schedule = test_schedule(Vec::new(), ConditionLogic::And);
        h.backend.insert_schedule(&schedule).await.unwrap();
        let job = test_job(schedule.id, JobKind::ContentRelease, 3);
        h.backend.insert_job(&job).await.unwrap();

        assert_eq!(h.executor.execute(job).await, ExecutionOutcome::Completed);
        assert_eq!(h.backend.grants().len(), 1);
    }
}
