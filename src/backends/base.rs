//! Collaborator interfaces the engine depends on.
//!
//! The durable store, activity read model, notification dispatcher, and
//! audit sink are all expressed as capability traits so a test can construct
//! an isolated engine from fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{
    AccessGrant, AttributePredicate, AudienceFilter, AuditEntry, JobId, ReleaseJob,
    ReleaseSchedule, ScheduleId, ScheduleStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Durable storage for release jobs.
///
/// All status mutations are single-row conditional updates: a transition only
/// applies when the row is still in the expected source state, so a lost race
/// surfaces as `None`/`false` rather than a clobbered row.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &ReleaseJob) -> BackendResult<()>;

    async fn get_job(&self, id: JobId) -> BackendResult<Option<ReleaseJob>>;

    /// Jobs in `pending`/`retrying` with `scheduled_for <= now`, ordered by
    /// `(priority DESC, scheduled_for ASC)`, bounded by `limit`.
    async fn find_due_jobs(&self, now: DateTime<Utc>, limit: i64)
    -> BackendResult<Vec<ReleaseJob>>;

    /// Claim a job for execution: `pending|retrying -> processing`, attempt
    /// counter incremented, `started_at` stamped. Returns the updated job, or
    /// `None` when the job was no longer claimable.
    async fn mark_processing(&self, id: JobId, now: DateTime<Utc>)
    -> BackendResult<Option<ReleaseJob>>;

    /// `processing -> completed` with an optional result payload.
    async fn complete_job(
        &self,
        id: JobId,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> BackendResult<()>;

    /// `processing -> retrying`, due again at `next_run`.
    async fn retry_job(&self, id: JobId, error: &str, next_run: DateTime<Utc>)
    -> BackendResult<()>;

    /// `processing -> failed`.
    async fn fail_job(&self, id: JobId, error: &str, now: DateTime<Utc>) -> BackendResult<()>;

    /// `pending|retrying -> cancelled`. Returns whether a row transitioned.
    async fn cancel_job(&self, id: JobId) -> BackendResult<bool>;

    /// Reset jobs stuck in `processing` since before `stuck_before` back to
    /// `retrying`, due again after each job's own retry delay from `now`.
    /// Returns the number of jobs reclaimed.
    async fn reclaim_stuck_jobs(
        &self,
        stuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BackendResult<u64>;

    /// Cheap connectivity probe for the health check.
    async fn ping(&self) -> BackendResult<()>;
}

/// Durable storage for release schedules.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert_schedule(&self, schedule: &ReleaseSchedule) -> BackendResult<()>;

    async fn get_schedule(&self, id: ScheduleId) -> BackendResult<Option<ReleaseSchedule>>;

    async fn list_schedules(&self, limit: i64, offset: i64)
    -> BackendResult<Vec<ReleaseSchedule>>;

    async fn set_schedule_status(
        &self,
        id: ScheduleId,
        status: ScheduleStatus,
    ) -> BackendResult<bool>;

    /// Bump `execution_count` and stamp `last_executed_at`.
    async fn record_execution(&self, id: ScheduleId, at: DateTime<Utc>) -> BackendResult<()>;
}

/// Storage for access grants. Granting is idempotent per (user, schedule).
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn upsert_grant(&self, grant: &AccessGrant) -> BackendResult<()>;

    async fn count_grants(
        &self,
        content_type: Option<&str>,
        content_id: Option<&str>,
    ) -> BackendResult<i64>;
}

/// Read-only query surface over user activity, used by the condition
/// evaluator and for audience resolution.
#[async_trait]
pub trait ActivityReader: Send + Sync {
    /// Resolve a target audience to user ids. `None` means every known user.
    async fn resolve_audience(
        &self,
        filter: Option<&AudienceFilter>,
    ) -> BackendResult<Vec<String>>;

    async fn count_user_actions(
        &self,
        action: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> BackendResult<i64>;

    async fn count_poll_responses(
        &self,
        poll_id: Option<&str>,
        response_value: Option<&str>,
    ) -> BackendResult<i64>;

    /// Poll responses scoped to an event rather than a poll.
    async fn count_event_poll_responses(&self, event_id: Option<&str>) -> BackendResult<i64>;

    async fn count_completed_chapters(&self, chapter_id: Option<&str>) -> BackendResult<i64>;

    async fn count_progress_rows(&self, chapter_id: Option<&str>) -> BackendResult<i64>;

    async fn count_chat_messages(&self, event_id: Option<&str>) -> BackendResult<i64>;

    async fn count_users_matching(&self, predicate: &AttributePredicate) -> BackendResult<i64>;
}

/// Everything the engine needs from one durable store.
pub trait ReleaseStore: JobStore + ScheduleStore + GrantStore + ActivityReader {}

impl<T> ReleaseStore for T where T: JobStore + ScheduleStore + GrantStore + ActivityReader {}

/// Outbound notification dispatcher. Fire-and-forget from the engine's
/// perspective; failures are logged but never fail the enclosing job.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: &str,
        title: &str,
        message: &str,
        action_url: Option<&str>,
        metadata: Option<&Value>,
    ) -> BackendResult<()>;
}

/// Append-only audit sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> BackendResult<()>;

    async fn list_for_schedule(
        &self,
        schedule_id: ScheduleId,
        limit: i64,
    ) -> BackendResult<Vec<AuditEntry>>;
}

/// Notifier that only logs deliveries. Useful as a default until the host
/// application wires a real push/in-app dispatcher.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(
        &self,
        user_id: &str,
        title: &str,
        message: &str,
        action_url: Option<&str>,
        _metadata: Option<&Value>,
    ) -> BackendResult<()> {
        tracing::info!(
            user_id = %user_id,
            title = %title,
            message = %message,
            action_url = action_url.unwrap_or(""),
            "notification dispatched"
        );
        Ok(())
    }
}
