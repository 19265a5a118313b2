//! Postgres backend for schedules, jobs, grants, audit entries, and the
//! activity read model.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::base::{
    ActivityReader, AuditSink, BackendError, BackendResult, GrantStore, JobStore, ScheduleStore,
};
use crate::models::{
    AccessGrant, AttributePredicate, AudienceFilter, AuditEntry, ConditionLogic, JobId, JobKind,
    JobStatus, ReleaseJob, ReleaseSchedule, ScheduleId, ScheduleStatus,
};

/// Persist engine state in Postgres.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(dsn: &str) -> BackendResult<Self> {
        Self::connect_with_pool_size(dsn, 10).await
    }

    pub async fn connect_with_pool_size(dsn: &str, max_connections: u32) -> BackendResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(FromRow)]
struct ScheduleRow {
    id: Uuid,
    content_type: String,
    content_id: Option<String>,
    target_audience: Option<Value>,
    conditions: Value,
    condition_logic: String,
    execution_count: i64,
    last_executed_at: Option<DateTime<Utc>>,
    max_executions: i64,
    status: String,
    retry_delay_minutes: i64,
    check_interval_minutes: i64,
    check_jitter_seconds: i64,
    notify_title: Option<String>,
    notify_message: Option<String>,
    notify_action_url: Option<String>,
    personalized_data: Option<Value>,
    ab_test_variant: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for ReleaseSchedule {
    type Error = BackendError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        let status = ScheduleStatus::parse(&row.status).ok_or_else(|| {
            BackendError::Message(format!(
                "schedule {}: unknown status {:?}",
                row.id, row.status
            ))
        })?;
        let condition_logic = ConditionLogic::parse(&row.condition_logic).ok_or_else(|| {
            BackendError::Message(format!(
                "schedule {}: unknown condition logic {:?}",
                row.id, row.condition_logic
            ))
        })?;
        let target_audience = match row.target_audience {
            Some(raw) => Some(serde_json::from_value::<AudienceFilter>(raw)?),
            None => None,
        };
        let conditions = row
            .conditions
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            id: row.id,
            content_type: row.content_type,
            content_id: row.content_id,
            target_audience,
            conditions,
            condition_logic,
            execution_count: row.execution_count,
            last_executed_at: row.last_executed_at,
            max_executions: row.max_executions,
            status,
            retry_delay_minutes: row.retry_delay_minutes,
            check_interval_minutes: row.check_interval_minutes,
            check_jitter_seconds: row.check_jitter_seconds,
            notify_title: row.notify_title,
            notify_message: row.notify_message,
            notify_action_url: row.notify_action_url,
            personalized_data: row.personalized_data,
            ab_test_variant: row.ab_test_variant,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    schedule_id: Uuid,
    kind: String,
    status: String,
    scheduled_for: DateTime<Utc>,
    priority: i32,
    attempt_count: i32,
    max_retries: i32,
    retry_delay_minutes: i64,
    payload: Value,
    result: Option<Value>,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for ReleaseJob {
    type Error = BackendError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind = JobKind::parse(&row.kind).ok_or_else(|| {
            BackendError::Message(format!("job {}: unknown kind {:?}", row.id, row.kind))
        })?;
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            BackendError::Message(format!("job {}: unknown status {:?}", row.id, row.status))
        })?;
        Ok(Self {
            id: row.id,
            schedule_id: row.schedule_id,
            kind,
            status,
            scheduled_for: row.scheduled_for,
            priority: row.priority,
            attempt_count: row.attempt_count,
            max_retries: row.max_retries,
            retry_delay_minutes: row.retry_delay_minutes,
            payload: row.payload,
            result: row.result,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct AuditRow {
    id: Uuid,
    schedule_id: Uuid,
    job_id: Uuid,
    content_type: String,
    content_id: Option<String>,
    release_kind: String,
    recipients: Value,
    recipient_count: i64,
    success: bool,
    error_message: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditEntry {
    fn from(row: AuditRow) -> Self {
        let recipients = row
            .recipients
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id: row.id,
            schedule_id: row.schedule_id,
            job_id: row.job_id,
            content_type: row.content_type,
            content_id: row.content_id,
            release_kind: row.release_kind,
            recipients,
            recipient_count: row.recipient_count,
            success: row.success,
            error_message: row.error_message,
            recorded_at: row.recorded_at,
        }
    }
}

const JOB_COLUMNS: &str = "id, schedule_id, kind, status, scheduled_for, priority, attempt_count, \
     max_retries, retry_delay_minutes, payload, result, error_message, started_at, completed_at, \
     created_at";

const SCHEDULE_COLUMNS: &str = "id, content_type, content_id, target_audience, conditions, \
     condition_logic, execution_count, last_executed_at, max_executions, status, \
     retry_delay_minutes, check_interval_minutes, check_jitter_seconds, notify_title, \
     notify_message, notify_action_url, personalized_data, ab_test_variant, created_at, updated_at";

// ============================================================================
// JobStore
// ============================================================================

#[async_trait]
impl JobStore for PostgresBackend {
    async fn insert_job(&self, job: &ReleaseJob) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO release_jobs (id, schedule_id, kind, status, scheduled_for, priority,
                attempt_count, max_retries, retry_delay_minutes, payload, result, error_message,
                started_at, completed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(job.id)
        .bind(job.schedule_id)
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(job.scheduled_for)
        .bind(job.priority)
        .bind(job.attempt_count)
        .bind(job.max_retries)
        .bind(job.retry_delay_minutes)
        .bind(&job.payload)
        .bind(&job.result)
        .bind(&job.error_message)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> BackendResult<Option<ReleaseJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM release_jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BackendResult<Vec<ReleaseJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM release_jobs
            WHERE status IN ('pending', 'retrying')
              AND scheduled_for <= $1
            ORDER BY priority DESC, scheduled_for ASC
            FOR UPDATE SKIP LOCKED
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_processing(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> BackendResult<Option<ReleaseJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE release_jobs
            SET status = 'processing',
                attempt_count = attempt_count + 1,
                started_at = $2
            WHERE id = $1 AND status IN ('pending', 'retrying')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn complete_job(
        &self,
        id: JobId,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        sqlx::query(
            r#"
            UPDATE release_jobs
            SET status = 'completed', result = $2, completed_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.0)
        .bind(result)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry_job(
        &self,
        id: JobId,
        error: &str,
        next_run: DateTime<Utc>,
    ) -> BackendResult<()> {
        sqlx::query(
            r#"
            UPDATE release_jobs
            SET status = 'retrying', error_message = $2, scheduled_for = $3, started_at = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.0)
        .bind(error)
        .bind(next_run)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_job(&self, id: JobId, error: &str, now: DateTime<Utc>) -> BackendResult<()> {
        sqlx::query(
            r#"
            UPDATE release_jobs
            SET status = 'failed', error_message = $2, completed_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.0)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_job(&self, id: JobId) -> BackendResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE release_jobs
            SET status = 'cancelled'
            WHERE id = $1 AND status IN ('pending', 'retrying')
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reclaim_stuck_jobs(
        &self,
        stuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BackendResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE release_jobs
            SET status = 'retrying',
                scheduled_for = $2 + (retry_delay_minutes * interval '1 minute'),
                started_at = NULL
            WHERE status = 'processing'
              AND started_at IS NOT NULL
              AND started_at < $1
            "#,
        )
        .bind(stuck_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> BackendResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ============================================================================
// ScheduleStore
// ============================================================================

#[async_trait]
impl ScheduleStore for PostgresBackend {
    async fn insert_schedule(&self, schedule: &ReleaseSchedule) -> BackendResult<()> {
        let target_audience = schedule
            .target_audience
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO release_schedules (id, content_type, content_id, target_audience,
                conditions, condition_logic, execution_count, last_executed_at, max_executions,
                status, retry_delay_minutes, check_interval_minutes, check_jitter_seconds,
                notify_title, notify_message, notify_action_url, personalized_data,
                ab_test_variant, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20)
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.content_type)
        .bind(&schedule.content_id)
        .bind(target_audience)
        .bind(Value::Array(schedule.conditions.clone()))
        .bind(schedule.condition_logic.as_str())
        .bind(schedule.execution_count)
        .bind(schedule.last_executed_at)
        .bind(schedule.max_executions)
        .bind(schedule.status.as_str())
        .bind(schedule.retry_delay_minutes)
        .bind(schedule.check_interval_minutes)
        .bind(schedule.check_jitter_seconds)
        .bind(&schedule.notify_title)
        .bind(&schedule.notify_message)
        .bind(&schedule.notify_action_url)
        .bind(&schedule.personalized_data)
        .bind(&schedule.ab_test_variant)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schedule(&self, id: ScheduleId) -> BackendResult<Option<ReleaseSchedule>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM release_schedules WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_schedules(
        &self,
        limit: i64,
        offset: i64,
    ) -> BackendResult<Vec<ReleaseSchedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM release_schedules
            ORDER BY created_at
            LIMIT $1 OFFSET $2
            "#
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_schedule_status(
        &self,
        id: ScheduleId,
        status: ScheduleStatus,
    ) -> BackendResult<bool> {
        let result = sqlx::query(
            "UPDATE release_schedules SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.0)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_execution(&self, id: ScheduleId, at: DateTime<Utc>) -> BackendResult<()> {
        sqlx::query(
            r#"
            UPDATE release_schedules
            SET execution_count = execution_count + 1, last_executed_at = $2, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// GrantStore
// ============================================================================

#[async_trait]
impl GrantStore for PostgresBackend {
    async fn upsert_grant(&self, grant: &AccessGrant) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO access_grants (id, user_id, schedule_id, content_type, content_id,
                access_method, personalized_data, ab_test_variant, is_active, granted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id, schedule_id) DO UPDATE
            SET is_active = EXCLUDED.is_active,
                personalized_data = EXCLUDED.personalized_data,
                ab_test_variant = EXCLUDED.ab_test_variant
            "#,
        )
        .bind(grant.id)
        .bind(&grant.user_id)
        .bind(grant.schedule_id)
        .bind(&grant.content_type)
        .bind(&grant.content_id)
        .bind(&grant.access_method)
        .bind(&grant.personalized_data)
        .bind(&grant.ab_test_variant)
        .bind(grant.is_active)
        .bind(grant.granted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_grants(
        &self,
        content_type: Option<&str>,
        content_id: Option<&str>,
    ) -> BackendResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM access_grants
            WHERE is_active
              AND ($1::text IS NULL OR content_type = $1)
              AND ($2::text IS NULL OR content_id = $2)
            "#,
        )
        .bind(content_type)
        .bind(content_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// ============================================================================
// ActivityReader
// ============================================================================

#[async_trait]
impl ActivityReader for PostgresBackend {
    async fn resolve_audience(
        &self,
        filter: Option<&AudienceFilter>,
    ) -> BackendResult<Vec<String>> {
        let Some(filter) = filter else {
            let ids = sqlx::query_scalar::<_, String>("SELECT id FROM users ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
            return Ok(ids);
        };
        if let Some(user_ids) = &filter.user_ids {
            return Ok(user_ids.clone());
        }
        if let Some(predicate) = filter.predicate() {
            let ids = self.user_ids_matching(&predicate).await?;
            return Ok(ids);
        }
        Ok(Vec::new())
    }

    async fn count_user_actions(
        &self,
        action: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> BackendResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM user_actions
            WHERE ($1::text IS NULL OR action = $1)
              AND ($2::timestamptz IS NULL OR occurred_at >= $2)
            "#,
        )
        .bind(action)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_poll_responses(
        &self,
        poll_id: Option<&str>,
        response_value: Option<&str>,
    ) -> BackendResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM poll_responses
            WHERE ($1::text IS NULL OR poll_id = $1)
              AND ($2::text IS NULL OR response_value = $2)
            "#,
        )
        .bind(poll_id)
        .bind(response_value)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_event_poll_responses(&self, event_id: Option<&str>) -> BackendResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM poll_responses WHERE ($1::text IS NULL OR event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_completed_chapters(&self, chapter_id: Option<&str>) -> BackendResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM chapter_progress
            WHERE completed AND ($1::text IS NULL OR chapter_id = $1)
            "#,
        )
        .bind(chapter_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_progress_rows(&self, chapter_id: Option<&str>) -> BackendResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM chapter_progress WHERE ($1::text IS NULL OR chapter_id = $1)",
        )
        .bind(chapter_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_chat_messages(&self, event_id: Option<&str>) -> BackendResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM chat_messages WHERE ($1::text IS NULL OR event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_users_matching(&self, predicate: &AttributePredicate) -> BackendResult<i64> {
        let count = match predicate {
            AttributePredicate::IsAdmin(expected) => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE is_admin = $1")
                    .bind(expected)
                    .fetch_one(&self.pool)
                    .await?
            }
            AttributePredicate::EmailVerified(expected) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM users WHERE email_verified = $1",
                )
                .bind(expected)
                .fetch_one(&self.pool)
                .await?
            }
            AttributePredicate::EmailEquals(email) => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE email = $1")
                    .bind(email)
                    .fetch_one(&self.pool)
                    .await?
            }
            AttributePredicate::CreatedBefore(at) => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE created_at < $1")
                    .bind(at)
                    .fetch_one(&self.pool)
                    .await?
            }
            AttributePredicate::CreatedAfter(at) => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE created_at > $1")
                    .bind(at)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }
}

impl PostgresBackend {
    async fn user_ids_matching(&self, predicate: &AttributePredicate) -> BackendResult<Vec<String>> {
        let ids = match predicate {
            AttributePredicate::IsAdmin(expected) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT id FROM users WHERE is_admin = $1 ORDER BY id",
                )
                .bind(expected)
                .fetch_all(&self.pool)
                .await?
            }
            AttributePredicate::EmailVerified(expected) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT id FROM users WHERE email_verified = $1 ORDER BY id",
                )
                .bind(expected)
                .fetch_all(&self.pool)
                .await?
            }
            AttributePredicate::EmailEquals(email) => {
                sqlx::query_scalar::<_, String>("SELECT id FROM users WHERE email = $1 ORDER BY id")
                    .bind(email)
                    .fetch_all(&self.pool)
                    .await?
            }
            AttributePredicate::CreatedBefore(at) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT id FROM users WHERE created_at < $1 ORDER BY id",
                )
                .bind(at)
                .fetch_all(&self.pool)
                .await?
            }
            AttributePredicate::CreatedAfter(at) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT id FROM users WHERE created_at > $1 ORDER BY id",
                )
                .bind(at)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(ids)
    }
}

// ============================================================================
// AuditSink
// ============================================================================

#[async_trait]
impl AuditSink for PostgresBackend {
    async fn record(&self, entry: &AuditEntry) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_entries (id, schedule_id, job_id, content_type, content_id,
                release_kind, recipients, recipient_count, success, error_message, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.schedule_id)
        .bind(entry.job_id)
        .bind(&entry.content_type)
        .bind(&entry.content_id)
        .bind(&entry.release_kind)
        .bind(serde_json::to_value(&entry.recipients)?)
        .bind(entry.recipient_count)
        .bind(entry.success)
        .bind(&entry.error_message)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_schedule(
        &self,
        schedule_id: ScheduleId,
        limit: i64,
    ) -> BackendResult<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, schedule_id, job_id, content_type, content_id, release_kind, recipients,
                   recipient_count, success, error_message, recorded_at
            FROM audit_entries
            WHERE schedule_id = $1
            ORDER BY recorded_at DESC
            LIMIT $2
            "#,
        )
        .bind(schedule_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
