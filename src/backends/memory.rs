//! In-memory backend for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::base::{
    ActivityReader, AuditSink, BackendError, BackendResult, GrantStore, JobStore, Notifier,
    ScheduleStore,
};
use crate::models::{
    AccessGrant, AttributePredicate, AudienceFilter, AuditEntry, JobId, JobStatus, ReleaseJob,
    ReleaseSchedule, ScheduleId, ScheduleStatus, UserRecord,
};

/// One recorded user action in the activity read model.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub user_id: String,
    pub action: String,
    pub occurred_at: DateTime<Utc>,
}

/// One recorded poll response.
#[derive(Debug, Clone)]
pub struct PollResponseRecord {
    pub user_id: String,
    pub poll_id: String,
    pub event_id: Option<String>,
    pub response_value: Option<String>,
    pub responded_at: DateTime<Utc>,
}

/// One chapter-progress row.
#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub user_id: String,
    pub chapter_id: String,
    pub completed: bool,
}

/// One chat message.
#[derive(Debug, Clone)]
pub struct ChatMessageRecord {
    pub user_id: String,
    pub event_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Backend that keeps every table in memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    schedules: Arc<Mutex<HashMap<Uuid, ReleaseSchedule>>>,
    jobs: Arc<Mutex<HashMap<Uuid, ReleaseJob>>>,
    grants: Arc<Mutex<HashMap<(String, Uuid), AccessGrant>>>,
    users: Arc<Mutex<Vec<UserRecord>>>,
    actions: Arc<Mutex<Vec<ActionRecord>>>,
    poll_responses: Arc<Mutex<Vec<PollResponseRecord>>>,
    progress: Arc<Mutex<Vec<ProgressRecord>>>,
    chat_messages: Arc<Mutex<Vec<ChatMessageRecord>>>,
    ping_error: Arc<Mutex<Option<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: UserRecord) {
        self.users.lock().expect("users poisoned").push(user);
    }

    pub fn record_action(&self, record: ActionRecord) {
        self.actions.lock().expect("actions poisoned").push(record);
    }

    pub fn record_poll_response(&self, record: PollResponseRecord) {
        self.poll_responses
            .lock()
            .expect("poll responses poisoned")
            .push(record);
    }

    pub fn record_progress(&self, record: ProgressRecord) {
        self.progress.lock().expect("progress poisoned").push(record);
    }

    pub fn record_chat_message(&self, record: ChatMessageRecord) {
        self.chat_messages
            .lock()
            .expect("chat messages poisoned")
            .push(record);
    }

    /// Make subsequent pings fail with the given message (None restores).
    pub fn set_ping_error(&self, error: Option<&str>) {
        *self.ping_error.lock().expect("ping error poisoned") = error.map(str::to_string);
    }

    pub fn jobs(&self) -> Vec<ReleaseJob> {
        self.jobs.lock().expect("jobs poisoned").values().cloned().collect()
    }

    pub fn grants(&self) -> Vec<AccessGrant> {
        self.grants
            .lock()
            .expect("grants poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn schedules(&self) -> Vec<ReleaseSchedule> {
        self.schedules
            .lock()
            .expect("schedules poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobStore for MemoryBackend {
    async fn insert_job(&self, job: &ReleaseJob) -> BackendResult<()> {
        let mut guard = self.jobs.lock().expect("jobs poisoned");
        guard.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> BackendResult<Option<ReleaseJob>> {
        let guard = self.jobs.lock().expect("jobs poisoned");
        Ok(guard.get(&id.0).cloned())
    }

    async fn find_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BackendResult<Vec<ReleaseJob>> {
        let guard = self.jobs.lock().expect("jobs poisoned");
        let mut due: Vec<_> = guard
            .values()
            .filter(|job| {
                matches!(job.status, JobStatus::Pending | JobStatus::Retrying)
                    && job.scheduled_for <= now
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_for.cmp(&b.scheduled_for))
        });
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn mark_processing(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> BackendResult<Option<ReleaseJob>> {
        let mut guard = self.jobs.lock().expect("jobs poisoned");
        let Some(job) = guard.get_mut(&id.0) else {
            return Ok(None);
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Retrying) {
            return Ok(None);
        }
        job.status = JobStatus::Processing;
        job.attempt_count += 1;
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        id: JobId,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        let mut guard = self.jobs.lock().expect("jobs poisoned");
        let job = guard
            .get_mut(&id.0)
            .ok_or_else(|| BackendError::NotFound(format!("job {id}")))?;
        if job.status == JobStatus::Processing {
            job.status = JobStatus::Completed;
            job.result = result;
            job.completed_at = Some(now);
        }
        Ok(())
    }

    async fn retry_job(
        &self,
        id: JobId,
        error: &str,
        next_run: DateTime<Utc>,
    ) -> BackendResult<()> {
        let mut guard = self.jobs.lock().expect("jobs poisoned");
        let job = guard
            .get_mut(&id.0)
            .ok_or_else(|| BackendError::NotFound(format!("job {id}")))?;
        if job.status == JobStatus::Processing {
            job.status = JobStatus::Retrying;
            job.error_message = Some(error.to_string());
            job.scheduled_for = next_run;
            job.started_at = None;
        }
        Ok(())
    }

    async fn fail_job(&self, id: JobId, error: &str, now: DateTime<Utc>) -> BackendResult<()> {
        let mut guard = self.jobs.lock().expect("jobs poisoned");
        let job = guard
            .get_mut(&id.0)
            .ok_or_else(|| BackendError::NotFound(format!("job {id}")))?;
        if job.status == JobStatus::Processing {
            job.status = JobStatus::Failed;
            job.error_message = Some(error.to_string());
            job.completed_at = Some(now);
        }
        Ok(())
    }

    async fn cancel_job(&self, id: JobId) -> BackendResult<bool> {
        let mut guard = self.jobs.lock().expect("jobs poisoned");
        let Some(job) = guard.get_mut(&id.0) else {
            return Ok(false);
        };
        if matches!(job.status, JobStatus::Pending | JobStatus::Retrying) {
            job.status = JobStatus::Cancelled;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn reclaim_stuck_jobs(
        &self,
        stuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BackendResult<u64> {
        let mut guard = self.jobs.lock().expect("jobs poisoned");
        let mut reclaimed = 0u64;
        for job in guard.values_mut() {
            let stuck = job.status == JobStatus::Processing
                && job.started_at.map(|t| t < stuck_before).unwrap_or(false);
            if stuck {
                job.status = JobStatus::Retrying;
                job.scheduled_for = now + chrono::Duration::minutes(job.retry_delay_minutes);
                job.started_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn ping(&self) -> BackendResult<()> {
        let guard = self.ping_error.lock().expect("ping error poisoned");
        match guard.as_ref() {
            Some(message) => Err(BackendError::Message(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ScheduleStore for MemoryBackend {
    async fn insert_schedule(&self, schedule: &ReleaseSchedule) -> BackendResult<()> {
        let mut guard = self.schedules.lock().expect("schedules poisoned");
        guard.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: ScheduleId) -> BackendResult<Option<ReleaseSchedule>> {
        let guard = self.schedules.lock().expect("schedules poisoned");
        Ok(guard.get(&id.0).cloned())
    }

    async fn list_schedules(
        &self,
        limit: i64,
        offset: i64,
    ) -> BackendResult<Vec<ReleaseSchedule>> {
        let guard = self.schedules.lock().expect("schedules poisoned");
        let mut schedules: Vec<_> = guard.values().cloned().collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn set_schedule_status(
        &self,
        id: ScheduleId,
        status: ScheduleStatus,
    ) -> BackendResult<bool> {
        let mut guard = self.schedules.lock().expect("schedules poisoned");
        if let Some(schedule) = guard.get_mut(&id.0) {
            schedule.status = status;
            schedule.updated_at = Utc::now();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn record_execution(&self, id: ScheduleId, at: DateTime<Utc>) -> BackendResult<()> {
        let mut guard = self.schedules.lock().expect("schedules poisoned");
        let schedule = guard
            .get_mut(&id.0)
            .ok_or_else(|| BackendError::NotFound(format!("schedule {id}")))?;
        schedule.execution_count += 1;
        schedule.last_executed_at = Some(at);
        schedule.updated_at = at;
        Ok(())
    }
}

#[async_trait]
impl GrantStore for MemoryBackend {
    async fn upsert_grant(&self, grant: &AccessGrant) -> BackendResult<()> {
        let mut guard = self.grants.lock().expect("grants poisoned");
        let key = (grant.user_id.clone(), grant.schedule_id);
        guard.insert(key, grant.clone());
        Ok(())
    }

    async fn count_grants(
        &self,
        content_type: Option<&str>,
        content_id: Option<&str>,
    ) -> BackendResult<i64> {
        let guard = self.grants.lock().expect("grants poisoned");
        let count = guard
            .values()
            .filter(|grant| {
                grant.is_active
                    && content_type.map(|t| grant.content_type == t).unwrap_or(true)
                    && content_id
                        .map(|c| grant.content_id.as_deref() == Some(c))
                        .unwrap_or(true)
            })
            .count();
        Ok(count as i64)
    }
}

#[async_trait]
impl ActivityReader for MemoryBackend {
    async fn resolve_audience(
        &self,
        filter: Option<&AudienceFilter>,
    ) -> BackendResult<Vec<String>> {
        let Some(filter) = filter else {
            let guard = self.users.lock().expect("users poisoned");
            let mut ids: Vec<_> = guard.iter().map(|u| u.id.clone()).collect();
            ids.sort();
            return Ok(ids);
        };
        if let Some(user_ids) = &filter.user_ids {
            return Ok(user_ids.clone());
        }
        if let Some(predicate) = filter.predicate() {
            let guard = self.users.lock().expect("users poisoned");
            let mut ids: Vec<_> = guard
                .iter()
                .filter(|u| matches_predicate(u, &predicate))
                .map(|u| u.id.clone())
                .collect();
            ids.sort();
            return Ok(ids);
        }
        // A filter that encodes nothing usable targets nobody.
        Ok(Vec::new())
    }

    async fn count_user_actions(
        &self,
        action: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> BackendResult<i64> {
        let guard = self.actions.lock().expect("actions poisoned");
        let count = guard
            .iter()
            .filter(|r| {
                action.map(|a| r.action == a).unwrap_or(true)
                    && since.map(|s| r.occurred_at >= s).unwrap_or(true)
            })
            .count();
        Ok(count as i64)
    }

    async fn count_poll_responses(
        &self,
        poll_id: Option<&str>,
        response_value: Option<&str>,
    ) -> BackendResult<i64> {
        let guard = self.poll_responses.lock().expect("poll responses poisoned");
        let count = guard
            .iter()
            .filter(|r| {
                poll_id.map(|p| r.poll_id == p).unwrap_or(true)
                    && response_value
                        .map(|v| r.response_value.as_deref() == Some(v))
                        .unwrap_or(true)
            })
            .count();
        Ok(count as i64)
    }

    async fn count_event_poll_responses(&self, event_id: Option<&str>) -> BackendResult<i64> {
        let guard = self.poll_responses.lock().expect("poll responses poisoned");
        let count = guard
            .iter()
            .filter(|r| {
                event_id
                    .map(|e| r.event_id.as_deref() == Some(e))
                    .unwrap_or(true)
            })
            .count();
        Ok(count as i64)
    }

    async fn count_completed_chapters(&self, chapter_id: Option<&str>) -> BackendResult<i64> {
        let guard = self.progress.lock().expect("progress poisoned");
        let count = guard
            .iter()
            .filter(|r| r.completed && chapter_id.map(|c| r.chapter_id == c).unwrap_or(true))
            .count();
        Ok(count as i64)
    }

    async fn count_progress_rows(&self, chapter_id: Option<&str>) -> BackendResult<i64> {
        let guard = self.progress.lock().expect("progress poisoned");
        let count = guard
            .iter()
            .filter(|r| chapter_id.map(|c| r.chapter_id == c).unwrap_or(true))
            .count();
        Ok(count as i64)
    }

    async fn count_chat_messages(&self, event_id: Option<&str>) -> BackendResult<i64> {
        let guard = self.chat_messages.lock().expect("chat messages poisoned");
        let count = guard
            .iter()
            .filter(|r| {
                event_id
                    .map(|e| r.event_id.as_deref() == Some(e))
                    .unwrap_or(true)
            })
            .count();
        Ok(count as i64)
    }

    async fn count_users_matching(&self, predicate: &AttributePredicate) -> BackendResult<i64> {
        let guard = self.users.lock().expect("users poisoned");
        let count = guard.iter().filter(|u| matches_predicate(u, predicate)).count();
        Ok(count as i64)
    }
}

fn matches_predicate(user: &UserRecord, predicate: &AttributePredicate) -> bool {
    match predicate {
        AttributePredicate::IsAdmin(expected) => user.is_admin == *expected,
        AttributePredicate::EmailVerified(expected) => user.email_verified == *expected,
        AttributePredicate::EmailEquals(email) => user.email.as_deref() == Some(email.as_str()),
        AttributePredicate::CreatedBefore(at) => user.created_at < *at,
        AttributePredicate::CreatedAfter(at) => user.created_at > *at,
    }
}

/// One delivery captured by [`MemoryNotifier`].
#[derive(Debug, Clone)]
pub struct SentNotification {
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
}

/// Notifier fake that records deliveries, with optional per-send latency and
/// injectable failure for drain/error-path tests.
#[derive(Clone, Default)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<SentNotification>>>,
    delay: Option<Duration>,
    fail: Arc<Mutex<bool>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().expect("fail flag poisoned") = failing;
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().expect("sent poisoned").clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(
        &self,
        user_id: &str,
        title: &str,
        message: &str,
        action_url: Option<&str>,
        _metadata: Option<&Value>,
    ) -> BackendResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail.lock().expect("fail flag poisoned") {
            return Err(BackendError::Message("notifier unavailable".to_string()));
        }
        self.sent.lock().expect("sent poisoned").push(SentNotification {
            user_id: user_id.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            action_url: action_url.map(str::to_string),
        });
        Ok(())
    }
}

/// Audit sink fake that appends to a vector.
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().expect("entries poisoned").clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: &AuditEntry) -> BackendResult<()> {
        self.entries.lock().expect("entries poisoned").push(entry.clone());
        Ok(())
    }

    async fn list_for_schedule(
        &self,
        schedule_id: ScheduleId,
        limit: i64,
    ) -> BackendResult<Vec<AuditEntry>> {
        let guard = self.entries.lock().expect("entries poisoned");
        Ok(guard
            .iter()
            .filter(|e| e.schedule_id == schedule_id.0)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
