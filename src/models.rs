//! Data model for schedules, jobs, grants, and audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Type Aliases & Newtypes
// ============================================================================

/// Unique identifier for a release schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a release job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status Enums
// ============================================================================

/// Lifecycle status of a release schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Expired,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Status of a release job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "retrying" => Some(Self::Retrying),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses are never picked up by a poll pass again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ContentRelease,
    Notification,
    ConditionCheck,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContentRelease => "content_release",
            Self::Notification => "notification",
            Self::ConditionCheck => "condition_check",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "content_release" => Some(Self::ContentRelease),
            "notification" => Some(Self::Notification),
            "condition_check" => Some(Self::ConditionCheck),
            _ => None,
        }
    }
}

/// How a schedule combines its conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLogic {
    #[default]
    And,
    Or,
}

impl ConditionLogic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            _ => None,
        }
    }
}

// ============================================================================
// Audience
// ============================================================================

/// Who a release targets. `None` everywhere means every known user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudienceFilter {
    /// Explicit user ids; takes precedence over the attribute filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    /// Attribute name for predicate-based targeting (`isAdmin`, `email`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl AudienceFilter {
    pub fn for_users(user_ids: Vec<String>) -> Self {
        Self {
            user_ids: Some(user_ids),
            ..Self::default()
        }
    }

    /// The attribute predicate encoded by this filter, if any.
    pub fn predicate(&self) -> Option<AttributePredicate> {
        let attribute = self.attribute.as_deref()?;
        AttributePredicate::from_parts(attribute, self.operator.as_deref(), self.value.as_ref())
    }
}

/// A typed user-attribute predicate the activity read model can count against.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributePredicate {
    IsAdmin(bool),
    EmailVerified(bool),
    EmailEquals(String),
    CreatedBefore(DateTime<Utc>),
    CreatedAfter(DateTime<Utc>),
}

impl AttributePredicate {
    /// Build a predicate from raw DSL parts. Returns `None` for anything the
    /// read model cannot answer, which callers treat as an unmet condition.
    pub fn from_parts(
        attribute: &str,
        operator: Option<&str>,
        value: Option<&Value>,
    ) -> Option<Self> {
        match attribute {
            "isAdmin" | "is_admin" => {
                let expected = value.and_then(Value::as_bool).unwrap_or(true);
                Some(Self::IsAdmin(expected))
            }
            "emailVerified" | "email_verified" => {
                let expected = value.and_then(Value::as_bool).unwrap_or(true);
                Some(Self::EmailVerified(expected))
            }
            "email" => value
                .and_then(Value::as_str)
                .map(|email| Self::EmailEquals(email.to_string())),
            "createdAt" | "created_at" => {
                let at = value
                    .and_then(Value::as_str)
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|t| t.with_timezone(&Utc))?;
                match operator {
                    Some("before") => Some(Self::CreatedBefore(at)),
                    Some("after") | None => Some(Self::CreatedAfter(at)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

// ============================================================================
// Model Structs
// ============================================================================

/// Admin-defined configuration describing what content to release, to whom,
/// and under what time/condition trigger.
#[derive(Debug, Clone)]
pub struct ReleaseSchedule {
    pub id: Uuid,
    pub content_type: String,
    pub content_id: Option<String>,
    pub target_audience: Option<AudienceFilter>,
    /// Raw condition DSL documents, parsed per evaluation.
    pub conditions: Vec<Value>,
    pub condition_logic: ConditionLogic,
    pub execution_count: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
    /// Cap on condition-check re-arms.
    pub max_executions: i64,
    pub status: ScheduleStatus,
    pub retry_delay_minutes: i64,
    pub check_interval_minutes: i64,
    pub check_jitter_seconds: i64,
    pub notify_title: Option<String>,
    pub notify_message: Option<String>,
    pub notify_action_url: Option<String>,
    pub personalized_data: Option<Value>,
    pub ab_test_variant: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One queued, time-stamped unit of work belonging to a schedule.
#[derive(Debug, Clone)]
pub struct ReleaseJob {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub scheduled_for: DateTime<Utc>,
    /// Higher values are dispatched first.
    pub priority: i32,
    pub attempt_count: i32,
    pub max_retries: i32,
    pub retry_delay_minutes: i64,
    pub payload: Value,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Record that a specific user was granted access to a piece of content.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub id: Uuid,
    pub user_id: String,
    pub schedule_id: Uuid,
    pub content_type: String,
    pub content_id: Option<String>,
    pub access_method: String,
    pub personalized_data: Option<Value>,
    pub ab_test_variant: Option<String>,
    pub is_active: bool,
    pub granted_at: DateTime<Utc>,
}

/// Immutable record of one execution attempt.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub job_id: Uuid,
    pub content_type: String,
    pub content_id: Option<String>,
    pub release_kind: String,
    pub recipients: Vec<String>,
    pub recipient_count: i64,
    pub success: bool,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// A user row in the activity read model.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub email: Option<String>,
    pub is_admin: bool,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Creation Parameters
// ============================================================================

/// Parameters for queueing a job through the engine's admin surface.
#[derive(Debug, Clone)]
pub struct CreateJobParams {
    pub schedule_id: ScheduleId,
    pub kind: JobKind,
    pub scheduled_for: DateTime<Utc>,
    pub payload: Option<Value>,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub retry_delay_minutes: Option<i64>,
}

/// Parameters for registering a schedule.
#[derive(Debug, Clone)]
pub struct CreateScheduleParams {
    pub content_type: String,
    pub content_id: Option<String>,
    pub target_audience: Option<AudienceFilter>,
    pub conditions: Vec<Value>,
    pub condition_logic: ConditionLogic,
    pub max_executions: Option<i64>,
    pub retry_delay_minutes: Option<i64>,
    pub check_interval_minutes: Option<i64>,
    pub check_jitter_seconds: Option<i64>,
    pub notify_title: Option<String>,
    pub notify_message: Option<String>,
    pub notify_action_url: Option<String>,
    pub personalized_data: Option<Value>,
    pub ab_test_variant: Option<String>,
}

impl CreateScheduleParams {
    pub fn for_content(content_type: impl Into<String>, content_id: Option<String>) -> Self {
        Self {
            content_type: content_type.into(),
            content_id,
            target_audience: None,
            conditions: Vec::new(),
            condition_logic: ConditionLogic::And,
            max_executions: None,
            retry_delay_minutes: None,
            check_interval_minutes: None,
            check_jitter_seconds: None,
            notify_title: None,
            notify_message: None,
            notify_action_url: None,
            personalized_data: None,
            ab_test_variant: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Retrying,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("unknown"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn job_kind_roundtrip() {
        for kind in [
            JobKind::ContentRelease,
            JobKind::Notification,
            JobKind::ConditionCheck,
        ] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("bogus"), None);
    }

    #[test]
    fn condition_logic_defaults_to_and() {
        assert_eq!(ConditionLogic::default(), ConditionLogic::And);
        assert_eq!(ConditionLogic::parse("OR"), Some(ConditionLogic::Or));
        assert_eq!(ConditionLogic::parse("nope"), None);
    }

    #[test]
    fn attribute_predicate_from_parts() {
        assert_eq!(
            AttributePredicate::from_parts("isAdmin", Some("eq"), Some(&serde_json::json!(true))),
            Some(AttributePredicate::IsAdmin(true))
        );
        assert_eq!(
            AttributePredicate::from_parts("email", Some("eq"), Some(&serde_json::json!("a@b.c"))),
            Some(AttributePredicate::EmailEquals("a@b.c".to_string()))
        );
        assert_eq!(
            AttributePredicate::from_parts("favoriteColor", None, None),
            None
        );
        // createdAt needs a parseable timestamp
        assert_eq!(
            AttributePredicate::from_parts(
                "createdAt",
                Some("before"),
                Some(&serde_json::json!("junk"))
            ),
            None
        );
    }

    #[test]
    fn schedule_id_display_is_uuid() {
        let id = ScheduleId::new();
        assert!(Uuid::parse_str(&id.to_string()).is_ok());
    }
}
