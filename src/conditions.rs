//! Condition DSL for gating conditional releases.
//!
//! Conditions arrive as admin-authored `{type, ...}` JSON documents. Each is
//! parsed into a [`ConditionExpression`] and checked against the activity
//! read model. The evaluator is total: unknown types, malformed documents,
//! and read-model failures all count as an unmet condition — callers always
//! get a definite true/false.

use chrono::{Datelike, Timelike};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::backends::{ActivityReader, BackendError, BackendResult, GrantStore};
use crate::clock::Clock;
use crate::models::{AttributePredicate, ConditionLogic, ReleaseSchedule};

/// A single typed condition.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionExpression {
    #[serde(rename_all = "camelCase")]
    UserAction {
        #[serde(default)]
        action: Option<String>,
        threshold: i64,
        /// Window in minutes; absent means all time.
        #[serde(default)]
        time_window: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    TimeBased {
        time_type: TimeType,
        value: Value,
        #[serde(default)]
        operator: Option<TimeOperator>,
    },
    #[serde(rename_all = "camelCase")]
    ContentAccess {
        #[serde(default)]
        content_type: Option<String>,
        #[serde(default)]
        content_id: Option<String>,
        threshold: i64,
    },
    #[serde(rename_all = "camelCase")]
    PollResponse {
        #[serde(default)]
        poll_id: Option<String>,
        #[serde(default)]
        response_value: Option<String>,
        threshold: i64,
    },
    #[serde(rename_all = "camelCase")]
    ChapterCompletion {
        #[serde(default)]
        chapter_id: Option<String>,
        /// Percentage (0-100) of progress rows that must be completed.
        #[serde(default)]
        completion_rate: Option<f64>,
        /// Absolute number of users that must have completed.
        #[serde(default)]
        user_count: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    EventParticipation {
        #[serde(default)]
        event_id: Option<String>,
        participation_type: ParticipationType,
        threshold: i64,
    },
    #[serde(rename_all = "camelCase")]
    UserAttributes {
        attribute: String,
        #[serde(default)]
        operator: Option<String>,
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        threshold: Option<i64>,
    },
    CustomSql { query: String },
}

impl ConditionExpression {
    fn kind(&self) -> &'static str {
        match self {
            Self::UserAction { .. } => "user_action",
            Self::TimeBased { .. } => "time_based",
            Self::ContentAccess { .. } => "content_access",
            Self::PollResponse { .. } => "poll_response",
            Self::ChapterCompletion { .. } => "chapter_completion",
            Self::EventParticipation { .. } => "event_participation",
            Self::UserAttributes { .. } => "user_attributes",
            Self::CustomSql { .. } => "custom_sql",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeType {
    Absolute,
    RelativeHours,
    DayOfWeek,
    HourOfDay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOperator {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationType {
    ChatMessage,
    PollResponse,
}

/// Evaluates condition documents against a queryable activity store.
pub struct ConditionEvaluator<'a, R: ?Sized> {
    reader: &'a R,
    clock: &'a dyn Clock,
}

impl<'a, R> ConditionEvaluator<'a, R>
where
    R: ActivityReader + GrantStore,
{
    pub fn new(reader: &'a R, clock: &'a dyn Clock) -> Self {
        Self { reader, clock }
    }

    /// Evaluate one raw condition document. Never errors: malformed documents
    /// and read failures count as unmet.
    pub async fn evaluate(&self, raw: &Value, schedule: &ReleaseSchedule) -> bool {
        let expr: ConditionExpression = match serde_json::from_value(raw.clone()) {
            Ok(expr) => expr,
            Err(err) => {
                warn!(
                    schedule_id = %schedule.id,
                    error = %err,
                    "unrecognized condition document; treating as unmet"
                );
                return false;
            }
        };
        match self.check(&expr).await {
            Ok(met) => met,
            Err(err) => {
                warn!(
                    schedule_id = %schedule.id,
                    condition = expr.kind(),
                    error = %err,
                    "condition evaluation failed; treating as unmet"
                );
                false
            }
        }
    }

    /// Evaluate a batch under the schedule's combination logic. Conditions
    /// are evaluated independently; a failing condition never aborts its
    /// siblings. AND over an empty batch is true, OR is false.
    pub async fn evaluate_all(
        &self,
        conditions: &[Value],
        logic: ConditionLogic,
        schedule: &ReleaseSchedule,
    ) -> bool {
        let mut results = Vec::with_capacity(conditions.len());
        for condition in conditions {
            results.push(self.evaluate(condition, schedule).await);
        }
        match logic {
            ConditionLogic::And => results.iter().all(|met| *met),
            ConditionLogic::Or => results.iter().any(|met| *met),
        }
    }

    async fn check(&self, expr: &ConditionExpression) -> BackendResult<bool> {
        match expr {
            ConditionExpression::UserAction {
                action,
                threshold,
                time_window,
            } => {
                let since = time_window.map(|minutes| {
                    self.clock.now() - chrono::Duration::minutes(minutes.max(0))
                });
                let count = self
                    .reader
                    .count_user_actions(action.as_deref(), since)
                    .await?;
                Ok(count >= *threshold)
            }
            ConditionExpression::TimeBased {
                time_type,
                value,
                operator,
            } => self.check_time(*time_type, value, *operator),
            ConditionExpression::ContentAccess {
                content_type,
                content_id,
                threshold,
            } => {
                let count = self
                    .reader
                    .count_grants(content_type.as_deref(), content_id.as_deref())
                    .await?;
                Ok(count >= *threshold)
            }
            ConditionExpression::PollResponse {
                poll_id,
                response_value,
                threshold,
            } => {
                let count = self
                    .reader
                    .count_poll_responses(poll_id.as_deref(), response_value.as_deref())
                    .await?;
                Ok(count >= *threshold)
            }
            ConditionExpression::ChapterCompletion {
                chapter_id,
                completion_rate,
                user_count,
            } => {
                if let Some(required) = user_count {
                    let completed = self
                        .reader
                        .count_completed_chapters(chapter_id.as_deref())
                        .await?;
                    return Ok(completed >= *required);
                }
                if let Some(rate) = completion_rate {
                    let total = self.reader.count_progress_rows(chapter_id.as_deref()).await?;
                    if total == 0 {
                        return Ok(false);
                    }
                    let completed = self
                        .reader
                        .count_completed_chapters(chapter_id.as_deref())
                        .await?;
                    let actual = completed as f64 / total as f64 * 100.0;
                    return Ok(actual >= *rate);
                }
                Err(BackendError::Message(
                    "chapter_completion needs userCount or completionRate".to_string(),
                ))
            }
            ConditionExpression::EventParticipation {
                event_id,
                participation_type,
                threshold,
            } => {
                let count = match participation_type {
                    ParticipationType::ChatMessage => {
                        self.reader.count_chat_messages(event_id.as_deref()).await?
                    }
                    ParticipationType::PollResponse => {
                        self.reader
                            .count_event_poll_responses(event_id.as_deref())
                            .await?
                    }
                };
                Ok(count >= *threshold)
            }
            ConditionExpression::UserAttributes {
                attribute,
                operator,
                value,
                threshold,
            } => {
                let predicate =
                    AttributePredicate::from_parts(attribute, operator.as_deref(), value.as_ref())
                        .ok_or_else(|| {
                            BackendError::Message(format!(
                                "unsupported user attribute predicate: {attribute}"
                            ))
                        })?;
                let count = self.reader.count_users_matching(&predicate).await?;
                Ok(count >= threshold.unwrap_or(1))
            }
            ConditionExpression::CustomSql { query } => {
                // Intentionally disabled. The syntactic check only selects the
                // log line; no query is ever executed.
                if query.trim_start().to_ascii_lowercase().starts_with("select") {
                    warn!("custom_sql conditions are disabled; ignoring select query");
                } else {
                    warn!("custom_sql conditions are disabled; ignoring non-select payload");
                }
                Ok(false)
            }
        }
    }

    fn check_time(
        &self,
        time_type: TimeType,
        value: &Value,
        operator: Option<TimeOperator>,
    ) -> BackendResult<bool> {
        let now = self.clock.now();
        match time_type {
            TimeType::Absolute => {
                let raw = value.as_str().ok_or_else(|| {
                    BackendError::Message("absolute time_based condition needs a timestamp".into())
                })?;
                let target = chrono::DateTime::parse_from_rfc3339(raw)
                    .map_err(|err| {
                        BackendError::Message(format!("invalid timestamp {raw:?}: {err}"))
                    })?
                    .with_timezone(&chrono::Utc);
                Ok(match operator.unwrap_or(TimeOperator::After) {
                    TimeOperator::After => now >= target,
                    TimeOperator::Before => now < target,
                })
            }
            TimeType::RelativeHours => {
                let hours = value.as_f64().ok_or_else(|| {
                    BackendError::Message("relative_hours condition needs a number".into())
                })?;
                let reference = now - chrono::Duration::seconds((hours * 3600.0) as i64);
                Ok(match operator.unwrap_or(TimeOperator::After) {
                    TimeOperator::After => now >= reference,
                    TimeOperator::Before => now < reference,
                })
            }
            TimeType::DayOfWeek => {
                let expected = value.as_i64().ok_or_else(|| {
                    BackendError::Message("day_of_week condition needs a number".into())
                })?;
                let today = now.date_naive().weekday().num_days_from_sunday() as i64;
                Ok(today == expected)
            }
            TimeType::HourOfDay => {
                let expected = value.as_i64().ok_or_else(|| {
                    BackendError::Message("hour_of_day condition needs a number".into())
                })?;
                Ok(now.hour() as i64 == expected)
            }
        }
    }
}
