//! Unveil - scheduled content-release engine for event companion apps.
//!
//! The engine polls a durable store for due release jobs, executes them with
//! bounded concurrency, evaluates condition DSL documents against a user
//! activity read model, and recovers jobs abandoned mid-execution. HTTP
//! transport, authentication, and the admin UI are the host application's
//! concern; they talk to the engine through [`engine::ReleaseEngine`].

pub mod backends;
pub mod clock;
pub mod conditions;
pub mod config;
pub mod engine;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod models;

pub use backends::{
    ActivityReader, AuditSink, BackendError, BackendResult, GrantStore, JobStore, LoggingNotifier,
    MemoryAuditSink, MemoryBackend, MemoryNotifier, Notifier, PostgresBackend, ReleaseStore,
    ScheduleStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conditions::{ConditionEvaluator, ConditionExpression};
pub use config::{Config, get_config, try_get_config};
pub use engine::{EngineConfig, EngineError, EngineStatus, ReleaseEngine};
pub use executor::{ExecutionOutcome, JobExecutor};
pub use health::{HealthMonitor, HealthMonitorConfig};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use models::{
    AccessGrant, AttributePredicate, AudienceFilter, AuditEntry, ConditionLogic, CreateJobParams,
    CreateScheduleParams, JobId, JobKind, JobStatus, ReleaseJob, ReleaseSchedule, ScheduleId,
    ScheduleStatus, UserRecord,
};
