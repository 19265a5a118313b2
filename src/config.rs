//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `UNVEIL_DATABASE_URL`: PostgreSQL connection string (required)
//! - `UNVEIL_POLL_INTERVAL_MS`: Due-job polling interval (default: 30000)
//! - `UNVEIL_HEALTH_CHECK_INTERVAL_MS`: Health sweep interval (default: 60000)
//! - `UNVEIL_MAX_CONCURRENT_JOBS`: In-flight job bound (default: 5)
//! - `UNVEIL_SHUTDOWN_TIMEOUT_MS`: Drain timeout on stop (default: 30000)
//! - `UNVEIL_STUCK_JOB_THRESHOLD_MS`: Processing age before reclamation (default: 3600000)
//! - `UNVEIL_DEFAULT_MAX_RETRIES`: Retry budget for new jobs (default: 3)
//! - `UNVEIL_DEFAULT_RETRY_DELAY_MINUTES`: Fixed retry offset (default: 5)
//! - `UNVEIL_CHECK_INTERVAL_MINUTES`: Condition re-check spacing (default: 60)
//! - `UNVEIL_DEFAULT_MAX_EXECUTIONS`: Condition re-check budget (default: 10)

use std::{
    env,
    sync::{OnceLock, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};

use crate::engine::EngineConfig;

/// Global configuration cache
static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Due-job polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Health sweep interval in milliseconds
    pub health_check_interval_ms: u64,

    /// Upper bound on concurrently executing jobs
    pub max_concurrent_jobs: usize,

    /// Drain timeout on stop, in milliseconds
    pub shutdown_timeout_ms: u64,

    /// Processing age before a job counts as stuck, in milliseconds
    pub stuck_job_threshold_ms: u64,

    /// Retry budget applied to jobs that do not specify their own
    pub default_max_retries: i32,

    /// Fixed retry offset in minutes
    pub default_retry_delay_minutes: i64,

    /// Condition re-check spacing in minutes
    pub check_interval_minutes: i64,

    /// Condition re-check budget per schedule
    pub default_max_executions: i64,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("UNVEIL_DATABASE_URL")
            .context("UNVEIL_DATABASE_URL environment variable is required")?;

        let poll_interval_ms = env::var("UNVEIL_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30_000);

        let health_check_interval_ms = env::var("UNVEIL_HEALTH_CHECK_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60_000);

        let max_concurrent_jobs = env::var("UNVEIL_MAX_CONCURRENT_JOBS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let shutdown_timeout_ms = env::var("UNVEIL_SHUTDOWN_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30_000);

        let stuck_job_threshold_ms = env::var("UNVEIL_STUCK_JOB_THRESHOLD_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3_600_000);

        let default_max_retries = env::var("UNVEIL_DEFAULT_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let default_retry_delay_minutes = env::var("UNVEIL_DEFAULT_RETRY_DELAY_MINUTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let check_interval_minutes = env::var("UNVEIL_CHECK_INTERVAL_MINUTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let default_max_executions = env::var("UNVEIL_DEFAULT_MAX_EXECUTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            database_url,
            poll_interval_ms,
            health_check_interval_ms,
            max_concurrent_jobs,
            shutdown_timeout_ms,
            stuck_job_threshold_ms,
            default_max_retries,
            default_retry_delay_minutes,
            check_interval_minutes,
            default_max_executions,
        })
    }

    /// Translate into the engine's runtime tunables.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            max_concurrent_jobs: self.max_concurrent_jobs,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            drain_poll_interval: Duration::from_secs(1),
            stuck_job_threshold: Duration::from_millis(self.stuck_job_threshold_ms),
            default_max_retries: self.default_max_retries,
            default_retry_delay_minutes: self.default_retry_delay_minutes,
            default_check_interval_minutes: self.check_interval_minutes,
            default_max_executions: self.default_max_executions,
        }
    }

    /// Create a test configuration with defaults
    #[cfg(test)]
    pub fn test_config(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            poll_interval_ms: 50,
            health_check_interval_ms: 1_000,
            max_concurrent_jobs: 5,
            shutdown_timeout_ms: 5_000,
            stuck_job_threshold_ms: 3_600_000,
            default_max_retries: 3,
            default_retry_delay_minutes: 5,
            check_interval_minutes: 60,
            default_max_executions: 10,
        }
    }
}

/// Get the global configuration, loading from environment if not yet
/// initialized.
///
/// # Panics
///
/// Panics if configuration loading fails (e.g., missing UNVEIL_DATABASE_URL).
pub fn get_config() -> Config {
    CONFIG
        .get_or_init(|| {
            let config = Config::from_env().expect("failed to load configuration from environment");
            RwLock::new(config)
        })
        .read()
        .expect("config lock poisoned")
        .clone()
}

/// Like `get_config()` but returns a Result instead of panicking.
pub fn try_get_config() -> Result<Config> {
    match CONFIG.get() {
        Some(lock) => Ok(lock.read().expect("config lock poisoned").clone()),
        None => {
            let config = Config::from_env()?;
            let lock = CONFIG.get_or_init(|| RwLock::new(config.clone()));
            Ok(lock.read().expect("config lock poisoned").clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_translates_to_engine_config() {
        let config = Config::test_config("postgres://test");
        let engine = config.engine_config();
        assert_eq!(engine.poll_interval, Duration::from_millis(50));
        assert_eq!(engine.max_concurrent_jobs, 5);
        assert_eq!(engine.default_max_executions, 10);
    }
}
