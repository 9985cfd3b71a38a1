//! Engine configuration.
//!
//! Every component receives the same [`EngineConfig`] through its
//! [`EngineContext`](crate::jobs::EngineContext); there is no process-wide
//! settings singleton. Values come from code (`Default` + `with_*` builders) or
//! from `JOBFORGE_*` environment variables with development defaults.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Configuration error (bad environment value).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must not be empty")]
    Empty { key: &'static str },
    #[error("{key} must be at most {max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        max: u64,
    },
}

/// Largest lock time or failed-job wait accepted from the environment (30 days).
pub const MAX_WAIT_SECS: u64 = 30 * 24 * 60 * 60;
/// Largest acquisition interval accepted from the environment (one hour).
pub const MAX_ACQUISITION_INTERVAL_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Identity written to `lock_owner` by this executor's acquisition passes.
    pub lock_owner: String,
    /// Lease duration for acquired jobs and for process-instance exclusivity locks.
    pub async_job_lock_time: Duration,
    /// Upper bound on jobs leased by one acquisition pass.
    pub max_jobs_per_acquisition: usize,
    /// Retries given to new jobs that do not specify their own.
    pub default_job_retries: u32,
    /// Backoff for failed jobs without a prior due date (async continuations, messages).
    pub async_failed_job_wait_time: Duration,
    /// Backoff for failed timer-type jobs, added to their prior due date.
    pub default_failed_job_wait_time: Duration,
    /// Tick between acquisition passes of the async executor.
    pub acquisition_interval: Duration,
    /// Worker threads in the async executor's pool.
    pub worker_threads: usize,
    /// Bounded hand-off queue between acquisition and the worker pool.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_owner: Uuid::now_v7().to_string(),
            async_job_lock_time: Duration::from_secs(300),
            max_jobs_per_acquisition: 16,
            default_job_retries: 3,
            async_failed_job_wait_time: Duration::from_secs(10),
            default_failed_job_wait_time: Duration::from_secs(60),
            acquisition_interval: Duration::from_secs(1),
            worker_threads: 4,
            queue_capacity: 16,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `JOBFORGE_*` environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `JOBFORGE_LOCK_OWNER` | random UUID |
    /// | `JOBFORGE_LOCK_TIME_SECS` | 300 |
    /// | `JOBFORGE_MAX_JOBS_PER_ACQUISITION` | 16 |
    /// | `JOBFORGE_DEFAULT_RETRIES` | 3 |
    /// | `JOBFORGE_ASYNC_FAILED_WAIT_SECS` | 10 |
    /// | `JOBFORGE_DEFAULT_FAILED_WAIT_SECS` | 60 |
    /// | `JOBFORGE_ACQUISITION_INTERVAL_MS` | 1000 |
    /// | `JOBFORGE_WORKER_THREADS` | 4 |
    /// | `JOBFORGE_QUEUE_CAPACITY` | 16 |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let lock_owner = match lookup("JOBFORGE_LOCK_OWNER") {
            Some(value) if value.trim().is_empty() => {
                return Err(ConfigError::Empty {
                    key: "JOBFORGE_LOCK_OWNER",
                });
            }
            Some(value) => value.trim().to_string(),
            None => defaults.lock_owner,
        };

        let secs = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_bounded(&lookup, key, MAX_WAIT_SECS)?.map_or(default, Duration::from_secs))
        };

        Ok(Self {
            lock_owner,
            async_job_lock_time: secs("JOBFORGE_LOCK_TIME_SECS", defaults.async_job_lock_time)?,
            max_jobs_per_acquisition: parse_positive(&lookup, "JOBFORGE_MAX_JOBS_PER_ACQUISITION")?
                .map_or(defaults.max_jobs_per_acquisition, |n| n as usize),
            default_job_retries: parse_positive(&lookup, "JOBFORGE_DEFAULT_RETRIES")?
                .map_or(defaults.default_job_retries, |n| n.min(u32::MAX as u64) as u32),
            async_failed_job_wait_time: secs(
                "JOBFORGE_ASYNC_FAILED_WAIT_SECS",
                defaults.async_failed_job_wait_time,
            )?,
            default_failed_job_wait_time: secs(
                "JOBFORGE_DEFAULT_FAILED_WAIT_SECS",
                defaults.default_failed_job_wait_time,
            )?,
            acquisition_interval: parse_bounded(
                &lookup,
                "JOBFORGE_ACQUISITION_INTERVAL_MS",
                MAX_ACQUISITION_INTERVAL_MS,
            )?
            .map_or(defaults.acquisition_interval, Duration::from_millis),
            worker_threads: parse_positive(&lookup, "JOBFORGE_WORKER_THREADS")?
                .map_or(defaults.worker_threads, |n| n as usize),
            queue_capacity: parse_positive(&lookup, "JOBFORGE_QUEUE_CAPACITY")?
                .map_or(defaults.queue_capacity, |n| n as usize),
        })
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn with_async_job_lock_time(mut self, lock_time: Duration) -> Self {
        self.async_job_lock_time = lock_time;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_default_job_retries(mut self, retries: u32) -> Self {
        self.default_job_retries = retries;
        self
    }

    pub fn with_async_failed_job_wait_time(mut self, wait: Duration) -> Self {
        self.async_failed_job_wait_time = wait;
        self
    }

    pub fn with_default_failed_job_wait_time(mut self, wait: Duration) -> Self {
        self.default_failed_job_wait_time = wait;
        self
    }

    pub fn with_acquisition_interval(mut self, interval: Duration) -> Self {
        self.acquisition_interval = interval;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// `at + duration`, or `None` when the result leaves chrono's range.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
}

fn parse_positive<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(ConfigError::InvalidNumber { key, value: raw }),
        },
    }
}

fn parse_bounded<F>(lookup: &F, key: &'static str, max: u64) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_positive(lookup, key)? {
        Some(value) if value > max => Err(ConfigError::OutOfRange { key, value, max }),
        other => Ok(other),
    }
}
