//! Engine error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the engine.
pub type JobResult<T> = Result<T, JobError>;

/// Failure reported by a job handler (the delegated business logic).
///
/// `message` becomes the job's `exception_message`, `details` its
/// `exception_stacktrace`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerError {
    pub message: String,
    pub details: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl core::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<JobError> for HandlerError {
    fn from(value: JobError) -> Self {
        Self::new(value.to_string())
    }
}

/// Engine-level error.
///
/// `NotFound`, `Unauthorized`, `Validation`, `HandlerFailure`, `Configuration` and
/// `Exhausted` are the job lifecycle failures. `Conflict`, `Locked` and `Storage`
/// come from the persistence boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// A referenced job (or process instance) does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The caller does not hold the lock it needs (external workers).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed input, rejected before any state mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The business handler failed; the job went through retry accounting.
    #[error("job handler failed: {0}")]
    HandlerFailure(HandlerError),

    /// Malformed retry-cycle expression or other engine misconfiguration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Retries reached the floor and the job was dead-lettered.
    #[error("retries exhausted for job {0}")]
    Exhausted(String),

    /// Optimistic revision check failed (another actor changed the row).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Administrative action on a job that is actively leased.
    #[error("job {0} is locked by an active lease")]
    Locked(String),

    /// Backend failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn job_not_found(id: impl ToString) -> Self {
        Self::not_found("job", id)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
