use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{JobId, ProcessInstanceId, TenantId};

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    /// A new job record was inserted into `queue`.
    Created { queue: String },
    /// The job was leased by an executor or external worker.
    Acquired { lock_owner: String },
    /// Handler completed and the job row was deleted.
    ExecutionSuccess,
    /// Handler failed; retry accounting follows.
    ExecutionFailure { message: String },
    /// The job row was rewritten (retry bookkeeping, external worker fail).
    EntityUpdated,
    /// Remaining retries after a failure.
    RetriesDecremented { retries: u32 },
    /// The job landed in the dead-letter queue.
    DeadLettered,
    /// Administrative deletion.
    Deleted,
    Suspended,
    Activated,
    ExternalWorkerCompleted { worker_id: String },
    ExternalWorkerErrorReported {
        worker_id: String,
        error_code: Option<String>,
    },
    ExternalWorkerFailed { worker_id: String, retries: u32 },
}

impl JobEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobEventKind::Created { .. } => "job.created",
            JobEventKind::Acquired { .. } => "job.acquired",
            JobEventKind::ExecutionSuccess => "job.execution_success",
            JobEventKind::ExecutionFailure { .. } => "job.execution_failure",
            JobEventKind::EntityUpdated => "job.entity_updated",
            JobEventKind::RetriesDecremented { .. } => "job.retries_decremented",
            JobEventKind::DeadLettered => "job.dead_lettered",
            JobEventKind::Deleted => "job.deleted",
            JobEventKind::Suspended => "job.suspended",
            JobEventKind::Activated => "job.activated",
            JobEventKind::ExternalWorkerCompleted { .. } => "job.external_worker_completed",
            JobEventKind::ExternalWorkerErrorReported { .. } => {
                "job.external_worker_error_reported"
            }
            JobEventKind::ExternalWorkerFailed { .. } => "job.external_worker_failed",
        }
    }
}

/// Observability notification emitted after a job transition commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub tenant_id: Option<TenantId>,
    pub kind: JobEventKind,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: JobId, kind: JobEventKind, occurred_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            process_instance_id: None,
            tenant_id: None,
            kind,
            occurred_at,
        }
    }

    pub fn with_process_instance(mut self, id: Option<ProcessInstanceId>) -> Self {
        self.process_instance_id = id;
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }
}
