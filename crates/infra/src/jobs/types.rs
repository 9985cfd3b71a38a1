//! Core job types.
//!
//! A job's lifecycle phase is the queue it lives in. [`Job`] is a tagged variant
//! over the five queues wrapping one shared [`JobRecord`] shape; moving a job
//! between phases means deleting the old variant and inserting a new one, never
//! flipping a status field.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{ExecutionId, JobError, JobId, JobResult, ProcessInstanceId, TenantId};

/// Variables written to an execution (external worker results, handler output).
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// The five physically separate job collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobQueue {
    Timer,
    Executable,
    Suspended,
    DeadLetter,
    ExternalWorker,
}

impl JobQueue {
    pub const ALL: [JobQueue; 5] = [
        JobQueue::Timer,
        JobQueue::Executable,
        JobQueue::Suspended,
        JobQueue::DeadLetter,
        JobQueue::ExternalWorker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobQueue::Timer => "timer",
            JobQueue::Executable => "executable",
            JobQueue::Suspended => "suspended",
            JobQueue::DeadLetter => "dead_letter",
            JobQueue::ExternalWorker => "external_worker",
        }
    }
}

impl fmt::Display for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobQueue {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobQueue::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| JobError::validation(format!("unknown job queue: {s}")))
    }
}

/// What kind of work the job represents. Independent of the queue it sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Timer,
    AsyncContinuation,
    Message,
    ExternalWorker,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Timer => "timer",
            JobType::AsyncContinuation => "async_continuation",
            JobType::Message => "message",
            JobType::ExternalWorker => "external_worker",
        }
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timer" => Ok(JobType::Timer),
            "async_continuation" => Ok(JobType::AsyncContinuation),
            "message" => Ok(JobType::Message),
            "external_worker" => Ok(JobType::ExternalWorker),
            other => Err(JobError::validation(format!("unknown job type: {other}"))),
        }
    }
}

/// Where a job resumes when it is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Correlation {
    /// Bound to an execution of a process instance.
    Process {
        process_instance_id: ProcessInstanceId,
        execution_id: ExecutionId,
    },
    /// Bound to a non-process scope (case, sub-scope of another engine).
    Scope { scope_id: String, scope_type: String },
    /// Not bound to anything (housekeeping jobs).
    Unbound,
}

impl Correlation {
    pub fn process(process_instance_id: ProcessInstanceId, execution_id: ExecutionId) -> Self {
        Correlation::Process {
            process_instance_id,
            execution_id,
        }
    }

    pub fn process_instance_id(&self) -> Option<ProcessInstanceId> {
        match self {
            Correlation::Process {
                process_instance_id,
                ..
            } => Some(*process_instance_id),
            _ => None,
        }
    }

    pub fn execution_id(&self) -> Option<ExecutionId> {
        match self {
            Correlation::Process { execution_id, .. } => Some(*execution_id),
            _ => None,
        }
    }
}

/// The record shape shared by every queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Optimistic-locking counter; bumped by every committed update.
    pub revision: u64,
    pub correlation: Correlation,
    pub job_type: JobType,
    pub handler_type: String,
    /// Opaque handler input. External-worker jobs carry their topic here until
    /// resolved; a BPMN error completion overwrites it with `error:<code>`.
    pub handler_configuration: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub retries: u32,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub exclusive: bool,
    /// Failed-job retry cycle declared by the scheduling activity.
    pub retry_time_cycle: Option<String>,
    pub exception_message: Option<String>,
    pub exception_stacktrace: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn process_instance_id(&self) -> Option<ProcessInstanceId> {
        self.correlation.process_instance_id()
    }

    /// Due date null or not after `now`.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    /// Held by a lease that has not yet expired.
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration_time.is_some_and(|until| until > now)
    }

    /// Lease absent or expired. Expired leases are not cleared; the next
    /// acquirer simply overwrites them.
    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_expiration_time.is_none_or(|until| until <= now)
    }

    pub fn is_locked_by(&self, owner: &str) -> bool {
        self.lock_owner.as_deref() == Some(owner)
    }

    pub fn lease(&mut self, owner: impl Into<String>, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.into());
        self.lock_expiration_time = Some(until);
    }

    pub fn clear_lease(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    /// Timer semantics for backoff and reactivation: scheduled with a due date
    /// and not a message delivery.
    pub fn is_timer_like(&self) -> bool {
        self.job_type == JobType::Timer
            || (self.due_date.is_some() && self.job_type != JobType::Message)
    }
}

/// A job in exactly one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "queue", content = "record", rename_all = "snake_case")]
pub enum Job {
    Timer(JobRecord),
    Executable(JobRecord),
    Suspended(JobRecord),
    DeadLetter(JobRecord),
    ExternalWorker(JobRecord),
}

impl Job {
    /// Wrap `record` as a member of `queue`.
    pub fn in_queue(queue: JobQueue, record: JobRecord) -> Self {
        match queue {
            JobQueue::Timer => Job::Timer(record),
            JobQueue::Executable => Job::Executable(record),
            JobQueue::Suspended => Job::Suspended(record),
            JobQueue::DeadLetter => Job::DeadLetter(record),
            JobQueue::ExternalWorker => Job::ExternalWorker(record),
        }
    }

    pub fn queue(&self) -> JobQueue {
        match self {
            Job::Timer(_) => JobQueue::Timer,
            Job::Executable(_) => JobQueue::Executable,
            Job::Suspended(_) => JobQueue::Suspended,
            Job::DeadLetter(_) => JobQueue::DeadLetter,
            Job::ExternalWorker(_) => JobQueue::ExternalWorker,
        }
    }

    pub fn record(&self) -> &JobRecord {
        match self {
            Job::Timer(r)
            | Job::Executable(r)
            | Job::Suspended(r)
            | Job::DeadLetter(r)
            | Job::ExternalWorker(r) => r,
        }
    }

    pub fn record_mut(&mut self) -> &mut JobRecord {
        match self {
            Job::Timer(r)
            | Job::Executable(r)
            | Job::Suspended(r)
            | Job::DeadLetter(r)
            | Job::ExternalWorker(r) => r,
        }
    }

    pub fn into_record(self) -> JobRecord {
        match self {
            Job::Timer(r)
            | Job::Executable(r)
            | Job::Suspended(r)
            | Job::DeadLetter(r)
            | Job::ExternalWorker(r) => r,
        }
    }

    pub fn id(&self) -> JobId {
        self.record().id
    }
}

/// Owner of the instance-level exclusivity lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstanceRecord {
    pub id: ProcessInstanceId,
    pub revision: u64,
    pub lock_owner: Option<String>,
    /// Lock expiry; an expired lock may be taken over.
    pub lock_time: Option<DateTime<Utc>>,
    pub locking_job: Option<JobId>,
    pub tenant_id: Option<TenantId>,
}

impl ProcessInstanceRecord {
    pub fn new(id: ProcessInstanceId) -> Self {
        Self {
            id,
            revision: 0,
            lock_owner: None,
            lock_time: None,
            locking_job: None,
            tenant_id: None,
        }
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_time.is_some_and(|until| until > now)
    }

    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_time = None;
        self.locking_job = None;
    }
}

/// Jobs leased by one acquisition pass. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquiredJobBatch {
    pub jobs: Vec<JobRecord>,
}

impl AcquiredJobBatch {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|j| j.id).collect()
    }
}

impl IntoIterator for AcquiredJobBatch {
    type Item = JobRecord;
    type IntoIter = std::vec::IntoIter<JobRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.jobs.into_iter()
    }
}

/// Per-queue job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub timer: usize,
    pub executable: usize,
    pub suspended: usize,
    pub dead_letter: usize,
    pub external_worker: usize,
}

impl JobStats {
    pub fn count(&self, queue: JobQueue) -> usize {
        match queue {
            JobQueue::Timer => self.timer,
            JobQueue::Executable => self.executable,
            JobQueue::Suspended => self.suspended,
            JobQueue::DeadLetter => self.dead_letter,
            JobQueue::ExternalWorker => self.external_worker,
        }
    }

    pub(crate) fn increment(&mut self, queue: JobQueue) {
        match queue {
            JobQueue::Timer => self.timer += 1,
            JobQueue::Executable => self.executable += 1,
            JobQueue::Suspended => self.suspended += 1,
            JobQueue::DeadLetter => self.dead_letter += 1,
            JobQueue::ExternalWorker => self.external_worker += 1,
        }
    }

    pub fn total(&self) -> usize {
        JobQueue::ALL.into_iter().map(|q| self.count(q)).sum()
    }
}

/// Description of a job to schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    job_type: JobType,
    handler_type: String,
    handler_configuration: Option<String>,
    correlation: Correlation,
    due_date: Option<DateTime<Utc>>,
    retries: Option<u32>,
    exclusive: bool,
    retry_time_cycle: Option<String>,
    tenant_id: Option<TenantId>,
}

impl NewJob {
    fn of(job_type: JobType, handler_type: impl Into<String>) -> Self {
        Self {
            job_type,
            handler_type: handler_type.into(),
            handler_configuration: None,
            correlation: Correlation::Unbound,
            due_date: None,
            retries: None,
            exclusive: false,
            retry_time_cycle: None,
            tenant_id: None,
        }
    }

    /// Timer firing at `due_date`; lands in the Timer queue.
    pub fn timer(handler_type: impl Into<String>, due_date: DateTime<Utc>) -> Self {
        let mut job = Self::of(JobType::Timer, handler_type);
        job.due_date = Some(due_date);
        job
    }

    /// Async continuation; lands in the Executable queue, exclusive by default.
    pub fn async_continuation(handler_type: impl Into<String>) -> Self {
        let mut job = Self::of(JobType::AsyncContinuation, handler_type);
        job.exclusive = true;
        job
    }

    /// Message delivery; lands in the Executable queue.
    pub fn message(handler_type: impl Into<String>) -> Self {
        Self::of(JobType::Message, handler_type)
    }

    /// Work for a remote worker subscribed to `topic`.
    pub fn external_worker(topic: impl Into<String>) -> Self {
        let mut job = Self::of(JobType::ExternalWorker, crate::jobs::EXTERNAL_WORKER_HANDLER);
        job.handler_configuration = Some(topic.into());
        job
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.handler_configuration = Some(configuration.into());
        self
    }

    pub fn for_execution(
        mut self,
        process_instance_id: ProcessInstanceId,
        execution_id: ExecutionId,
    ) -> Self {
        self.correlation = Correlation::process(process_instance_id, execution_id);
        self
    }

    pub fn for_scope(mut self, scope_id: impl Into<String>, scope_type: impl Into<String>) -> Self {
        self.correlation = Correlation::Scope {
            scope_id: scope_id.into(),
            scope_type: scope_type.into(),
        };
        self
    }

    pub fn due_at(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_retry_time_cycle(mut self, cycle: impl Into<String>) -> Self {
        self.retry_time_cycle = Some(cycle.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant_id
    }

    /// The queue a freshly scheduled job of this shape starts in.
    pub fn target_queue(&self) -> JobQueue {
        match self.job_type {
            JobType::Timer => JobQueue::Timer,
            JobType::ExternalWorker => JobQueue::ExternalWorker,
            JobType::AsyncContinuation | JobType::Message => JobQueue::Executable,
        }
    }

    /// Validate and materialize into a job in its starting queue.
    pub fn into_job(self, now: DateTime<Utc>, default_retries: u32) -> JobResult<Job> {
        if self.handler_type.trim().is_empty() {
            return Err(JobError::validation("handler type must not be empty"));
        }
        if self.retries == Some(0) {
            return Err(JobError::validation("retries must be positive"));
        }
        if self.job_type == JobType::ExternalWorker
            && self
                .handler_configuration
                .as_deref()
                .is_none_or(|topic| topic.trim().is_empty())
        {
            return Err(JobError::validation("external worker jobs need a topic"));
        }
        if self.job_type == JobType::ExternalWorker
            && !matches!(self.correlation, Correlation::Process { .. })
        {
            return Err(JobError::validation(
                "external worker jobs must be correlated to a process instance",
            ));
        }

        let queue = self.target_queue();
        let record = JobRecord {
            id: JobId::new(),
            revision: 0,
            correlation: self.correlation,
            job_type: self.job_type,
            handler_type: self.handler_type,
            handler_configuration: self.handler_configuration,
            due_date: self.due_date,
            retries: self.retries.unwrap_or(default_retries),
            lock_owner: None,
            lock_expiration_time: None,
            exclusive: self.exclusive,
            retry_time_cycle: self.retry_time_cycle,
            exception_message: None,
            exception_stacktrace: None,
            tenant_id: self.tenant_id,
            created_at: now,
        };
        Ok(Job::in_queue(queue, record))
    }
}
