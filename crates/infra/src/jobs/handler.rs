//! Handler registry and the process-runtime seam.
//!
//! Handlers are resolved by `handler_type` through a [`HandlerRegistry`] built at
//! startup. Resolution order: exact match, category match (`"timer.*"` matches
//! `"timer.escalation"`), the `"*"` wildcard, then the [`ProcessRuntime`] if one
//! is installed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use jobforge_core::{HandlerError, JobError, JobId, JobResult};

use super::store::JobTransaction;
use super::types::{Correlation, Job, JobRecord, NewJob, Variables};

/// Handler type of external-worker jobs. They are dispatched under it once a
/// worker has completed them or reported a business error.
pub const EXTERNAL_WORKER_HANDLER: &str = "external-worker-complete";

/// Prefix marking a BPMN error completion in `handler_configuration`.
pub const ERROR_CONFIGURATION_PREFIX: &str = "error:";

/// Transactional view a handler runs against.
///
/// Everything done through the context (scheduled jobs, variables) commits
/// together with the job's deletion, or not at all.
pub struct JobContext<'t> {
    tx: &'t mut dyn JobTransaction,
    now: DateTime<Utc>,
    default_retries: u32,
    job: &'t JobRecord,
    scheduled: Vec<Job>,
}

impl<'t> JobContext<'t> {
    pub fn new(
        tx: &'t mut dyn JobTransaction,
        job: &'t JobRecord,
        now: DateTime<Utc>,
        default_retries: u32,
    ) -> Self {
        Self {
            tx,
            now,
            default_retries,
            job,
            scheduled: Vec::new(),
        }
    }

    /// The job being executed.
    pub fn job(&self) -> &JobRecord {
        self.job
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Schedule a follow-up job. Inherits the executing job's tenant.
    pub fn schedule(&mut self, new_job: NewJob) -> JobResult<JobId> {
        let new_job = match self.job.tenant_id {
            Some(tenant) if new_job.tenant().is_none() => new_job.with_tenant(tenant),
            _ => new_job,
        };
        let mut job = new_job.into_job(self.now, self.default_retries)?;
        self.tx.insert_job(&mut job)?;
        let id = job.id();
        self.scheduled.push(job);
        Ok(id)
    }

    /// Variables of the executing job's execution.
    pub fn variables(&mut self) -> JobResult<Variables> {
        let execution = self.execution()?;
        self.tx.variables(execution)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: serde_json::Value) -> JobResult<()> {
        let mut variables = Variables::new();
        variables.insert(name.into(), value);
        self.set_variables(&variables)
    }

    pub fn set_variables(&mut self, variables: &Variables) -> JobResult<()> {
        let execution = self.execution()?;
        self.tx.set_variables(execution, variables)
    }

    /// Jobs scheduled through this context so far.
    pub fn scheduled(&self) -> &[Job] {
        &self.scheduled
    }

    pub(crate) fn into_scheduled(self) -> Vec<Job> {
        self.scheduled
    }

    fn execution(&self) -> JobResult<jobforge_core::ExecutionId> {
        self.job.correlation.execution_id().ok_or_else(|| {
            JobError::validation(format!(
                "job {} is not correlated to a process execution",
                self.job.id
            ))
        })
    }
}

impl fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("now", &self.now)
            .field("scheduled", &self.scheduled.len())
            .finish()
    }
}

/// Business logic for one handler type.
pub trait JobHandler: Send + Sync {
    fn execute(&self, job: &JobRecord, ctx: &mut JobContext<'_>) -> Result<(), HandlerError>;
}

impl<F> JobHandler for F
where
    F: Fn(&JobRecord, &mut JobContext<'_>) -> Result<(), HandlerError> + Send + Sync,
{
    fn execute(&self, job: &JobRecord, ctx: &mut JobContext<'_>) -> Result<(), HandlerError> {
        self(job, ctx)
    }
}

/// The process interpreter that owns what a job actually does.
pub trait ProcessRuntime: Send + Sync {
    /// Run the handler identified by `handler_type`/`configuration` against
    /// the correlated execution.
    fn execute(
        &self,
        handler_type: &str,
        configuration: Option<&str>,
        correlation: &Correlation,
        ctx: &mut JobContext<'_>,
    ) -> Result<(), HandlerError>;

    /// Resume the process at the correlated execution (external worker completion).
    fn continue_process_at(
        &self,
        correlation: &Correlation,
        ctx: &mut JobContext<'_>,
    ) -> Result<(), HandlerError>;

    /// Raise a modeled business error at the correlated execution.
    fn raise_business_error(
        &self,
        correlation: &Correlation,
        error_code: Option<&str>,
        ctx: &mut JobContext<'_>,
    ) -> Result<(), HandlerError>;

    /// Failed-job retry cycle declared by the job's activity, if any.
    fn failed_job_retry_time_cycle(&self, _job: &JobRecord) -> Option<String> {
        None
    }
}

/// Delegates any handler type to the process runtime.
struct RuntimeHandler {
    runtime: Arc<dyn ProcessRuntime>,
}

impl JobHandler for RuntimeHandler {
    fn execute(&self, job: &JobRecord, ctx: &mut JobContext<'_>) -> Result<(), HandlerError> {
        self.runtime.execute(
            &job.handler_type,
            job.handler_configuration.as_deref(),
            &job.correlation,
            ctx,
        )
    }
}

/// Resumes the process after an external worker resolved a job.
struct ExternalWorkerCompletionHandler {
    runtime: Arc<dyn ProcessRuntime>,
}

impl JobHandler for ExternalWorkerCompletionHandler {
    fn execute(&self, job: &JobRecord, ctx: &mut JobContext<'_>) -> Result<(), HandlerError> {
        match job
            .handler_configuration
            .as_deref()
            .and_then(|c| c.strip_prefix(ERROR_CONFIGURATION_PREFIX))
        {
            Some(code) => {
                let code = (!code.is_empty()).then_some(code);
                self.runtime.raise_business_error(&job.correlation, code, ctx)
            }
            None => self.runtime.continue_process_at(&job.correlation, ctx),
        }
    }
}

/// Handlers keyed by handler type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    runtime: Option<Arc<dyn ProcessRuntime>>,
    fallback: Option<Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the process runtime: it handles every type without an explicit
    /// handler, and external-worker completions.
    pub fn with_runtime(mut self, runtime: Arc<dyn ProcessRuntime>) -> Self {
        self.handlers.insert(
            EXTERNAL_WORKER_HANDLER.to_string(),
            Arc::new(ExternalWorkerCompletionHandler {
                runtime: runtime.clone(),
            }),
        );
        self.fallback = Some(Arc::new(RuntimeHandler {
            runtime: runtime.clone(),
        }));
        self.runtime = Some(runtime);
        self
    }

    /// Register a handler for a handler type, a `"category.*"` pattern, or `"*"`.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn with_handler<H>(mut self, pattern: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(pattern, handler);
        self
    }

    pub fn runtime(&self) -> Option<&Arc<dyn ProcessRuntime>> {
        self.runtime.as_ref()
    }

    /// Resolve the handler for `handler_type`.
    pub fn resolve(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(handler_type) {
            return Some(h.clone());
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                handler_type
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), handler))
            })
            // Longest matching prefix wins.
            .max_by_key(|(len, _)| *len);
        if let Some((_, handler)) = category {
            return Some(handler.clone());
        }

        self.handlers
            .get("*")
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    /// Retry cycle the runtime declares for `job`.
    pub(crate) fn retry_time_cycle_for(&self, job: &JobRecord) -> Option<String> {
        self.runtime
            .as_ref()
            .and_then(|runtime| runtime.failed_job_retry_time_cycle(job))
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &types)
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}
