//! External worker protocol.
//!
//! Remote workers claim ExternalWorker jobs by topic and resolve them by job id.
//! Every resolving call must come from the worker holding the claim. A resolved
//! job re-enters the Executable queue and is dispatched through the normal path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobforge_core::{JobError, JobId, JobResult};
use jobforge_events::JobEventKind;

use crate::config::add_duration;

use super::context::EngineContext;
use super::exclusive::{LockOutcome, lock_in, release_in};
use super::handler::ERROR_CONFIGURATION_PREFIX;
use super::store::{JobStore, JobTransaction};
use super::types::{Correlation, Job, JobQueue, JobRecord, Variables};

/// A worker's report that it could not process a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureReport {
    /// Retries left; defaults to the current count minus one.
    pub retries: Option<u32>,
    /// How long the job stays hidden before it can be claimed again.
    pub retry_timeout: Option<Duration>,
    pub message: Option<String>,
    pub details: Option<String>,
}

impl FailureReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = Some(timeout);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug)]
pub struct ExternalWorkerProtocol<S> {
    ctx: Arc<EngineContext<S>>,
}

impl<S> Clone for ExternalWorkerProtocol<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<S: JobStore> ExternalWorkerProtocol<S> {
    pub fn new(ctx: Arc<EngineContext<S>>) -> Self {
        Self { ctx }
    }

    /// Claim up to `max_jobs` jobs of `topic` for `worker_id` for `lock_duration`.
    ///
    /// Jobs raced away by another worker, and exclusive jobs whose process
    /// instance is locked, are skipped.
    pub fn acquire(
        &self,
        topic: &str,
        worker_id: &str,
        lock_duration: Duration,
        max_jobs: usize,
    ) -> JobResult<Vec<JobRecord>> {
        if topic.trim().is_empty() {
            return Err(JobError::validation("topic must not be empty"));
        }
        require_worker(worker_id)?;
        if lock_duration.is_zero() {
            return Err(JobError::validation("lock duration must be positive"));
        }
        if max_jobs == 0 {
            return Ok(Vec::new());
        }

        let now = self.ctx.now();
        let until = add_duration(now, lock_duration)
            .ok_or_else(|| JobError::validation("lock duration is out of range"))?;
        let candidates = self.ctx.store.find_claimable_external(topic, now, max_jobs)?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.claim_one(&candidate, worker_id, now, until) {
                Ok(Some(record)) => claimed.push(record),
                Ok(None) => {}
                Err(err) if err.is_conflict() => {
                    debug!(job_id = %candidate.id, worker_id, "external job claimed concurrently, skipping");
                }
                Err(err) if claimed.is_empty() => return Err(err),
                Err(err) => {
                    warn!(error = %err, claimed = claimed.len(), "external claim stopped early");
                    break;
                }
            }
        }

        for record in &claimed {
            self.ctx.emit(
                record,
                JobEventKind::Acquired {
                    lock_owner: worker_id.to_string(),
                },
            );
        }
        if !claimed.is_empty() {
            info!(topic, worker_id, count = claimed.len(), "external worker jobs claimed");
        }
        Ok(claimed)
    }

    fn claim_one(
        &self,
        candidate: &JobRecord,
        worker_id: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> JobResult<Option<JobRecord>> {
        let mut tx = self.ctx.store.begin()?;
        let Some(mut job) = tx.find_job(candidate.id)? else {
            return Ok(None);
        };
        if job.queue() != JobQueue::ExternalWorker
            || job.record().revision != candidate.revision
            || !job.record().is_available_at(now)
        {
            return Ok(None);
        }

        if lock_in(&mut tx, job.record(), worker_id, now, until)? == LockOutcome::Busy {
            return Ok(None);
        }
        job.record_mut().lease(worker_id, until);
        tx.update_job(&mut job)?;
        tx.commit()?;
        Ok(Some(job.into_record()))
    }

    /// The worker finished the job: write `variables` and hand the job back to
    /// the engine to continue the process.
    pub fn complete(&self, job_id: JobId, worker_id: &str, variables: Variables) -> JobResult<()> {
        let record = self.resolve(job_id, worker_id, None, &variables)?;
        info!(job_id = %job_id, worker_id, "external worker job completed");
        self.ctx.emit(
            &record,
            JobEventKind::ExternalWorkerCompleted {
                worker_id: worker_id.to_string(),
            },
        );
        Ok(())
    }

    /// The worker hit a modeled business error; the process raises `error_code`
    /// once the job is dispatched.
    pub fn report_error(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_code: Option<&str>,
        variables: Variables,
    ) -> JobResult<()> {
        let configuration = format!("{ERROR_CONFIGURATION_PREFIX}{}", error_code.unwrap_or_default());
        let record = self.resolve(job_id, worker_id, Some(configuration), &variables)?;
        info!(job_id = %job_id, worker_id, error_code, "external worker reported a business error");
        self.ctx.emit(
            &record,
            JobEventKind::ExternalWorkerErrorReported {
                worker_id: worker_id.to_string(),
                error_code: error_code.map(str::to_string),
            },
        );
        Ok(())
    }

    fn resolve(
        &self,
        job_id: JobId,
        worker_id: &str,
        configuration: Option<String>,
        variables: &Variables,
    ) -> JobResult<JobRecord> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let (job, execution) = claimed_by(&mut tx, job_id, worker_id)?;
        let record = job.record();

        if !variables.is_empty() {
            tx.set_variables(execution, variables)?;
        }

        let mut next = record.clone();
        next.handler_configuration = configuration;
        next.clear_lease();
        next.due_date = Some(now);

        tx.delete_job(&job)?;
        let mut moved = Job::Executable(next);
        tx.insert_job(&mut moved)?;
        release_in(&mut tx, record)?;
        tx.commit()?;
        Ok(moved.into_record())
    }

    /// The worker gave up on the job. With retries left the job becomes
    /// claimable again after `retry_timeout`; otherwise it is dead-lettered.
    pub fn fail(&self, job_id: JobId, worker_id: &str, report: FailureReport) -> JobResult<()> {
        let now = self.ctx.now();
        let retry_after = report
            .retry_timeout
            .map(|timeout| {
                add_duration(now, timeout)
                    .ok_or_else(|| JobError::validation("retry timeout is out of range"))
            })
            .transpose()?;
        let mut tx = self.ctx.store.begin()?;
        let (job, _) = claimed_by(&mut tx, job_id, worker_id)?;
        let record = job.record();

        let retries = report
            .retries
            .unwrap_or_else(|| record.retries.saturating_sub(1));

        let mut next = record.clone();
        next.retries = retries;
        next.exception_message = report.message.clone();
        next.exception_stacktrace = report.details.clone();
        next.lock_owner = None;

        let updated = if retries > 0 {
            next.lock_expiration_time = retry_after;
            let mut updated = Job::ExternalWorker(next);
            tx.update_job(&mut updated)?;
            updated
        } else {
            next.lock_expiration_time = None;
            tx.delete_job(&job)?;
            let mut moved = Job::DeadLetter(next);
            tx.insert_job(&mut moved)?;
            moved
        };
        release_in(&mut tx, record)?;
        tx.commit()?;

        let dead_lettered = updated.queue() == JobQueue::DeadLetter;
        let record = updated.into_record();
        self.ctx.emit(
            &record,
            JobEventKind::ExternalWorkerFailed {
                worker_id: worker_id.to_string(),
                retries,
            },
        );
        if dead_lettered {
            warn!(job_id = %job_id, worker_id, "external worker job failed; dead-lettered");
            self.ctx.emit(&record, JobEventKind::DeadLettered);
        } else {
            info!(
                job_id = %job_id,
                worker_id,
                retries,
                until = ?record.lock_expiration_time,
                "external worker job failed; released for retry"
            );
        }
        Ok(())
    }
}

fn require_worker(worker_id: &str) -> JobResult<()> {
    if worker_id.trim().is_empty() {
        return Err(JobError::validation("worker id must not be empty"));
    }
    Ok(())
}

/// Load an ExternalWorker job and check `worker_id` holds its claim.
fn claimed_by<T>(
    tx: &mut T,
    job_id: JobId,
    worker_id: &str,
) -> JobResult<(Job, jobforge_core::ExecutionId)>
where
    T: JobTransaction + ?Sized,
{
    require_worker(worker_id)?;
    let job = match tx.find_job(job_id)? {
        Some(job @ Job::ExternalWorker(_)) => job,
        _ => return Err(JobError::not_found("external worker job", job_id)),
    };
    let record = job.record();
    if !record.is_locked_by(worker_id) {
        return Err(JobError::unauthorized(format!(
            "job {job_id} is not claimed by worker {worker_id}"
        )));
    }
    let Correlation::Process { execution_id, .. } = record.correlation else {
        return Err(JobError::validation(format!(
            "external worker job {job_id} is not correlated to a process execution"
        )));
    };
    Ok((job, execution_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::NewJob;
    use jobforge_core::{Clock, ExecutionId, ManualClock, ProcessInstanceId};
    use serde_json::json;

    struct Fixture {
        protocol: ExternalWorkerProtocol<Arc<InMemoryJobStore>>,
        store: Arc<InMemoryJobStore>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        let ctx = EngineContext::new(store.clone(), EngineConfig::default())
            .with_clock(Arc::new(clock.clone()));
        Fixture {
            protocol: ExternalWorkerProtocol::new(Arc::new(ctx)),
            store,
            clock,
        }
    }

    fn insert(store: &InMemoryJobStore, new_job: NewJob) -> JobId {
        let mut job = new_job.into_job(Utc::now(), 3).unwrap();
        let mut tx = store.begin().unwrap();
        tx.insert_job(&mut job).unwrap();
        tx.commit().unwrap();
        job.id()
    }

    fn external(topic: &str) -> NewJob {
        NewJob::external_worker(topic).for_execution(ProcessInstanceId::new(), ExecutionId::new())
    }

    #[test]
    fn claims_only_matching_topics_once() {
        let f = fixture();
        let billing = insert(&f.store, external("billing"));
        insert(&f.store, external("shipping"));

        let claimed = f
            .protocol
            .acquire("billing", "w1", Duration::from_secs(60), 10)
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, billing);
        assert!(claimed[0].is_locked_by("w1"));

        let again = f
            .protocol
            .acquire("billing", "w2", Duration::from_secs(60), 10)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn expired_claims_can_be_taken_over() {
        let f = fixture();
        insert(&f.store, external("billing"));

        f.protocol.acquire("billing", "w1", Duration::from_secs(60), 1).unwrap();
        f.clock.advance(chrono::Duration::seconds(61));
        let claimed = f
            .protocol
            .acquire("billing", "w2", Duration::from_secs(60), 1)
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(claimed[0].is_locked_by("w2"));
    }

    #[test]
    fn report_error_encodes_the_code() {
        let f = fixture();
        let id = insert(&f.store, external("billing"));
        f.protocol.acquire("billing", "w1", Duration::from_secs(60), 1).unwrap();

        f.protocol
            .report_error(id, "w1", Some("card-declined"), Variables::new())
            .unwrap();
        let job = f.store.find_job(id).unwrap().unwrap();
        assert_eq!(job.queue(), JobQueue::Executable);
        assert_eq!(job.record().handler_configuration.as_deref(), Some("error:card-declined"));
    }

    #[test]
    fn complete_writes_variables_to_the_execution() {
        let f = fixture();
        let execution = ExecutionId::new();
        let id = insert(
            &f.store,
            NewJob::external_worker("billing").for_execution(ProcessInstanceId::new(), execution),
        );
        f.protocol.acquire("billing", "w1", Duration::from_secs(60), 1).unwrap();

        let mut variables = Variables::new();
        variables.insert("invoice".into(), json!("INV-7"));
        f.protocol.complete(id, "w1", variables).unwrap();

        assert_eq!(f.store.variables(execution).unwrap()["invoice"], json!("INV-7"));
        let job = f.store.find_job(id).unwrap().unwrap();
        assert!(job.record().lock_owner.is_none());
        assert_eq!(job.record().due_date, Some(f.clock.now()));
    }

    #[test]
    fn guards() {
        let f = fixture();
        let id = insert(&f.store, external("billing"));

        let err = f.protocol.complete(id, "", Variables::new()).unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));

        let err = f.protocol.complete(JobId::new(), "w1", Variables::new()).unwrap_err();
        assert!(err.is_not_found());

        // Not claimed yet.
        let err = f.protocol.complete(id, "w1", Variables::new()).unwrap_err();
        assert!(matches!(err, JobError::Unauthorized(_)));
    }

    #[test]
    fn fail_without_retries_uses_the_current_count() {
        let f = fixture();
        let id = insert(&f.store, external("billing").with_retries(2));

        f.protocol.acquire("billing", "w1", Duration::from_secs(60), 1).unwrap();
        f.protocol.fail(id, "w1", FailureReport::new("timeout")).unwrap();
        let job = f.store.find_job(id).unwrap().unwrap();
        assert_eq!(job.queue(), JobQueue::ExternalWorker);
        assert_eq!(job.record().retries, 1);
        // No timeout: claimable right away.
        assert!(job.record().lock_expiration_time.is_none());

        f.protocol.acquire("billing", "w1", Duration::from_secs(60), 1).unwrap();
        f.protocol.fail(id, "w1", FailureReport::new("timeout")).unwrap();
        let job = f.store.find_job(id).unwrap().unwrap();
        assert_eq!(job.queue(), JobQueue::DeadLetter);
        assert_eq!(job.record().retries, 0);
    }

    #[test]
    fn unrepresentable_lock_durations_are_rejected() {
        let f = fixture();
        let id = insert(&f.store, external("billing"));

        let err = f
            .protocol
            .acquire("billing", "w1", Duration::from_secs(u64::MAX), 1)
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert!(f.store.find_job(id).unwrap().unwrap().record().lock_owner.is_none());
    }

    #[test]
    fn unrepresentable_retry_timeouts_are_rejected() {
        let f = fixture();
        let id = insert(&f.store, external("billing").with_retries(3));
        f.protocol.acquire("billing", "w1", Duration::from_secs(60), 1).unwrap();

        let err = f
            .protocol
            .fail(
                id,
                "w1",
                FailureReport::new("timeout").with_retry_timeout(Duration::from_secs(u64::MAX)),
            )
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));

        let job = f.store.find_job(id).unwrap().unwrap();
        assert_eq!(job.queue(), JobQueue::ExternalWorker);
        assert_eq!(job.record().retries, 3);
        assert!(job.record().is_locked_by("w1"));

        f.protocol
            .fail(
                id,
                "w1",
                FailureReport::new("timeout").with_retry_timeout(Duration::from_secs(30)),
            )
            .unwrap();
        let job = f.store.find_job(id).unwrap().unwrap();
        assert_eq!(
            job.record().lock_expiration_time,
            Some(f.clock.now() + chrono::Duration::seconds(30))
        );
    }

    #[test]
    fn exclusive_claims_hold_the_instance_lock_until_resolved() {
        let f = fixture();
        let instance = ProcessInstanceId::new();
        for _ in 0..2 {
            insert(
                &f.store,
                NewJob::external_worker("billing")
                    .for_execution(instance, ExecutionId::new())
                    .exclusive(true),
            );
        }

        let claimed = f
            .protocol
            .acquire("billing", "w1", Duration::from_secs(60), 10)
            .unwrap();
        assert_eq!(claimed.len(), 1);
        let locked = f.store.find_process_instance(instance).unwrap().unwrap();
        assert_eq!(locked.locking_job, Some(claimed[0].id));

        f.protocol.complete(claimed[0].id, "w1", Variables::new()).unwrap();
        let unlocked = f.store.find_process_instance(instance).unwrap().unwrap();
        assert!(unlocked.locking_job.is_none());
    }
}
