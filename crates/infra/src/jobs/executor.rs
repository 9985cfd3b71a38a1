//! Execution dispatcher.
//!
//! Runs one acquired job: resolves its handler, invokes it inside a transaction
//! that also deletes the job on success, and hands failures to the
//! [`RetryEngine`] in a fresh transaction.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use jobforge_core::{HandlerError, JobError, JobId, JobResult};
use jobforge_events::JobEventKind;

use super::context::EngineContext;
use super::exclusive::{ExclusiveLocks, LockOutcome, release_in};
use super::handler::{HandlerRegistry, JobContext};
use super::retry::{FailedJobCommand, RetryEngine, RetryOutcome};
use super::store::{JobStore, JobTransaction};
use super::types::{Job, JobQueue, JobRecord};

/// How a dispatch ended when the job did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler succeeded; the job is gone.
    Succeeded,
    /// The job was no longer executable; nothing ran.
    Moot,
    /// Another job holds the process-instance lock; the job was un-acquired.
    Deferred,
}

/// Dispatches executable jobs to their handlers.
pub struct JobExecutor<S> {
    ctx: Arc<EngineContext<S>>,
    registry: Arc<HandlerRegistry>,
    retry: RetryEngine<S>,
    locks: ExclusiveLocks<S>,
}

impl<S> Clone for JobExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            registry: self.registry.clone(),
            retry: self.retry.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<S: JobStore> JobExecutor<S> {
    pub fn new(ctx: Arc<EngineContext<S>>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            retry: RetryEngine::new(ctx.clone()),
            locks: ExclusiveLocks::new(ctx.clone()),
            ctx,
            registry,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute the job `job_id`.
    ///
    /// A failing handler yields `Err(HandlerFailure)` once the job has been
    /// rescheduled, or `Err(Exhausted)` once it has been dead-lettered. An
    /// unusable retry cycle also dead-letters the job and yields
    /// `Err(Configuration)`.
    pub fn execute(&self, job_id: JobId) -> JobResult<ExecutionOutcome> {
        let record = match self.ctx.store.find_job(job_id)? {
            Some(Job::Executable(record)) => record,
            _ => {
                debug!(job_id = %job_id, "job is no longer executable, skipping");
                return Ok(ExecutionOutcome::Moot);
            }
        };

        if self.locks.lock_for(&record)? == LockOutcome::Busy {
            if let Err(err) = self.unacquire(&record) {
                warn!(job_id = %job_id, error = %err, "failed to un-acquire deferred job");
            }
            debug!(job_id = %job_id, "process instance busy, job deferred");
            return Ok(ExecutionOutcome::Deferred);
        }

        let cycle = record
            .retry_time_cycle
            .clone()
            .or_else(|| self.registry.retry_time_cycle_for(&record));
        let command = FailedJobCommand::new(job_id).with_retry_time_cycle(cycle);

        let mut tx = self.ctx.store.begin()?;
        let job = match tx.find_job(job_id)? {
            Some(job @ Job::Executable(_)) => job,
            _ => {
                drop(tx);
                self.release_quietly(&record);
                debug!(job_id = %job_id, "job resolved before dispatch, skipping");
                return Ok(ExecutionOutcome::Moot);
            }
        };

        let now = self.ctx.now();
        let result = {
            let current = job.record();
            let mut job_ctx =
                JobContext::new(&mut tx, current, now, self.ctx.config.default_job_retries);
            let result = match self.registry.resolve(&current.handler_type) {
                Some(handler) => handler.execute(current, &mut job_ctx),
                None => Err(HandlerError::new(format!(
                    "no handler for job type {}",
                    current.handler_type
                ))),
            };
            result.map(|()| job_ctx.into_scheduled())
        };

        match result {
            Ok(scheduled) => {
                if let Err(err) = complete(tx, &job) {
                    if err.is_conflict() {
                        warn!(job_id = %job_id, "job resolved concurrently, execution discarded");
                        self.release_quietly(&record);
                    }
                    return Err(err);
                }

                for job in &scheduled {
                    self.ctx.emit(
                        job.record(),
                        JobEventKind::Created {
                            queue: job.queue().to_string(),
                        },
                    );
                }
                self.ctx.emit(&record, JobEventKind::ExecutionSuccess);
                info!(
                    job_id = %job_id,
                    handler_type = %record.handler_type,
                    scheduled = scheduled.len(),
                    "job executed"
                );
                Ok(ExecutionOutcome::Succeeded)
            }
            Err(failure) => {
                drop(tx);
                self.fail(&record, &command, failure)
            }
        }
    }

    fn fail(
        &self,
        record: &JobRecord,
        command: &FailedJobCommand,
        failure: HandlerError,
    ) -> JobResult<ExecutionOutcome> {
        warn!(job_id = %record.id, handler_type = %record.handler_type, error = %failure, "job execution failed");
        self.ctx.emit(
            record,
            JobEventKind::ExecutionFailure {
                message: failure.message.clone(),
            },
        );

        match self.retry.apply(command, &failure) {
            Ok(RetryOutcome::DeadLettered { .. }) => Err(JobError::Exhausted(record.id.to_string())),
            Ok(RetryOutcome::Rescheduled { .. }) => Err(JobError::HandlerFailure(failure)),
            Err(JobError::Configuration(message)) => Err(JobError::Configuration(message)),
            Err(err) if err.is_not_found() => {
                debug!(job_id = %record.id, "job vanished before its failure was recorded");
                Err(JobError::HandlerFailure(failure))
            }
            Err(err) => {
                error!(job_id = %record.id, error = %err, "failed to record job failure");
                self.release_quietly(record);
                Err(JobError::HandlerFailure(failure))
            }
        }
    }

    /// Clear this executor's lease so the job can be acquired again.
    fn unacquire(&self, record: &JobRecord) -> JobResult<()> {
        match clear_lease(self.ctx.store.begin()?, record.id) {
            Err(err) if err.is_conflict() => Ok(()),
            other => other,
        }
    }

    fn release_quietly(&self, record: &JobRecord) {
        if let Err(err) = self.locks.release(record) {
            warn!(job_id = %record.id, error = %err, "failed to release process instance lock");
        }
    }
}

fn complete<T: JobTransaction>(mut tx: T, job: &Job) -> JobResult<()> {
    tx.delete_job(job)?;
    release_in(&mut tx, job.record())?;
    tx.commit()
}

fn clear_lease<T: JobTransaction>(mut tx: T, job_id: JobId) -> JobResult<()> {
    match tx.find_job(job_id)? {
        Some(mut job) if job.queue() == JobQueue::Executable => {
            job.record_mut().clear_lease();
            tx.update_job(&mut job)?;
            tx.commit()
        }
        _ => Ok(()),
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for JobExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("ctx", &self.ctx)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::config::EngineConfig;
    use crate::jobs::acquisition::JobAcquirer;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::NewJob;
    use chrono::Utc;
    use jobforge_core::{ExecutionId, ManualClock, ProcessInstanceId};

    struct Fixture {
        executor: JobExecutor<Arc<InMemoryJobStore>>,
        acquirer: JobAcquirer<Arc<InMemoryJobStore>>,
        store: Arc<InMemoryJobStore>,
        clock: ManualClock,
    }

    fn fixture(registry: HandlerRegistry) -> Fixture {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        let ctx = EngineContext::new(store.clone(), EngineConfig::default().with_lock_owner("exec-1"))
            .with_clock(Arc::new(clock.clone()));
        let ctx = Arc::new(ctx);
        Fixture {
            executor: JobExecutor::new(ctx.clone(), Arc::new(registry)),
            acquirer: JobAcquirer::new(ctx),
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

    fn ok(_: &JobRecord, _: &mut JobContext<'_>) -> Result<(), HandlerError> {
        Ok(())
    }

    fn boom(_: &JobRecord, _: &mut JobContext<'_>) -> Result<(), HandlerError> {
        Err(HandlerError::new("boom").with_details("at handler"))
    }

    struct CountedFailure(Arc<AtomicU32>);

    impl crate::jobs::handler::JobHandler for CountedFailure {
        fn execute(&self, _: &JobRecord, _: &mut JobContext<'_>) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::new("boom"))
        }
    }

    #[test]
    fn success_deletes_the_job() {
        let f = fixture(HandlerRegistry::new().with_handler("deliver", ok));
        let id = insert(&f.store, NewJob::message("deliver"));

        assert_eq!(f.executor.execute(id).unwrap(), ExecutionOutcome::Succeeded);
        assert!(f.store.find_job(id).unwrap().is_none());
    }

    #[test]
    fn missing_jobs_are_moot() {
        let f = fixture(HandlerRegistry::new());
        assert_eq!(f.executor.execute(JobId::new()).unwrap(), ExecutionOutcome::Moot);
        assert_eq!(f.store.stats().unwrap().total(), 0);
    }

    #[test]
    fn handler_side_effects_commit_with_success() {
        fn approve(_: &JobRecord, ctx: &mut JobContext<'_>) -> Result<(), HandlerError> {
            ctx.set_variable("approved", serde_json::json!(true))
                .map_err(|e| HandlerError::new(e.to_string()))?;
            ctx.schedule(NewJob::message("notify"))
                .map_err(|e| HandlerError::new(e.to_string()))?;
            Ok(())
        }

        let f = fixture(HandlerRegistry::new().with_handler("approve", approve));
        let execution = ExecutionId::new();
        let id = insert(
            &f.store,
            NewJob::message("approve").for_execution(ProcessInstanceId::new(), execution),
        );

        f.executor.execute(id).unwrap();
        assert_eq!(f.store.stats().unwrap().count(JobQueue::Executable), 1);
        assert_eq!(f.store.variables(execution).unwrap()["approved"], serde_json::json!(true));
    }

    #[test]
    fn handler_side_effects_roll_back_on_failure() {
        fn reject(_: &JobRecord, ctx: &mut JobContext<'_>) -> Result<(), HandlerError> {
            ctx.schedule(NewJob::message("notify"))
                .map_err(|e| HandlerError::new(e.to_string()))?;
            Err(HandlerError::new("rejected"))
        }

        let f = fixture(HandlerRegistry::new().with_handler("approve", reject));
        let id = insert(&f.store, NewJob::message("approve"));

        let err = f.executor.execute(id).unwrap_err();
        assert!(matches!(err, JobError::HandlerFailure(_)));

        let stats = f.store.stats().unwrap();
        assert_eq!(stats.count(JobQueue::Executable), 0);
        assert_eq!(stats.count(JobQueue::Timer), 1);
        let job = f.store.find_job(id).unwrap().unwrap();
        assert_eq!(job.record().retries, 2);
        assert_eq!(job.record().exception_message.as_deref(), Some("rejected"));
    }

    #[test]
    fn last_failure_reports_exhausted() {
        let f = fixture(HandlerRegistry::new().with_handler("deliver", boom));
        let id = insert(&f.store, NewJob::message("deliver").with_retries(1));

        let err = f.executor.execute(id).unwrap_err();
        assert!(matches!(err, JobError::Exhausted(ref job) if *job == id.to_string()));
        let job = f.store.find_job(id).unwrap().unwrap();
        assert_eq!(job.queue(), JobQueue::DeadLetter);
        assert_eq!(job.record().exception_stacktrace.as_deref(), Some("at handler"));
    }

    #[test]
    fn unknown_handler_types_fail_the_job() {
        let f = fixture(HandlerRegistry::new());
        let id = insert(&f.store, NewJob::message("nobody-handles-this"));

        assert!(matches!(f.executor.execute(id), Err(JobError::HandlerFailure(_))));
        assert_eq!(f.store.find_job(id).unwrap().unwrap().queue(), JobQueue::Timer);
    }

    #[test]
    fn malformed_cycle_dead_letters_without_rerunning() {
        let calls = Arc::new(AtomicU32::new(0));
        let f = fixture(HandlerRegistry::new().with_handler("deliver", CountedFailure(calls.clone())));
        let id = insert(
            &f.store,
            NewJob::message("deliver").with_retry_time_cycle("sometimes"),
        );

        for _ in 0..3 {
            for job in f.acquirer.acquire(10).unwrap().ids() {
                let _ = f.executor.execute(job);
            }
            f.clock.advance(chrono::Duration::minutes(10));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let job = f.store.find_job(id).unwrap().unwrap();
        assert_eq!(job.queue(), JobQueue::DeadLetter);
        assert_eq!(job.record().retries, 3);
        assert!(job.record().lock_owner.is_none());
        assert!(
            job.record()
                .exception_message
                .as_deref()
                .unwrap()
                .contains("sometimes")
        );
    }

    #[test]
    fn malformed_cycle_reports_a_configuration_error() {
        let f = fixture(HandlerRegistry::new().with_handler("deliver", boom));
        let id = insert(
            &f.store,
            NewJob::message("deliver").with_retry_time_cycle("sometimes"),
        );

        assert!(matches!(f.executor.execute(id), Err(JobError::Configuration(_))));
        assert_eq!(f.executor.execute(id).unwrap(), ExecutionOutcome::Moot);
    }

    #[test]
    fn busy_instances_defer_the_job() {
        let f = fixture(HandlerRegistry::new().with_handler("continue", ok));
        let instance = ProcessInstanceId::new();
        let holder = insert(
            &f.store,
            NewJob::async_continuation("continue").for_execution(instance, ExecutionId::new()),
        );
        let waiting = insert(
            &f.store,
            NewJob::async_continuation("continue").for_execution(instance, ExecutionId::new()),
        );

        let holder_record = f.store.find_job(holder).unwrap().unwrap().into_record();
        f.executor.locks.lock_for(&holder_record).unwrap();

        assert_eq!(f.executor.execute(waiting).unwrap(), ExecutionOutcome::Deferred);
        let job = f.store.find_job(waiting).unwrap().unwrap();
        assert_eq!(job.queue(), JobQueue::Executable);
        assert!(job.record().lock_owner.is_none());

        assert_eq!(f.executor.execute(holder).unwrap(), ExecutionOutcome::Succeeded);
        assert_eq!(f.executor.execute(waiting).unwrap(), ExecutionOutcome::Succeeded);
        let instance = f.store.find_process_instance(instance).unwrap().unwrap();
        assert!(instance.locking_job.is_none());
    }
}
