//! Operator-facing job management: deletion, suspension, dead-letter
//! resubmission, retry resets and queries.

use std::sync::Arc;

use tracing::info;

use jobforge_core::{JobError, JobId, JobResult};
use jobforge_events::JobEventKind;

use super::context::EngineContext;
use super::exclusive::release_in;
use super::store::{JobStore, JobTransaction};
use super::types::{Job, JobQueue, JobRecord, JobStats, JobType};

#[derive(Debug)]
pub struct JobAdmin<S> {
    ctx: Arc<EngineContext<S>>,
}

impl<S> Clone for JobAdmin<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<S: JobStore> JobAdmin<S> {
    pub fn new(ctx: Arc<EngineContext<S>>) -> Self {
        Self { ctx }
    }

    pub fn find(&self, job_id: JobId) -> JobResult<Option<Job>> {
        self.ctx.store.find_job(job_id)
    }

    pub fn list(&self, queue: JobQueue, limit: usize) -> JobResult<Vec<Job>> {
        self.ctx.store.list_jobs(queue, limit)
    }

    pub fn stats(&self) -> JobResult<JobStats> {
        self.ctx.store.stats()
    }

    /// Delete a job from whichever queue holds it.
    ///
    /// Rejected with [`JobError::Locked`] while an unexpired lease is held.
    pub fn delete(&self, job_id: JobId) -> JobResult<()> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let job = tx
            .find_job(job_id)?
            .ok_or_else(|| JobError::job_not_found(job_id))?;
        if job.record().is_leased_at(now) {
            return Err(JobError::Locked(job_id.to_string()));
        }

        tx.delete_job(&job)?;
        release_in(&mut tx, job.record())?;
        tx.commit()?;

        info!(job_id = %job_id, queue = %job.queue(), "job deleted");
        self.ctx.emit(job.record(), JobEventKind::Deleted);
        Ok(())
    }

    /// Park a job in the Suspended queue.
    pub fn suspend(&self, job_id: JobId) -> JobResult<()> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let job = tx
            .find_job(job_id)?
            .ok_or_else(|| JobError::job_not_found(job_id))?;
        match job.queue() {
            JobQueue::DeadLetter => {
                return Err(JobError::validation(format!(
                    "job {job_id} is dead-lettered and cannot be suspended"
                )));
            }
            JobQueue::Suspended => {
                return Err(JobError::validation(format!("job {job_id} is already suspended")));
            }
            _ if job.record().is_leased_at(now) => {
                return Err(JobError::Locked(job_id.to_string()));
            }
            _ => {}
        }

        let from = job.queue();
        let mut record = job.record().clone();
        record.clear_lease();
        let moved = move_job(&mut tx, &job, Job::Suspended(record))?;
        tx.commit()?;

        info!(job_id = %job_id, from = %from, "job suspended");
        self.ctx.emit(&moved, JobEventKind::Suspended);
        Ok(())
    }

    /// Return a suspended job to the queue its type starts from.
    pub fn activate(&self, job_id: JobId) -> JobResult<JobQueue> {
        let mut tx = self.ctx.store.begin()?;
        let job = match tx.find_job(job_id)? {
            Some(job @ Job::Suspended(_)) => job,
            Some(_) => {
                return Err(JobError::validation(format!("job {job_id} is not suspended")));
            }
            None => return Err(JobError::job_not_found(job_id)),
        };

        let record = job.record().clone();
        let target = activation_queue(&record);
        let moved = move_job(&mut tx, &job, Job::in_queue(target, record))?;
        tx.commit()?;

        info!(job_id = %job_id, queue = %target, "job activated");
        self.ctx.emit(&moved, JobEventKind::Activated);
        Ok(target)
    }

    /// Resubmit a dead-lettered job for immediate execution with `retries`.
    pub fn move_dead_letter_to_executable(&self, job_id: JobId, retries: u32) -> JobResult<()> {
        require_positive(retries)?;
        let mut tx = self.ctx.store.begin()?;
        let job = match tx.find_job(job_id)? {
            Some(job @ Job::DeadLetter(_)) => job,
            _ => return Err(JobError::not_found("dead-letter job", job_id)),
        };

        let mut record = job.record().clone();
        record.retries = retries;
        record.due_date = None;
        record.clear_lease();
        let moved = move_job(&mut tx, &job, Job::Executable(record))?;
        tx.commit()?;

        info!(job_id = %job_id, retries, "dead-letter job moved to executable");
        self.ctx.emit(&moved, JobEventKind::EntityUpdated);
        Ok(())
    }

    /// Reset the retry budget of a Timer, Executable or DeadLetter job.
    pub fn set_retries(&self, job_id: JobId, retries: u32) -> JobResult<()> {
        require_positive(retries)?;
        let mut tx = self.ctx.store.begin()?;
        let mut job = match tx.find_job(job_id)? {
            Some(job @ (Job::Timer(_) | Job::Executable(_) | Job::DeadLetter(_))) => job,
            Some(job) => {
                return Err(JobError::validation(format!(
                    "retries of {} jobs cannot be changed",
                    job.queue()
                )));
            }
            None => return Err(JobError::job_not_found(job_id)),
        };

        job.record_mut().retries = retries;
        tx.update_job(&mut job)?;
        tx.commit()?;

        info!(job_id = %job_id, retries, "job retries set");
        self.ctx.emit(job.record(), JobEventKind::EntityUpdated);
        Ok(())
    }
}

fn require_positive(retries: u32) -> JobResult<()> {
    if retries == 0 {
        return Err(JobError::validation("retries must be positive"));
    }
    Ok(())
}

fn activation_queue(record: &JobRecord) -> JobQueue {
    match record.job_type {
        JobType::ExternalWorker => JobQueue::ExternalWorker,
        _ if record.is_timer_like() => JobQueue::Timer,
        _ => JobQueue::Executable,
    }
}

fn move_job<T>(tx: &mut T, from: &Job, mut to: Job) -> JobResult<JobRecord>
where
    T: JobTransaction + ?Sized,
{
    tx.delete_job(from)?;
    tx.insert_job(&mut to)?;
    Ok(to.into_record())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::NewJob;
    use chrono::{Duration, Utc};
    use jobforge_core::{Clock, ExecutionId, ManualClock, ProcessInstanceId};

    struct Fixture {
        admin: JobAdmin<Arc<InMemoryJobStore>>,
        store: Arc<InMemoryJobStore>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        let ctx = EngineContext::new(store.clone(), EngineConfig::default())
            .with_clock(Arc::new(clock.clone()));
        Fixture {
            admin: JobAdmin::new(Arc::new(ctx)),
            store,
            clock,
        }
    }

    fn insert(store: &InMemoryJobStore, job: Job) -> JobId {
        let mut job = job;
        let mut tx = store.begin().unwrap();
        tx.insert_job(&mut job).unwrap();
        tx.commit().unwrap();
        job.id()
    }

    fn job(new_job: NewJob) -> Job {
        new_job.into_job(Utc::now(), 3).unwrap()
    }

    #[test]
    fn delete_rejects_active_leases() {
        let f = fixture();
        let mut leased = job(NewJob::message("deliver"));
        leased
            .record_mut()
            .lease("exec-1", f.clock.now() + Duration::seconds(60));
        let id = insert(&f.store, leased);

        assert!(matches!(f.admin.delete(id), Err(JobError::Locked(_))));

        f.clock.advance(Duration::seconds(61));
        f.admin.delete(id).unwrap();
        assert!(f.admin.find(id).unwrap().is_none());
        assert!(f.admin.delete(id).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_clears_the_instance_lock_it_holds() {
        let f = fixture();
        let instance = ProcessInstanceId::new();
        let exclusive = job(NewJob::async_continuation("continue").for_execution(instance, ExecutionId::new()));
        let record = exclusive.record().clone();
        let id = insert(&f.store, exclusive);

        let mut tx = f.store.begin().unwrap();
        let now = f.clock.now();
        crate::jobs::exclusive::lock_in(&mut tx, &record, "exec-1", now, now + Duration::seconds(60))
            .unwrap();
        tx.commit().unwrap();

        f.admin.delete(id).unwrap();
        let instance = f.store.find_process_instance(instance).unwrap().unwrap();
        assert!(instance.locking_job.is_none());
    }

    #[test]
    fn suspend_and_activate_restore_the_starting_queue() {
        let f = fixture();
        let timer = insert(&f.store, job(NewJob::timer("fire", Utc::now() + Duration::hours(1))));
        let message = insert(&f.store, job(NewJob::message("deliver")));

        f.admin.suspend(timer).unwrap();
        f.admin.suspend(message).unwrap();
        assert_eq!(f.admin.stats().unwrap().count(JobQueue::Suspended), 2);
        assert!(matches!(f.admin.suspend(timer), Err(JobError::Validation(_))));

        assert_eq!(f.admin.activate(timer).unwrap(), JobQueue::Timer);
        assert_eq!(f.admin.activate(message).unwrap(), JobQueue::Executable);
        assert!(matches!(f.admin.activate(message), Err(JobError::Validation(_))));
    }

    #[test]
    fn dead_letters_cannot_be_suspended() {
        let f = fixture();
        let id = insert(
            &f.store,
            Job::DeadLetter(job(NewJob::message("deliver")).into_record()),
        );
        assert!(matches!(f.admin.suspend(id), Err(JobError::Validation(_))));
    }

    #[test]
    fn dead_letters_are_resubmitted_with_fresh_retries() {
        let f = fixture();
        let mut record = job(NewJob::message("deliver")).into_record();
        record.retries = 0;
        record.exception_message = Some("boom".into());
        let id = insert(&f.store, Job::DeadLetter(record));

        assert!(matches!(
            f.admin.move_dead_letter_to_executable(id, 0),
            Err(JobError::Validation(_))
        ));
        f.admin.move_dead_letter_to_executable(id, 2).unwrap();

        let job = f.admin.find(id).unwrap().unwrap();
        assert_eq!(job.queue(), JobQueue::Executable);
        assert_eq!(job.record().retries, 2);
        assert!(job.record().is_due_at(f.clock.now()));
    }

    #[test]
    fn set_retries_only_on_runnable_or_dead_jobs() {
        let f = fixture();
        let id = insert(&f.store, job(NewJob::message("deliver")));
        f.admin.set_retries(id, 7).unwrap();
        assert_eq!(f.admin.find(id).unwrap().unwrap().record().retries, 7);

        f.admin.suspend(id).unwrap();
        assert!(matches!(f.admin.set_retries(id, 1), Err(JobError::Validation(_))));
    }
}
