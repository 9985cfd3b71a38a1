//! Creating jobs outside of a running handler.

use std::sync::Arc;

use tracing::debug;

use jobforge_core::{JobId, JobResult};
use jobforge_events::JobEventKind;

use super::context::EngineContext;
use super::store::{JobStore, JobTransaction};
use super::types::{Job, NewJob};

#[derive(Debug)]
pub struct JobScheduler<S> {
    ctx: Arc<EngineContext<S>>,
}

impl<S> Clone for JobScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<S: JobStore> JobScheduler<S> {
    pub fn new(ctx: Arc<EngineContext<S>>) -> Self {
        Self { ctx }
    }

    pub fn schedule(&self, new_job: NewJob) -> JobResult<JobId> {
        let ids = self.schedule_all(vec![new_job])?;
        Ok(ids[0])
    }

    /// Create several jobs atomically: all of them or none.
    pub fn schedule_all(&self, new_jobs: Vec<NewJob>) -> JobResult<Vec<JobId>> {
        let now = self.ctx.now();
        let default_retries = self.ctx.config.default_job_retries;
        let mut jobs = new_jobs
            .into_iter()
            .map(|new_job| new_job.into_job(now, default_retries))
            .collect::<JobResult<Vec<Job>>>()?;

        let mut tx = self.ctx.store.begin()?;
        for job in &mut jobs {
            tx.insert_job(job)?;
        }
        tx.commit()?;

        for job in &jobs {
            debug!(job_id = %job.id(), queue = %job.queue(), handler_type = %job.record().handler_type, "job scheduled");
            self.ctx.emit(
                job.record(),
                JobEventKind::Created {
                    queue: job.queue().to_string(),
                },
            );
        }
        Ok(jobs.iter().map(Job::id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobQueue;
    use jobforge_core::{ExecutionId, ProcessInstanceId};

    fn scheduler() -> (JobScheduler<Arc<InMemoryJobStore>>, Arc<InMemoryJobStore>) {
        let store = InMemoryJobStore::arc();
        let ctx = EngineContext::new(store.clone(), EngineConfig::default().with_default_job_retries(5));
        (JobScheduler::new(Arc::new(ctx)), store)
    }

    #[test]
    fn scheduled_jobs_take_the_configured_default_retries() {
        let (scheduler, store) = scheduler();
        let id = scheduler.schedule(NewJob::message("deliver")).unwrap();

        let job = store.find_job(id).unwrap().unwrap();
        assert_eq!(job.queue(), JobQueue::Executable);
        assert_eq!(job.record().retries, 5);
        assert_eq!(job.record().revision, 1);
    }

    #[test]
    fn one_invalid_job_schedules_nothing() {
        let (scheduler, store) = scheduler();
        let result = scheduler.schedule_all(vec![
            NewJob::message("deliver"),
            NewJob::external_worker("billing"),
        ]);

        assert!(result.is_err());
        assert_eq!(store.stats().unwrap().total(), 0);

        let ids = scheduler
            .schedule_all(vec![
                NewJob::message("deliver"),
                NewJob::external_worker("billing")
                    .for_execution(ProcessInstanceId::new(), ExecutionId::new()),
            ])
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.stats().unwrap().count(JobQueue::ExternalWorker), 1);
    }
}
