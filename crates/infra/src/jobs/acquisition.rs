//! Job acquisition.
//!
//! One pass selects due, unleased Timer and Executable jobs and leases each in
//! its own revision-checked transaction. Due timers are moved into the
//! Executable queue as part of being leased. A job another acquirer got to
//! first is skipped, never retried within the pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobforge_core::JobResult;
use jobforge_events::JobEventKind;

use super::context::EngineContext;
use super::store::{JobStore, JobTransaction};
use super::types::{AcquiredJobBatch, Job, JobQueue, JobRecord};

#[derive(Debug)]
pub struct JobAcquirer<S> {
    ctx: Arc<EngineContext<S>>,
}

impl<S> Clone for JobAcquirer<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<S: JobStore> JobAcquirer<S> {
    pub fn new(ctx: Arc<EngineContext<S>>) -> Self {
        Self { ctx }
    }

    /// Lease up to `capacity` jobs (bounded by `max_jobs_per_acquisition`) for
    /// this engine's lock owner.
    pub fn acquire(&self, capacity: usize) -> JobResult<AcquiredJobBatch> {
        let limit = capacity.min(self.ctx.config.max_jobs_per_acquisition);
        if limit == 0 {
            return Ok(AcquiredJobBatch::default());
        }

        let now = self.ctx.now();
        let until = self.ctx.lock_until(now)?;
        let owner = self.ctx.config.lock_owner.as_str();
        let candidates = self.ctx.store.find_acquirable(now, limit)?;

        let mut jobs = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            match self.lease(candidate, owner, now, until) {
                Ok(Some(record)) => jobs.push(record),
                Ok(None) => {}
                Err(err) if err.is_conflict() => {
                    debug!(job_id = %candidate.id(), "job acquired concurrently, skipping");
                }
                Err(err) if jobs.is_empty() => return Err(err),
                Err(err) => {
                    warn!(error = %err, acquired = jobs.len(), "acquisition pass stopped early");
                    break;
                }
            }
        }

        for record in &jobs {
            self.ctx.emit(
                record,
                JobEventKind::Acquired {
                    lock_owner: owner.to_string(),
                },
            );
        }
        if !jobs.is_empty() {
            info!(lock_owner = owner, count = jobs.len(), "jobs acquired");
        }
        Ok(AcquiredJobBatch { jobs })
    }

    fn lease(
        &self,
        candidate: &Job,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> JobResult<Option<JobRecord>> {
        let mut tx = self.ctx.store.begin()?;
        let Some(job) = tx.find_job(candidate.id())? else {
            return Ok(None);
        };
        if job.queue() != candidate.queue()
            || job.record().revision != candidate.record().revision
            || !job.record().is_available_at(now)
        {
            return Ok(None);
        }

        let leased = match job.queue() {
            JobQueue::Executable => {
                let mut job = job;
                job.record_mut().lease(owner, until);
                tx.update_job(&mut job)?;
                job
            }
            JobQueue::Timer => {
                tx.delete_job(&job)?;
                let mut record = job.into_record();
                record.lease(owner, until);
                let mut job = Job::Executable(record);
                tx.insert_job(&mut job)?;
                debug!(job_id = %job.id(), "due timer moved to executable");
                job
            }
            _ => return Ok(None),
        };
        tx.commit()?;
        Ok(Some(leased.into_record()))
    }
}
