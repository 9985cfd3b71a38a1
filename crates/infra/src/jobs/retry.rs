//! Retry and backoff for failed jobs.
//!
//! A failed Executable job is moved, in one transaction, either back to the
//! Timer queue with one retry fewer and a new due date, or to the DeadLetter
//! queue when this failure exhausted its budget.
//!
//! ## Next due date
//!
//! - Retry cycle declared: the next occurrence of the cycle after now (a cycle
//!   with an explicit start stays on its own grid).
//! - No cycle, timer-type job: the first point of `prior_due + k * default wait`
//!   after now, so successive timer retries do not drift.
//! - No cycle, anything else: now + async wait.
//!
//! A cycle or wait time that yields no usable due date is a configuration
//! error. The job is dead-lettered with the error as its exception message
//! rather than being re-run on every lease expiry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use jobforge_core::{HandlerError, JobError, JobId, JobResult};
use jobforge_events::JobEventKind;

use crate::config::{EngineConfig, add_duration};

use super::context::EngineContext;
use super::cycle::RetryCycle;
use super::exclusive::release_in;
use super::store::{JobStore, JobTransaction};
use super::types::{Job, JobRecord};

/// Retry bookkeeping for one failed execution, captured before the handler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedJobCommand {
    pub job_id: JobId,
    /// Cycle to apply; falls back to the one stored on the job.
    pub retry_time_cycle: Option<String>,
}

impl FailedJobCommand {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            retry_time_cycle: None,
        }
    }

    pub fn with_retry_time_cycle(mut self, cycle: Option<String>) -> Self {
        self.retry_time_cycle = cycle;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back in the Timer queue.
    Rescheduled {
        due_date: DateTime<Utc>,
        retries: u32,
    },
    /// Budget exhausted; the job is in the DeadLetter queue.
    DeadLettered { retries: u32 },
}

/// What a failure does to a job, computed without touching storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
    /// Retries stored on the moved job.
    pub retries: u32,
    /// `None` when the job is dead-lettered.
    pub due_date: Option<DateTime<Utc>>,
}

impl RetryPlan {
    /// Decide the next state of `record` after a failure at `now`.
    ///
    /// A malformed `cycle` is a [`JobError::Configuration`].
    pub fn compute(
        record: &JobRecord,
        cycle: Option<&str>,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> JobResult<Self> {
        let cycle = cycle.map(RetryCycle::parse).transpose()?;

        let (current, due_date) = match &cycle {
            Some(cycle) => {
                // The cycle sets the budget on the first failure only.
                let current = if record.exception_message.is_none() {
                    cycle.repeat
                } else {
                    record.retries
                };
                (current, cycle.next_after(now))
            }
            None => (record.retries, Some(fixed_backoff(record, config, now)?)),
        };

        let retries = current.saturating_sub(1);
        if current <= 1 || due_date.is_none() {
            return Ok(Self {
                retries,
                due_date: None,
            });
        }
        Ok(Self { retries, due_date })
    }

    pub fn is_dead_letter(&self) -> bool {
        self.due_date.is_none()
    }
}

fn fixed_backoff(
    record: &JobRecord,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> JobResult<DateTime<Utc>> {
    let out_of_range = |key: &str| JobError::configuration(format!("{key} is out of range"));
    match record.due_date {
        Some(prior) if record.is_timer_like() => {
            let wait = chrono::Duration::from_std(config.default_failed_job_wait_time)
                .map_err(|_| out_of_range("default failed job wait time"))?;
            let step = wait.num_milliseconds().max(1);
            let first = prior
                .checked_add_signed(wait)
                .ok_or_else(|| out_of_range("default failed job wait time"))?;
            if first > now {
                return Ok(first);
            }
            let behind = (now - first).num_milliseconds();
            (behind / step + 1)
                .checked_mul(step)
                .and_then(chrono::Duration::try_milliseconds)
                .and_then(|offset| first.checked_add_signed(offset))
                .ok_or_else(|| out_of_range("default failed job wait time"))
        }
        _ => add_duration(now, config.async_failed_job_wait_time)
            .ok_or_else(|| out_of_range("async failed job wait time")),
    }
}

/// Applies [`RetryPlan`]s to stored jobs.
#[derive(Debug)]
pub struct RetryEngine<S> {
    ctx: Arc<EngineContext<S>>,
}

impl<S> Clone for RetryEngine<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<S: JobStore> RetryEngine<S> {
    pub fn new(ctx: Arc<EngineContext<S>>) -> Self {
        Self { ctx }
    }

    /// Record a failure of `job_id` and reschedule or dead-letter it.
    pub fn retry(&self, job_id: JobId, error: &HandlerError) -> JobResult<RetryOutcome> {
        self.apply(&FailedJobCommand::new(job_id), error)
    }

    /// Run deferred retry bookkeeping in its own transaction.
    ///
    /// A [`JobError::Configuration`] means the job was dead-lettered with the
    /// configuration error recorded and its retries left as they were.
    pub fn apply(&self, command: &FailedJobCommand, error: &HandlerError) -> JobResult<RetryOutcome> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;

        let job = tx
            .find_job(command.job_id)?
            .ok_or_else(|| JobError::job_not_found(command.job_id))?;
        let Job::Executable(record) = &job else {
            return Err(JobError::validation(format!(
                "job {} is in the {} queue; only executable jobs can be retried",
                job.id(),
                job.queue()
            )));
        };

        let cycle = command
            .retry_time_cycle
            .as_deref()
            .or(record.retry_time_cycle.as_deref());
        let plan = match RetryPlan::compute(record, cycle, &self.ctx.config, now) {
            Ok(plan) => plan,
            Err(JobError::Configuration(reason)) => {
                let mut next = record.clone();
                next.clear_lease();
                next.exception_message = Some(reason.clone());
                next.exception_stacktrace = Some(error.to_string());
                tx.delete_job(&job)?;
                let mut moved = Job::DeadLetter(next);
                tx.insert_job(&mut moved)?;
                release_in(&mut tx, record)?;
                tx.commit()?;

                let moved = moved.into_record();
                error!(job_id = %moved.id, error = %reason, "invalid retry configuration; dead-lettered");
                self.ctx.emit(&moved, JobEventKind::EntityUpdated);
                self.ctx.emit(&moved, JobEventKind::DeadLettered);
                return Err(JobError::Configuration(reason));
            }
            Err(err) => return Err(err),
        };

        let mut next = record.clone();
        next.clear_lease();
        next.retries = plan.retries;
        next.exception_message = Some(error.message.clone());
        next.exception_stacktrace = error.details.clone();

        tx.delete_job(&job)?;
        let mut moved = match plan.due_date {
            Some(due_date) => {
                next.due_date = Some(due_date);
                Job::Timer(next)
            }
            None => Job::DeadLetter(next),
        };
        tx.insert_job(&mut moved)?;
        release_in(&mut tx, record)?;
        tx.commit()?;

        let moved = moved.into_record();
        self.ctx.emit(&moved, JobEventKind::EntityUpdated);
        self.ctx.emit(
            &moved,
            JobEventKind::RetriesDecremented {
                retries: moved.retries,
            },
        );

        match plan.due_date {
            Some(due_date) => {
                info!(
                    job_id = %moved.id,
                    retries = moved.retries,
                    due_date = %due_date,
                    error = %error,
                    "job failed; rescheduled"
                );
                Ok(RetryOutcome::Rescheduled {
                    due_date,
                    retries: moved.retries,
                })
            }
            None => {
                warn!(job_id = %moved.id, error = %error, "job failed; retries exhausted, dead-lettered");
                self.ctx.emit(&moved, JobEventKind::DeadLettered);
                Ok(RetryOutcome::DeadLettered {
                    retries: moved.retries,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::NewJob;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn record(new_job: NewJob) -> JobRecord {
        new_job.into_job(now(), 3).unwrap().into_record()
    }

    #[test]
    fn async_jobs_wait_the_short_backoff() {
        let plan = RetryPlan::compute(
            &record(NewJob::message("deliver")),
            None,
            &EngineConfig::default(),
            now(),
        )
        .unwrap();
        assert_eq!(plan.retries, 2);
        assert_eq!(plan.due_date, Some(now() + Duration::seconds(10)));
    }

    #[test]
    fn timer_jobs_keep_their_grid() {
        let due = now() - Duration::seconds(30);
        let plan = RetryPlan::compute(
            &record(NewJob::timer("fire", due)),
            None,
            &EngineConfig::default(),
            now(),
        )
        .unwrap();
        assert_eq!(plan.due_date, Some(due + Duration::seconds(60)));

        let long_overdue = now() - Duration::seconds(150);
        let plan = RetryPlan::compute(
            &record(NewJob::timer("fire", long_overdue)),
            None,
            &EngineConfig::default(),
            now(),
        )
        .unwrap();
        assert_eq!(plan.due_date, Some(long_overdue + Duration::seconds(180)));
    }

    #[test]
    fn message_jobs_with_a_due_date_still_use_the_async_wait() {
        let plan = RetryPlan::compute(
            &record(NewJob::message("deliver").due_at(now() - Duration::hours(1))),
            None,
            &EngineConfig::default(),
            now(),
        )
        .unwrap();
        assert_eq!(plan.due_date, Some(now() + Duration::seconds(10)));
    }

    #[test]
    fn last_retry_dead_letters() {
        let mut rec = record(NewJob::message("deliver"));
        rec.retries = 1;
        let plan = RetryPlan::compute(&rec, None, &EngineConfig::default(), now()).unwrap();
        assert!(plan.is_dead_letter());
        assert_eq!(plan.retries, 0);
    }

    #[test]
    fn cycle_sets_the_budget_on_first_failure() {
        let rec = record(NewJob::message("deliver"));
        let plan = RetryPlan::compute(&rec, Some("R5/PT5M"), &EngineConfig::default(), now())
            .unwrap();
        assert_eq!(plan.retries, 4);
        assert_eq!(plan.due_date, Some(now() + Duration::minutes(5)));

        let mut failed_before = rec;
        failed_before.retries = 2;
        failed_before.exception_message = Some("boom".into());
        let plan = RetryPlan::compute(
            &failed_before,
            Some("R5/PT5M"),
            &EngineConfig::default(),
            now(),
        )
        .unwrap();
        assert_eq!(plan.retries, 1);
    }

    #[test]
    fn ended_cycle_dead_letters() {
        let rec = record(NewJob::message("deliver"));
        let plan = RetryPlan::compute(
            &rec,
            Some("R5/PT1H/2026-05-01T12:30:00Z"),
            &EngineConfig::default(),
            now(),
        )
        .unwrap();
        assert!(plan.is_dead_letter());
    }

    #[test]
    fn malformed_cycle_is_a_configuration_error() {
        let err = RetryPlan::compute(
            &record(NewJob::message("deliver")),
            Some("every five minutes"),
            &EngineConfig::default(),
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
    }

    #[test]
    fn unrepresentable_wait_is_a_configuration_error() {
        let config = EngineConfig::default()
            .with_async_failed_job_wait_time(std::time::Duration::MAX)
            .with_default_failed_job_wait_time(std::time::Duration::MAX);

        let err = RetryPlan::compute(&record(NewJob::message("deliver")), None, &config, now())
            .unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));

        let timer = record(NewJob::timer("fire", now() - Duration::seconds(30)));
        let err = RetryPlan::compute(&timer, None, &config, now()).unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
    }

    #[test]
    fn configuration_errors_dead_letter_with_the_reason() {
        use crate::jobs::store::InMemoryJobStore;
        use jobforge_core::ManualClock;

        let store = InMemoryJobStore::arc();
        let ctx = EngineContext::new(store.clone(), EngineConfig::default())
            .with_clock(Arc::new(ManualClock::starting_now()));
        let engine = RetryEngine::new(Arc::new(ctx));

        let mut job = NewJob::message("deliver")
            .with_retry_time_cycle("R3/P106751991167DT2562047788015H")
            .into_job(now(), 3)
            .unwrap();
        job.record_mut().lease("exec-1", now() + Duration::minutes(5));
        let mut tx = store.begin().unwrap();
        tx.insert_job(&mut job).unwrap();
        tx.commit().unwrap();

        let err = engine
            .retry(job.id(), &HandlerError::new("boom"))
            .unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));

        let stored = store.find_job(job.id()).unwrap().unwrap();
        assert_eq!(stored.queue(), crate::jobs::types::JobQueue::DeadLetter);
        let rec = stored.record();
        assert_eq!(rec.retries, 3);
        assert!(rec.lock_owner.is_none());
        assert!(rec.exception_message.as_deref().unwrap().contains("invalid retry cycle"));
        assert_eq!(rec.exception_stacktrace.as_deref(), Some("boom"));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn retries_never_increase(retries in 0u32..1_000, failed_before in any::<bool>()) {
            let mut rec = record(NewJob::message("deliver"));
            rec.retries = retries;
            if failed_before {
                rec.exception_message = Some("earlier".into());
            }

            let plan = RetryPlan::compute(&rec, None, &EngineConfig::default(), now()).unwrap();
            prop_assert!(plan.retries <= retries);
            prop_assert_eq!(plan.is_dead_letter(), retries <= 1);
        }

        #[test]
        fn rescheduled_jobs_are_due_in_the_future(
            offset_secs in -100_000i64..100_000,
            timer in any::<bool>(),
        ) {
            let due = now() + Duration::seconds(offset_secs);
            let rec = if timer {
                record(NewJob::timer("fire", due))
            } else {
                record(NewJob::async_continuation("continue").due_at(due))
            };

            let plan = RetryPlan::compute(&rec, None, &EngineConfig::default(), now()).unwrap();
            let next = plan.due_date.unwrap();
            prop_assert!(next > now());
        }
    }
}
