//! Instance-level exclusivity.
//!
//! An exclusive job correlated to a process instance must hold that instance's
//! lock while it runs. The lock is a persisted, revision-checked field on the
//! process-instance record (`lock_owner`, `lock_time`, `locking_job`), never an
//! in-memory mutex, because acquisition and execution may run in different
//! processes. It is released in the same transaction that resolves the job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use jobforge_core::JobResult;

use super::context::EngineContext;
use super::store::{JobStore, JobTransaction};
use super::types::{JobRecord, ProcessInstanceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Not exclusive, or not correlated to a process instance.
    NotRequired,
    Acquired,
    /// Another job of the instance holds an unexpired lock.
    Busy,
}

/// Take the instance lock for `record` inside `tx`.
///
/// Succeeds when the lock is free, expired, or already held by the same job.
/// A missing instance record is created holding the lock.
pub fn lock_in<T>(
    tx: &mut T,
    record: &JobRecord,
    owner: &str,
    now: DateTime<Utc>,
    until: DateTime<Utc>,
) -> JobResult<LockOutcome>
where
    T: JobTransaction + ?Sized,
{
    if !record.exclusive {
        return Ok(LockOutcome::NotRequired);
    }
    let Some(instance_id) = record.process_instance_id() else {
        return Ok(LockOutcome::NotRequired);
    };

    match tx.find_process_instance(instance_id)? {
        None => {
            let mut instance = ProcessInstanceRecord::new(instance_id);
            instance.tenant_id = record.tenant_id;
            take(&mut instance, record, owner, until);
            tx.insert_process_instance(&mut instance)?;
            Ok(LockOutcome::Acquired)
        }
        Some(instance)
            if instance.is_locked_at(now) && instance.locking_job != Some(record.id) =>
        {
            debug!(
                job_id = %record.id,
                process_instance_id = %instance_id,
                locking_job = ?instance.locking_job,
                "process instance is locked by another job"
            );
            Ok(LockOutcome::Busy)
        }
        Some(mut instance) => {
            take(&mut instance, record, owner, until);
            tx.update_process_instance(&mut instance)?;
            Ok(LockOutcome::Acquired)
        }
    }
}

fn take(instance: &mut ProcessInstanceRecord, record: &JobRecord, owner: &str, until: DateTime<Utc>) {
    instance.lock_owner = Some(owner.to_string());
    instance.lock_time = Some(until);
    instance.locking_job = Some(record.id);
}

/// Clear the instance lock inside `tx` if `record` is the job holding it.
///
/// Returns whether a lock was released.
pub fn release_in<T>(tx: &mut T, record: &JobRecord) -> JobResult<bool>
where
    T: JobTransaction + ?Sized,
{
    if !record.exclusive {
        return Ok(false);
    }
    let Some(instance_id) = record.process_instance_id() else {
        return Ok(false);
    };

    match tx.find_process_instance(instance_id)? {
        Some(mut instance) if instance.locking_job == Some(record.id) => {
            instance.clear_lock();
            tx.update_process_instance(&mut instance)?;
            debug!(job_id = %record.id, process_instance_id = %instance_id, "released process instance lock");
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Standalone lock operations, each in its own transaction.
#[derive(Debug)]
pub struct ExclusiveLocks<S> {
    ctx: Arc<EngineContext<S>>,
}

impl<S> Clone for ExclusiveLocks<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<S: JobStore> ExclusiveLocks<S> {
    pub fn new(ctx: Arc<EngineContext<S>>) -> Self {
        Self { ctx }
    }

    /// Lock the instance for this executor before dispatching `record`.
    ///
    /// A lost race on the instance row counts as [`LockOutcome::Busy`].
    pub fn lock_for(&self, record: &JobRecord) -> JobResult<LockOutcome> {
        if !record.exclusive || record.process_instance_id().is_none() {
            return Ok(LockOutcome::NotRequired);
        }

        let now = self.ctx.now();
        let until = self.ctx.lock_until(now)?;
        let mut tx = self.ctx.store.begin()?;

        let outcome = match lock_in(&mut tx, record, &self.ctx.config.lock_owner, now, until) {
            Ok(outcome) => outcome,
            Err(err) if err.is_conflict() => return Ok(LockOutcome::Busy),
            Err(err) => return Err(err),
        };
        if outcome != LockOutcome::Acquired {
            return Ok(outcome);
        }

        match tx.commit() {
            Ok(()) => Ok(LockOutcome::Acquired),
            Err(err) if err.is_conflict() => {
                debug!(job_id = %record.id, "lost the race for the process instance lock");
                Ok(LockOutcome::Busy)
            }
            Err(err) => Err(err),
        }
    }

    /// Release the lock held by `record`, if any.
    pub fn release(&self, record: &JobRecord) -> JobResult<bool> {
        let mut tx = self.ctx.store.begin()?;
        let released = release_in(&mut tx, record)?;
        if released {
            tx.commit()?;
        }
        Ok(released)
    }
}
