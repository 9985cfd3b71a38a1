//! Job storage abstraction and the in-memory implementation.
//!
//! All lifecycle mutations go through a [`JobTransaction`]. Row writes are
//! revision-checked: an update or delete whose expected revision no longer
//! matches fails with [`JobError::Conflict`], and so does a commit whose reads
//! were invalidated by a concurrent writer. Dropping a transaction without
//! committing rolls it back.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use jobforge_core::{ExecutionId, JobError, JobId, JobResult, ProcessInstanceId};

use super::types::{Job, JobQueue, JobRecord, JobStats, ProcessInstanceRecord, Variables};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    type Tx<'a>: JobTransaction
    where
        Self: 'a;

    /// Start a transaction.
    fn begin(&self) -> JobResult<Self::Tx<'_>>;

    /// Committed state of a job, whichever queue it is in.
    fn find_job(&self, id: JobId) -> JobResult<Option<Job>>;

    /// Jobs of one queue, oldest first.
    fn list_jobs(&self, queue: JobQueue, limit: usize) -> JobResult<Vec<Job>>;

    /// Timer and Executable jobs due at `now` whose lease is absent or expired,
    /// ordered by due date (nulls first) then id.
    fn find_acquirable(&self, now: DateTime<Utc>, limit: usize) -> JobResult<Vec<Job>>;

    /// Unleased (or lease-expired) external worker jobs subscribed to `topic`.
    fn find_claimable_external(
        &self,
        topic: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>>;

    fn find_process_instance(
        &self,
        id: ProcessInstanceId,
    ) -> JobResult<Option<ProcessInstanceRecord>>;

    /// Variables written to an execution.
    fn variables(&self, execution_id: ExecutionId) -> JobResult<Variables>;

    fn stats(&self) -> JobResult<JobStats>;
}

/// A unit of work against the job store.
pub trait JobTransaction {
    fn find_job(&mut self, id: JobId) -> JobResult<Option<Job>>;

    /// Insert into the job's queue. The id must not exist in any queue.
    /// Sets the stored revision on `job`.
    fn insert_job(&mut self, job: &mut Job) -> JobResult<()>;

    /// Rewrite a job in place, conditional on its queue and revision.
    /// Bumps the revision on `job`.
    fn update_job(&mut self, job: &mut Job) -> JobResult<()>;

    /// Delete a job, conditional on its queue and revision.
    fn delete_job(&mut self, job: &Job) -> JobResult<()>;

    fn find_process_instance(
        &mut self,
        id: ProcessInstanceId,
    ) -> JobResult<Option<ProcessInstanceRecord>>;

    fn insert_process_instance(&mut self, record: &mut ProcessInstanceRecord) -> JobResult<()>;

    /// Conditional on the record's revision; bumps it on success.
    fn update_process_instance(&mut self, record: &mut ProcessInstanceRecord) -> JobResult<()>;

    fn variables(&mut self, execution_id: ExecutionId) -> JobResult<Variables>;

    /// Merge `variables` into the execution's variables.
    fn set_variables(&mut self, execution_id: ExecutionId, variables: &Variables) -> JobResult<()>;

    fn commit(self) -> JobResult<()>
    where
        Self: Sized;
}

impl<S: JobStore> JobStore for Arc<S> {
    type Tx<'a>
        = S::Tx<'a>
    where
        Self: 'a;

    fn begin(&self) -> JobResult<Self::Tx<'_>> {
        (**self).begin()
    }

    fn find_job(&self, id: JobId) -> JobResult<Option<Job>> {
        (**self).find_job(id)
    }

    fn list_jobs(&self, queue: JobQueue, limit: usize) -> JobResult<Vec<Job>> {
        (**self).list_jobs(queue, limit)
    }

    fn find_acquirable(&self, now: DateTime<Utc>, limit: usize) -> JobResult<Vec<Job>> {
        (**self).find_acquirable(now, limit)
    }

    fn find_claimable_external(
        &self,
        topic: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        (**self).find_claimable_external(topic, now, limit)
    }

    fn find_process_instance(
        &self,
        id: ProcessInstanceId,
    ) -> JobResult<Option<ProcessInstanceRecord>> {
        (**self).find_process_instance(id)
    }

    fn variables(&self, execution_id: ExecutionId) -> JobResult<Variables> {
        (**self).variables(execution_id)
    }

    fn stats(&self) -> JobResult<JobStats> {
        (**self).stats()
    }
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<JobQueue, HashMap<JobId, JobRecord>>,
    instances: HashMap<ProcessInstanceId, ProcessInstanceRecord>,
    variables: HashMap<ExecutionId, Variables>,
}

impl State {
    fn locate(&self, id: JobId) -> Option<Job> {
        self.queues.iter().find_map(|(queue, jobs)| {
            jobs.get(&id)
                .map(|record| Job::in_queue(*queue, record.clone()))
        })
    }

    fn version_of(&self, id: JobId) -> Option<(JobQueue, u64)> {
        self.queues
            .iter()
            .find_map(|(queue, jobs)| jobs.get(&id).map(|r| (*queue, r.revision)))
    }

    fn queue(&self, queue: JobQueue) -> impl Iterator<Item = &JobRecord> {
        self.queues.get(&queue).into_iter().flat_map(|jobs| jobs.values())
    }
}

/// In-memory job store for tests/dev.
///
/// Each queue is its own map. Transactions are optimistic: they buffer writes
/// and validate, at commit, that every row they read or wrote is unchanged.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobStore for InMemoryJobStore {
    type Tx<'a> = InMemoryTransaction<'a>;

    fn begin(&self) -> JobResult<Self::Tx<'_>> {
        Ok(InMemoryTransaction::new(self))
    }

    fn find_job(&self, id: JobId) -> JobResult<Option<Job>> {
        Ok(self.read().locate(id))
    }

    fn list_jobs(&self, queue: JobQueue, limit: usize) -> JobResult<Vec<Job>> {
        let state = self.read();
        let mut records: Vec<_> = state.queue(queue).cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        records.truncate(limit);
        Ok(records
            .into_iter()
            .map(|r| Job::in_queue(queue, r))
            .collect())
    }

    fn find_acquirable(&self, now: DateTime<Utc>, limit: usize) -> JobResult<Vec<Job>> {
        let state = self.read();
        let mut candidates: Vec<Job> = [JobQueue::Timer, JobQueue::Executable]
            .into_iter()
            .flat_map(|queue| {
                state
                    .queue(queue)
                    .filter(move |r| r.is_due_at(now) && r.is_available_at(now))
                    .map(move |r| Job::in_queue(queue, r.clone()))
            })
            .collect();

        // `None` orders before `Some`, so undated jobs come first.
        candidates.sort_by_key(|j| (j.record().due_date, j.id()));
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn find_claimable_external(
        &self,
        topic: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        let state = self.read();
        let mut candidates: Vec<_> = state
            .queue(JobQueue::ExternalWorker)
            .filter(|r| r.handler_configuration.as_deref() == Some(topic))
            .filter(|r| r.is_due_at(now) && r.is_available_at(now))
            .cloned()
            .collect();

        candidates.sort_by_key(|r| (r.created_at, r.id));
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn find_process_instance(
        &self,
        id: ProcessInstanceId,
    ) -> JobResult<Option<ProcessInstanceRecord>> {
        Ok(self.read().instances.get(&id).cloned())
    }

    fn variables(&self, execution_id: ExecutionId) -> JobResult<Variables> {
        Ok(self
            .read()
            .variables
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    fn stats(&self) -> JobResult<JobStats> {
        let state = self.read();
        let mut stats = JobStats::default();
        for (queue, jobs) in &state.queues {
            for _ in jobs.values() {
                stats.increment(*queue);
            }
        }
        Ok(stats)
    }
}

/// Buffered transaction over an [`InMemoryJobStore`].
#[derive(Debug)]
pub struct InMemoryTransaction<'a> {
    store: &'a InMemoryJobStore,
    /// Pending job writes; `None` marks a deletion.
    jobs: HashMap<JobId, Option<Job>>,
    /// Committed `(queue, revision)` observed per job, validated at commit.
    job_reads: HashMap<JobId, Option<(JobQueue, u64)>>,
    instances: HashMap<ProcessInstanceId, ProcessInstanceRecord>,
    instance_reads: HashMap<ProcessInstanceId, Option<u64>>,
    variables: HashMap<ExecutionId, Variables>,
}

impl<'a> InMemoryTransaction<'a> {
    fn new(store: &'a InMemoryJobStore) -> Self {
        Self {
            store,
            jobs: HashMap::new(),
            job_reads: HashMap::new(),
            instances: HashMap::new(),
            instance_reads: HashMap::new(),
            variables: HashMap::new(),
        }
    }

    /// The job as this transaction sees it.
    fn view(&mut self, id: JobId) -> Option<Job> {
        if let Some(pending) = self.jobs.get(&id) {
            return pending.clone();
        }
        let committed = self.store.read().locate(id);
        self.job_reads
            .entry(id)
            .or_insert_with(|| committed.as_ref().map(|j| (j.queue(), j.record().revision)));
        committed
    }

    fn expect_current(&mut self, job: &Job) -> JobResult<()> {
        match self.view(job.id()) {
            Some(current)
                if current.queue() == job.queue()
                    && current.record().revision == job.record().revision =>
            {
                Ok(())
            }
            Some(current) => Err(JobError::conflict(format!(
                "job {} changed concurrently (expected {}@{}, found {}@{})",
                job.id(),
                job.queue(),
                job.record().revision,
                current.queue(),
                current.record().revision
            ))),
            None => Err(JobError::conflict(format!(
                "job {} was removed concurrently",
                job.id()
            ))),
        }
    }

    fn instance_view(&mut self, id: ProcessInstanceId) -> Option<ProcessInstanceRecord> {
        if let Some(pending) = self.instances.get(&id) {
            return Some(pending.clone());
        }
        let committed = self.store.read().instances.get(&id).cloned();
        self.instance_reads
            .entry(id)
            .or_insert_with(|| committed.as_ref().map(|r| r.revision));
        committed
    }
}

impl JobTransaction for InMemoryTransaction<'_> {
    fn find_job(&mut self, id: JobId) -> JobResult<Option<Job>> {
        Ok(self.view(id))
    }

    fn insert_job(&mut self, job: &mut Job) -> JobResult<()> {
        if let Some(existing) = self.view(job.id()) {
            return Err(JobError::conflict(format!(
                "job {} already exists in the {} queue",
                job.id(),
                existing.queue()
            )));
        }
        job.record_mut().revision = 1;
        self.jobs.insert(job.id(), Some(job.clone()));
        Ok(())
    }

    fn update_job(&mut self, job: &mut Job) -> JobResult<()> {
        self.expect_current(job)?;
        job.record_mut().revision += 1;
        self.jobs.insert(job.id(), Some(job.clone()));
        Ok(())
    }

    fn delete_job(&mut self, job: &Job) -> JobResult<()> {
        self.expect_current(job)?;
        self.jobs.insert(job.id(), None);
        Ok(())
    }

    fn find_process_instance(
        &mut self,
        id: ProcessInstanceId,
    ) -> JobResult<Option<ProcessInstanceRecord>> {
        Ok(self.instance_view(id))
    }

    fn insert_process_instance(&mut self, record: &mut ProcessInstanceRecord) -> JobResult<()> {
        if self.instance_view(record.id).is_some() {
            return Err(JobError::conflict(format!(
                "process instance {} already exists",
                record.id
            )));
        }
        record.revision = 1;
        self.instances.insert(record.id, record.clone());
        Ok(())
    }

    fn update_process_instance(&mut self, record: &mut ProcessInstanceRecord) -> JobResult<()> {
        match self.instance_view(record.id) {
            Some(current) if current.revision == record.revision => {
                record.revision += 1;
                self.instances.insert(record.id, record.clone());
                Ok(())
            }
            Some(_) => Err(JobError::conflict(format!(
                "process instance {} changed concurrently",
                record.id
            ))),
            None => Err(JobError::not_found("process instance", record.id.to_string())),
        }
    }

    fn variables(&mut self, execution_id: ExecutionId) -> JobResult<Variables> {
        let mut variables = self
            .store
            .read()
            .variables
            .get(&execution_id)
            .cloned()
            .unwrap_or_default();
        if let Some(pending) = self.variables.get(&execution_id) {
            variables.extend(pending.clone());
        }
        Ok(variables)
    }

    fn set_variables(&mut self, execution_id: ExecutionId, variables: &Variables) -> JobResult<()> {
        self.variables
            .entry(execution_id)
            .or_default()
            .extend(variables.clone());
        Ok(())
    }

    fn commit(self) -> JobResult<()> {
        let store = self.store;
        let mut state = store.write();

        for (id, expected) in &self.job_reads {
            if state.version_of(*id) != *expected {
                return Err(JobError::conflict(format!(
                    "job {id} was modified by a concurrent transaction"
                )));
            }
        }
        for (id, expected) in &self.instance_reads {
            if state.instances.get(id).map(|r| r.revision) != *expected {
                return Err(JobError::conflict(format!(
                    "process instance {id} was modified by a concurrent transaction"
                )));
            }
        }

        for (id, pending) in self.jobs {
            for jobs in state.queues.values_mut() {
                jobs.remove(&id);
            }
            if let Some(job) = pending {
                let queue = job.queue();
                state
                    .queues
                    .entry(queue)
                    .or_default()
                    .insert(id, job.into_record());
            }
        }
        for (id, record) in self.instances {
            state.instances.insert(id, record);
        }
        for (execution_id, variables) in self.variables {
            state
                .variables
                .entry(execution_id)
                .or_default()
                .extend(variables);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::NewJob;

    fn seed(store: &InMemoryJobStore, new_job: NewJob) -> Job {
        let mut job = new_job.into_job(Utc::now(), 3).unwrap();
        let mut tx = store.begin().unwrap();
        tx.insert_job(&mut job).unwrap();
        tx.commit().unwrap();
        job
    }

    #[test]
    fn inserted_jobs_are_visible_after_commit_only() {
        let store = InMemoryJobStore::new();
        let mut job = NewJob::message("deliver").into_job(Utc::now(), 3).unwrap();

        let mut tx = store.begin().unwrap();
        tx.insert_job(&mut job).unwrap();
        assert!(store.find_job(job.id()).unwrap().is_none());
        tx.commit().unwrap();

        let stored = store.find_job(job.id()).unwrap().unwrap();
        assert_eq!(stored.queue(), JobQueue::Executable);
        assert_eq!(stored.record().revision, 1);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let store = InMemoryJobStore::new();
        let job = seed(&store, NewJob::message("deliver"));

        {
            let mut tx = store.begin().unwrap();
            tx.delete_job(&job).unwrap();
        }

        assert!(store.find_job(job.id()).unwrap().is_some());
    }

    #[test]
    fn move_between_queues_is_atomic() {
        let store = InMemoryJobStore::new();
        let job = seed(&store, NewJob::timer("fire", Utc::now()));

        let mut tx = store.begin().unwrap();
        tx.delete_job(&job).unwrap();
        let mut moved = Job::Executable(job.clone().into_record());
        tx.insert_job(&mut moved).unwrap();
        tx.commit().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.timer, 0);
        assert_eq!(stats.executable, 1);
        assert_eq!(
            store.find_job(job.id()).unwrap().unwrap().queue(),
            JobQueue::Executable
        );
    }

    #[test]
    fn stale_revision_update_conflicts() {
        let store = InMemoryJobStore::new();
        let job = seed(&store, NewJob::message("deliver"));

        let mut first = job.clone();
        let mut tx = store.begin().unwrap();
        tx.update_job(&mut first).unwrap();
        tx.commit().unwrap();

        let mut stale = job;
        let mut tx = store.begin().unwrap();
        let err = tx.update_job(&mut stale).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn racing_transactions_conflict_at_commit() {
        let store = InMemoryJobStore::new();
        let job = seed(&store, NewJob::message("deliver"));

        let mut a = store.begin().unwrap();
        let mut b = store.begin().unwrap();

        let mut via_a = job.clone();
        via_a.record_mut().lease("a", Utc::now());
        a.update_job(&mut via_a).unwrap();

        let mut via_b = job.clone();
        via_b.record_mut().lease("b", Utc::now());
        b.update_job(&mut via_b).unwrap();

        a.commit().unwrap();
        assert!(b.commit().unwrap_err().is_conflict());

        let stored = store.find_job(job.id()).unwrap().unwrap();
        assert!(stored.record().is_locked_by("a"));
    }

    #[test]
    fn variables_merge_per_execution() {
        let store = InMemoryJobStore::new();
        let execution = ExecutionId::new();

        let mut first = Variables::new();
        first.insert("x".into(), serde_json::json!(1));
        let mut second = Variables::new();
        second.insert("y".into(), serde_json::json!("two"));

        let mut tx = store.begin().unwrap();
        tx.set_variables(execution, &first).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        tx.set_variables(execution, &second).unwrap();
        assert_eq!(tx.variables(execution).unwrap().len(), 2);
        tx.commit().unwrap();

        let stored = store.variables(execution).unwrap();
        assert_eq!(stored["x"], serde_json::json!(1));
        assert_eq!(stored["y"], serde_json::json!("two"));
    }

    #[test]
    fn acquirable_excludes_future_and_leased_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let due = seed(&store, NewJob::timer("fire", now - chrono::Duration::seconds(1)));
        seed(&store, NewJob::timer("later", now + chrono::Duration::minutes(5)));
        let leased = seed(&store, NewJob::message("deliver"));
        let undated = seed(&store, NewJob::message("deliver"));

        let mut locked = leased.clone();
        locked
            .record_mut()
            .lease("other", now + chrono::Duration::minutes(5));
        let mut tx = store.begin().unwrap();
        tx.update_job(&mut locked).unwrap();
        tx.commit().unwrap();

        let ids: Vec<_> = store
            .find_acquirable(now, 10)
            .unwrap()
            .iter()
            .map(Job::id)
            .collect();
        assert_eq!(ids, vec![undated.id(), due.id()]);
    }
}
