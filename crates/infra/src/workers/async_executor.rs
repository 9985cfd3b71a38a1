//! Async executor: an acquisition thread feeding a bounded worker pool.
//!
//! The acquisition thread runs a pass every `acquisition_interval`, or sooner
//! when the pool drains, and only asks for as many jobs as the pool and its
//! queue can take. Workers dispatch each job through [`JobEngine::execute`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info};

use jobforge_core::{JobError, JobId};

use crate::jobs::{ExecutionOutcome, JobEngine, JobStore};

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub acquisition_passes: u64,
    pub jobs_acquired: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_deferred: u64,
    pub jobs_moot: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Shutdown,
    /// Run an acquisition pass now.
    Wake,
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct AsyncExecutorHandle {
    signal: mpsc::Sender<Signal>,
    acquisition: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl AsyncExecutorHandle {
    /// Stop acquiring, let the workers finish what was already handed to
    /// them, and wait for every thread.
    pub fn shutdown(mut self) {
        let _ = self.signal.send(Signal::Shutdown);
        if let Some(j) = self.acquisition.take() {
            let _ = j.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    /// Trigger an acquisition pass without waiting for the next tick.
    pub fn wake(&self) {
        let _ = self.signal.send(Signal::Wake);
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Background executor for a [`JobEngine`].
#[derive(Debug)]
pub struct AsyncExecutor;

impl AsyncExecutor {
    /// Spawn the acquisition thread and `worker_threads` workers.
    pub fn spawn<S>(engine: Arc<JobEngine<S>>) -> std::io::Result<AsyncExecutorHandle>
    where
        S: JobStore + 'static,
    {
        let config = engine.config().clone();
        let worker_threads = config.worker_threads.max(1);
        let queue_capacity = config.queue_capacity.max(1);

        let (signal_tx, signal_rx) = mpsc::channel::<Signal>();
        let (job_tx, job_rx) = mpsc::sync_channel::<JobId>(queue_capacity);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let mut workers = Vec::with_capacity(worker_threads);
        for index in 0..worker_threads {
            let worker = Worker {
                engine: engine.clone(),
                jobs: job_rx.clone(),
                in_flight: in_flight.clone(),
                signal: signal_tx.clone(),
                stats: stats.clone(),
            };
            // A failed spawn drops `job_tx` on return, which stops the workers
            // already started.
            let join = thread::Builder::new()
                .name(format!("jobforge-worker-{index}"))
                .spawn(move || worker.run())?;
            workers.push(join);
        }

        let acquisition = Acquisition {
            engine,
            jobs: job_tx,
            signal: signal_rx,
            in_flight,
            stats: stats.clone(),
            capacity: queue_capacity + worker_threads,
        };
        let acquisition = thread::Builder::new()
            .name("jobforge-acquisition".to_string())
            .spawn(move || acquisition.run())?;

        info!(
            lock_owner = %config.lock_owner,
            worker_threads,
            queue_capacity,
            "async executor started"
        );
        Ok(AsyncExecutorHandle {
            signal: signal_tx,
            acquisition: Some(acquisition),
            workers,
            stats,
            started: Instant::now(),
        })
    }
}

struct Acquisition<S> {
    engine: Arc<JobEngine<S>>,
    jobs: SyncSender<JobId>,
    signal: Receiver<Signal>,
    in_flight: Arc<AtomicUsize>,
    stats: Arc<Mutex<ExecutorStats>>,
    /// Jobs the pool can hold: running plus queued.
    capacity: usize,
}

impl<S: JobStore> Acquisition<S> {
    fn run(self) {
        let interval = self.engine.config().acquisition_interval;
        loop {
            if !self.pass() {
                break;
            }
            match self.signal.recv_timeout(interval) {
                Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => continue,
                Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // Dropping `jobs` lets the workers drain the queue and exit.
        info!("acquisition stopped");
    }

    /// One acquisition pass. Returns false once the workers are gone.
    fn pass(&self) -> bool {
        let free = self
            .capacity
            .saturating_sub(self.in_flight.load(Ordering::SeqCst));
        if free == 0 {
            return true;
        }

        let batch = match self.engine.acquire(free) {
            Ok(batch) => batch,
            Err(err) => {
                error!(error = %err, "acquisition pass failed");
                return true;
            }
        };

        {
            let mut stats = lock(&self.stats);
            stats.acquisition_passes += 1;
            stats.jobs_acquired += batch.len() as u64;
        }

        for job in batch {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            if self.jobs.send(job.id).is_err() {
                return false;
            }
        }
        true
    }
}

struct Worker<S> {
    engine: Arc<JobEngine<S>>,
    jobs: Arc<Mutex<Receiver<JobId>>>,
    in_flight: Arc<AtomicUsize>,
    signal: mpsc::Sender<Signal>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl<S: JobStore> Worker<S> {
    fn run(self) {
        loop {
            let next = lock(&self.jobs).recv();
            let Ok(job_id) = next else {
                break;
            };

            lock(&self.stats).current_running += 1;
            let result = self.engine.execute(job_id);

            {
                let mut stats = lock(&self.stats);
                stats.current_running = stats.current_running.saturating_sub(1);
                match &result {
                    Ok(ExecutionOutcome::Succeeded) => stats.jobs_succeeded += 1,
                    Ok(ExecutionOutcome::Moot) => stats.jobs_moot += 1,
                    Ok(ExecutionOutcome::Deferred) => stats.jobs_deferred += 1,
                    Err(JobError::Exhausted(_)) => {
                        stats.jobs_failed += 1;
                        stats.jobs_dead_lettered += 1;
                    }
                    Err(_) => stats.jobs_failed += 1,
                }
            }

            match result {
                Ok(_) | Err(JobError::HandlerFailure(_)) | Err(JobError::Exhausted(_)) => {}
                Err(err) => error!(job_id = %job_id, error = %err, "job dispatch failed"),
            }

            if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                debug!("worker pool drained");
                let _ = self.signal.send(Signal::Wake);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use jobforge_core::HandlerError;

    use crate::config::EngineConfig;
    use crate::jobs::{InMemoryJobStore, JobContext, JobHandler, JobQueue, JobRecord, NewJob};

    struct Counting(Arc<AtomicU32>);

    impl JobHandler for Counting {
        fn execute(&self, _: &JobRecord, _: &mut JobContext<'_>) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn boom(_: &JobRecord, _: &mut JobContext<'_>) -> Result<(), HandlerError> {
        Err(HandlerError::new("boom"))
    }

    fn wait_for(handle: &AsyncExecutorHandle, done: impl Fn(&ExecutorStats) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done(&handle.stats()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn runs_scheduled_jobs_to_completion() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = Arc::new(
            JobEngine::builder(InMemoryJobStore::arc())
                .config(
                    EngineConfig::default()
                        .with_worker_threads(2)
                        .with_queue_capacity(2)
                        .with_acquisition_interval(Duration::from_millis(10)),
                )
                .handler("deliver", Counting(calls.clone()))
                .handler("explode", boom)
                .build(),
        );
        for _ in 0..10 {
            engine.schedule(NewJob::message("deliver")).unwrap();
        }
        let failing = engine
            .schedule(NewJob::message("explode").with_retries(1))
            .unwrap();

        let handle = AsyncExecutor::spawn(engine.clone()).unwrap();
        wait_for(&handle, |s| s.jobs_succeeded == 10 && s.jobs_dead_lettered == 1);
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(stats.jobs_succeeded, 10);
        assert_eq!(stats.jobs_dead_lettered, 1);
        assert_eq!(
            engine.admin().find(failing).unwrap().unwrap().queue(),
            JobQueue::DeadLetter
        );
        assert_eq!(engine.admin().stats().unwrap().count(JobQueue::Executable), 0);
    }

    #[test]
    fn shutdown_stops_an_idle_executor() {
        let engine = Arc::new(JobEngine::builder(InMemoryJobStore::arc()).build());
        let handle = AsyncExecutor::spawn(engine).unwrap();
        handle.wake();
        handle.shutdown();
    }
}
