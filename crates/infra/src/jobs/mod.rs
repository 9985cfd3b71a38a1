//! Job lifecycle and execution.
//!
//! ## Design
//!
//! - A job lives in exactly one of five queues (Timer, Executable, Suspended,
//!   DeadLetter, ExternalWorker); moving between them is a delete + insert in
//!   one transaction
//! - Every row write is revision-checked; losing a race is a `Conflict`
//! - Leases (`lock_owner`, `lock_expiration_time`) are never preempted, only
//!   overwritten after they expire
//! - Exclusive jobs of a process instance run one at a time behind a persisted
//!   instance lock
//!
//! ## Components
//!
//! - `JobAcquirer`: leases due jobs
//! - `JobExecutor`: dispatches one job to its handler
//! - `RetryEngine`: reschedules or dead-letters failed jobs
//! - `ExternalWorkerProtocol`: claim/complete/fail for remote workers
//! - `JobAdmin`, `JobScheduler`: operator and scheduling entry points
//! - `JobEngine`: all of the above over one store

pub mod acquisition;
pub mod admin;
pub mod context;
pub mod cycle;
pub mod engine;
pub mod exclusive;
pub mod executor;
pub mod external_worker;
pub mod handler;
pub mod postgres;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use acquisition::JobAcquirer;
pub use admin::JobAdmin;
pub use context::EngineContext;
pub use cycle::{CycleParseError, IsoDuration, RetryCycle};
pub use engine::{JobEngine, JobEngineBuilder};
pub use exclusive::{ExclusiveLocks, LockOutcome};
pub use executor::{ExecutionOutcome, JobExecutor};
pub use external_worker::{ExternalWorkerProtocol, FailureReport};
pub use handler::{
    ERROR_CONFIGURATION_PREFIX, EXTERNAL_WORKER_HANDLER, HandlerRegistry, JobContext, JobHandler,
    ProcessRuntime,
};
pub use postgres::PostgresJobStore;
pub use retry::{FailedJobCommand, RetryEngine, RetryOutcome, RetryPlan};
pub use scheduler::JobScheduler;
pub use store::{InMemoryJobStore, JobStore, JobTransaction};
pub use types::{
    AcquiredJobBatch, Correlation, Job, JobQueue, JobRecord, JobStats, JobType, NewJob,
    ProcessInstanceRecord, Variables,
};
