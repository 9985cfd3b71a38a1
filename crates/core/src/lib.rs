//! `jobforge-core`: foundation building blocks for the job engine.
//!
//! Identifiers, the error taxonomy and the clock abstraction. No storage or IO.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{HandlerError, JobError, JobResult};
pub use id::{ExecutionId, JobId, ProcessInstanceId, TenantId};
