//! Background threads driving the engine.

pub mod async_executor;
pub mod event_worker;

pub use async_executor::{AsyncExecutor, AsyncExecutorHandle, ExecutorStats};
pub use event_worker::{EventWorker, EventWorkerHandle, EventWorkerStats, JobEventFilter};
