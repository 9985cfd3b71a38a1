//! Job notification publishing/subscription abstraction (mechanics only).
//!
//! The engine publishes a [`JobEvent`](crate::JobEvent) **after** the transaction
//! that caused it has committed. The bus is for distribution, not storage: the job
//! store stays the source of truth, and a lost notification never changes a job's
//! lifecycle.
//!
//! ## Delivery
//!
//! - **At-least-once acceptable**: consumers must tolerate duplicates
//! - **No ordering guarantees** across publishers
//! - **Best-effort**: publish failures are logged by the engine, not propagated

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

/// A subscription to a notification stream.
///
/// Each subscription gets a copy of every message published after it was created
/// (broadcast semantics). Subscriptions are meant to be drained by one thread.
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => observe(event),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Bus failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
    /// Transport failure (for out-of-process buses).
    #[error("event bus transport failed: {0}")]
    Transport(String),
}

/// Transport-agnostic pub/sub abstraction.
///
/// The error type is fixed so that engines can hold an `Arc<dyn EventBus<M>>`.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
