//! Job lifecycle notifications and the bus that distributes them.

pub mod bus;
pub mod in_memory_bus;
pub mod job_event;

pub use bus::{BusError, EventBus, Subscription};
pub use in_memory_bus::InMemoryEventBus;
pub use job_event::{JobEvent, JobEventKind};
