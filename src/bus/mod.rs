//! Partitioned event bus: per-key ordered queues, backpressure, retry, DLQ.

pub mod bus;
pub mod event;

pub use bus::{EventHandler, FailedEvent, HandlerId, PartitionedEventBus};
pub use event::{ancestors, BusEvent, EventKind};
