//! Outbound side: the serialized reply queue and the executor that drives the surface.

pub mod executor;
pub mod queue;

pub use executor::SurfaceExecutor;
pub use queue::{Delivery, Outbound, QueueStats, ReplyQueue, TaskExecutor, TaskOutcome};
