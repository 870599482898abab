//! Flushing: deciding when to drain the durable queue, and draining it.
//!
//! [`FlushCoordinator`] performs single-flight flush attempts.
//! [`FlushScheduler`] owns the trigger for the active [`FlushingMode`].

pub mod coordinator;
pub mod mode;
pub mod scheduler;

pub use coordinator::{FlushCoordinator, FlushReport, FlushStatus};
pub use mode::FlushingMode;
pub use scheduler::FlushScheduler;
