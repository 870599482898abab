//! Transparency module.
//!
//! Tracks what the pipeline did with the data it was given, supporting
//! user trust and consent audits.

pub mod log;

pub use log::{
    create_shared_log, create_shared_log_with_persistence, DeliveryLog, DeliveryStats,
    SharedDeliveryLog,
};
