//! Tracking record model.
//!
//! Records are what the durable queue stores and what the flush coordinator
//! uploads. Payloads are typed so timestamps survive persistence intact.

pub mod device;
pub mod types;

pub use device::{DeviceProperties, SDK_NAME};
pub use types::{
    customer_payload, event_payload, fields, payload_to_json, timestamp_from_secs, CustomerIds,
    Payload, PropertyValue, RecordId, RecordKind, TrackingRecord,
};
