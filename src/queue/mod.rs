//! Durable queue contract.
//!
//! The flush pipeline only depends on [`DurableQueue`]. [`LocalQueue`] is an
//! in-process implementation with optional JSON-file persistence.

pub mod local;

pub use local::LocalQueue;

use crate::error::QueueError;
use crate::record::{CustomerIds, Payload, RecordId, TrackingRecord};

/// Natural order in which a queue returns pending records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Append-only store of pending tracking records.
///
/// Implementations must be internally consistent under concurrent calls:
/// the flush coordinator issues deletes and retry increments from parallel
/// upload completions.
pub trait DurableQueue: Send + Sync {
    /// Append an event payload.
    fn append_event(&self, payload: Payload) -> Result<RecordId, QueueError>;

    /// Append a customer update, or merge it into a compatible pending one.
    fn append_or_merge_customer(&self, payload: Payload) -> Result<RecordId, QueueError>;

    fn fetch_pending_events(&self) -> Result<Vec<TrackingRecord>, QueueError>;

    fn fetch_pending_customer_updates(&self) -> Result<Vec<TrackingRecord>, QueueError>;

    fn delete(&self, id: RecordId) -> Result<(), QueueError>;

    /// Delete `id` only if it is still at `revision`.
    ///
    /// Returns `false` and keeps the record when a merge changed it after it
    /// was fetched.
    fn delete_revision(&self, id: RecordId, revision: u32) -> Result<bool, QueueError>;

    /// Increment the retry count and return the new value.
    fn increment_retry(&self, id: RecordId) -> Result<u32, QueueError>;

    fn current_customer_ids(&self) -> Result<CustomerIds, QueueError>;

    fn fetch_order(&self) -> FetchOrder {
        FetchOrder::OldestFirst
    }

    /// Number of pending records of both kinds.
    fn pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.fetch_pending_events()?.len() + self.fetch_pending_customer_updates()?.len())
    }
}
