//! In-process durable queue with optional JSON persistence.

use crate::error::QueueError;
use crate::queue::{DurableQueue, FetchOrder};
use crate::record::{fields, CustomerIds, Payload, PropertyValue, RecordId, RecordKind, TrackingRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Serialized queue contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueState {
    next_id: u64,
    records: Vec<TrackingRecord>,
    customer_ids: CustomerIds,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            next_id: 1,
            records: Vec::new(),
            customer_ids: CustomerIds::with_cookie(),
        }
    }
}

impl QueueState {
    fn push(&mut self, kind: RecordKind, payload: Payload) -> RecordId {
        let id = RecordId(self.next_id);
        self.next_id += 1;
        self.records.push(TrackingRecord {
            id,
            kind,
            payload,
            retry_count: 0,
            revision: 0,
            created_at: Utc::now(),
        });
        id
    }

    fn pending(&self, kind: RecordKind, order: FetchOrder) -> Vec<TrackingRecord> {
        let mut records: Vec<TrackingRecord> = self
            .records
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        if order == FetchOrder::NewestFirst {
            records.reverse();
        }
        records
    }

    fn find_mut(&mut self, id: RecordId) -> Result<&mut TrackingRecord, QueueError> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(QueueError::NotFound(id.0))
    }
}

/// Thread-safe queue kept in memory and optionally mirrored to a JSON file.
///
/// With persistence, every mutation is written to disk before it becomes
/// visible; a failed write leaves the in-memory state unchanged.
#[derive(Debug)]
pub struct LocalQueue {
    state: Mutex<QueueState>,
    persist_path: Option<PathBuf>,
    fetch_order: FetchOrder,
}

impl LocalQueue {
    /// Create an empty in-memory queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            persist_path: None,
            fetch_order: FetchOrder::OldestFirst,
        }
    }

    /// Open a queue backed by `path`, loading existing records.
    pub fn with_persistence(path: PathBuf) -> Result<Self, QueueError> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| QueueError::Storage {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&content)?
        } else {
            QueueState::default()
        };

        Ok(Self {
            state: Mutex::new(state),
            persist_path: Some(path),
            fetch_order: FetchOrder::OldestFirst,
        })
    }

    /// Return pending records in the given natural order.
    pub fn with_fetch_order(mut self, order: FetchOrder) -> Self {
        self.fetch_order = order;
        self
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    /// Apply a mutation, persisting it first when a path is configured.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut QueueState) -> Result<R, QueueError>,
    ) -> Result<R, QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;

        match self.persist_path {
            None => f(&mut state),
            Some(ref path) => {
                let mut next = state.clone();
                let result = f(&mut next)?;
                write_state(path, &next)?;
                *state = next;
                Ok(result)
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&QueueState) -> R) -> Result<R, QueueError> {
        let state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(f(&state))
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Write via a temporary file and rename so a crash never leaves a torn file.
fn write_state(path: &Path, state: &QueueState) -> Result<(), QueueError> {
    let storage_err = |source| QueueError::Storage {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(storage_err)?;
    }

    let json = serde_json::to_string(state)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json).map_err(storage_err)?;
    std::fs::rename(&tmp, path).map_err(storage_err)?;
    Ok(())
}

fn ids_of(payload: &Payload) -> Result<CustomerIds, QueueError> {
    payload
        .get(fields::IDS)
        .and_then(PropertyValue::as_object)
        .map(CustomerIds::from_payload)
        .ok_or_else(|| QueueError::InvalidPayload("customer update without ids".to_string()))
}

/// Merge `incoming` into `existing`: ids and properties are unioned, new values win.
fn merge_customer_payload(existing: &mut Payload, incoming: &Payload) {
    for key in [fields::IDS, fields::PROPERTIES] {
        let Some(PropertyValue::Object(new_values)) = incoming.get(key) else {
            continue;
        };
        match existing.get_mut(key) {
            Some(PropertyValue::Object(current)) => {
                for (k, v) in new_values {
                    current.insert(k.clone(), v.clone());
                }
            }
            _ => {
                existing.insert(key.to_string(), PropertyValue::Object(new_values.clone()));
            }
        }
    }
}

impl DurableQueue for LocalQueue {
    fn append_event(&self, payload: Payload) -> Result<RecordId, QueueError> {
        self.mutate(|state| Ok(state.push(RecordKind::Event, payload)))
    }

    fn append_or_merge_customer(&self, payload: Payload) -> Result<RecordId, QueueError> {
        let ids = ids_of(&payload)?;
        let token = payload
            .get(fields::PROJECT_TOKEN)
            .and_then(PropertyValue::as_str)
            .map(str::to_string);

        self.mutate(|state| {
            state.customer_ids.merge(&ids);

            // Only untouched updates for the same destination are merged;
            // one that already failed keeps its own retry history.
            let candidate = state.records.iter_mut().rev().find(|r| {
                r.kind == RecordKind::CustomerUpdate
                    && r.retry_count == 0
                    && r.project_token().map(str::to_string) == token
            });

            match candidate {
                Some(record) => {
                    merge_customer_payload(&mut record.payload, &payload);
                    record.revision += 1;
                    Ok(record.id)
                }
                None => Ok(state.push(RecordKind::CustomerUpdate, payload)),
            }
        })
    }

    fn fetch_pending_events(&self) -> Result<Vec<TrackingRecord>, QueueError> {
        self.read(|state| state.pending(RecordKind::Event, self.fetch_order))
    }

    fn fetch_pending_customer_updates(&self) -> Result<Vec<TrackingRecord>, QueueError> {
        self.read(|state| state.pending(RecordKind::CustomerUpdate, self.fetch_order))
    }

    fn delete(&self, id: RecordId) -> Result<(), QueueError> {
        self.mutate(|state| {
            let before = state.records.len();
            state.records.retain(|r| r.id != id);
            if state.records.len() == before {
                return Err(QueueError::NotFound(id.0));
            }
            Ok(())
        })
    }

    fn delete_revision(&self, id: RecordId, revision: u32) -> Result<bool, QueueError> {
        self.mutate(|state| {
            let record = state.find_mut(id)?;
            if record.revision != revision {
                return Ok(false);
            }
            state.records.retain(|r| r.id != id);
            Ok(true)
        })
    }

    fn increment_retry(&self, id: RecordId) -> Result<u32, QueueError> {
        self.mutate(|state| {
            let record = state.find_mut(id)?;
            record.retry_count += 1;
            Ok(record.retry_count)
        })
    }

    fn current_customer_ids(&self) -> Result<CustomerIds, QueueError> {
        self.read(|state| state.customer_ids.clone())
    }

    fn fetch_order(&self) -> FetchOrder {
        self.fetch_order
    }

    fn pending_count(&self) -> Result<usize, QueueError> {
        self.read(|state| state.records.len())
    }
}
