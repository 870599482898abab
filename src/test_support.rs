//! Test doubles shared by unit tests.

use crate::record::{CustomerIds, Payload, PropertyValue};
use crate::record::fields;
use crate::transport::{UploadOutcome, UploadTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Transport answering from a script keyed by `event_type`.
///
/// Customer updates are keyed as `"customer"`. When gated, every upload
/// waits for a permit before answering.
pub struct ScriptedTransport {
    default: Mutex<UploadOutcome>,
    by_key: Mutex<HashMap<String, UploadOutcome>>,
    uploads: Mutex<Vec<String>>,
    sent_ids: Mutex<Vec<CustomerIds>>,
    in_flight: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedTransport {
    pub fn new(default: UploadOutcome) -> Self {
        Self {
            default: Mutex::new(default),
            by_key: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            sent_ids: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn gated(default: UploadOutcome) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut transport = Self::new(default);
        transport.gate = Some(gate.clone());
        (transport, gate)
    }

    pub fn script(&self, key: &str, outcome: UploadOutcome) {
        self.by_key.lock().unwrap().insert(key.to_string(), outcome);
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    /// Identity snapshot passed with each upload, in call order.
    pub fn sent_ids(&self) -> Vec<CustomerIds> {
        self.sent_ids.lock().unwrap().clone()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn answer(&self, key: String, ids: &CustomerIds) -> UploadOutcome {
        self.uploads.lock().unwrap().push(key.clone());
        self.sent_ids.lock().unwrap().push(ids.clone());
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Some(ref gate) = self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.by_key.lock().unwrap().get(&key).cloned();
        scripted.unwrap_or_else(|| self.default.lock().unwrap().clone())
    }
}

#[async_trait]
impl UploadTransport for ScriptedTransport {
    async fn upload_customer(&self, _payload: &Payload, ids: &CustomerIds) -> UploadOutcome {
        self.answer("customer".to_string(), ids).await
    }

    async fn upload_event(&self, payload: &Payload, ids: &CustomerIds) -> UploadOutcome {
        let key = payload
            .get(fields::EVENT_TYPE)
            .and_then(PropertyValue::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.answer(key, ids).await
    }
}
