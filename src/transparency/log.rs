//! Delivery log.
//!
//! Counts what the pipeline queued, suppressed, uploaded, retried and
//! evicted, so a host can show users exactly what left the device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Delivery counters for the current process, optionally persisted.
#[derive(Debug)]
pub struct DeliveryLog {
    /// Events appended to the queue
    events_queued: AtomicU64,
    /// Customer updates appended or merged
    customers_queued: AtomicU64,
    /// Events dropped by the consent gate
    suppressed_by_consent: AtomicU64,
    /// Records uploaded and deleted
    uploaded: AtomicU64,
    /// Records rejected and kept for another attempt
    rejected: AtomicU64,
    /// Records deleted after reaching the retry limit
    evicted: AtomicU64,
    /// Records left untouched after a connectivity failure
    deferred: AtomicU64,
    flushes_completed: AtomicU64,
    flushes_skipped: AtomicU64,
    flushes_offline: AtomicU64,
    started_at: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self {
            events_queued: AtomicU64::new(0),
            customers_queued: AtomicU64::new(0),
            suppressed_by_consent: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            flushes_completed: AtomicU64::new(0),
            flushes_skipped: AtomicU64::new(0),
            flushes_offline: AtomicU64::new(0),
            started_at: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a delivery log that continues from previously saved counters.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!(error = %e, "could not load previous delivery stats");
        }

        log
    }

    pub fn record_event_queued(&self) {
        self.events_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_customer_queued(&self) {
        self.customers_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed(&self) {
        self.suppressed_by_consent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uploaded(&self, count: u64) {
        self.uploaded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, count: u64) {
        self.rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: u64) {
        self.evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_deferred(&self, count: u64) {
        self.deferred.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_flush_completed(&self) {
        self.flushes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_skipped(&self) {
        self.flushes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_offline(&self) {
        self.flushes_offline.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            events_queued: self.events_queued.load(Ordering::Relaxed),
            customers_queued: self.customers_queued.load(Ordering::Relaxed),
            suppressed_by_consent: self.suppressed_by_consent.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            flushes_completed: self.flushes_completed.load(Ordering::Relaxed),
            flushes_skipped: self.flushes_skipped.load(Ordering::Relaxed),
            flushes_offline: self.flushes_offline.load(Ordering::Relaxed),
            started_at: self.started_at,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Delivery Statistics:\n\
             - Events queued: {}\n\
             - Customer updates queued: {}\n\
             - Suppressed (no consent): {}\n\
             - Uploaded: {}\n\
             - Rejected, kept for retry: {}\n\
             - Evicted after retry limit: {}\n\
             - Deferred (offline): {}\n\
             - Flushes: {} completed, {} skipped, {} offline",
            stats.events_queued,
            stats.customers_queued,
            stats.suppressed_by_consent,
            stats.uploaded,
            stats.rejected,
            stats.evicted,
            stats.deferred,
            stats.flushes_completed,
            stats.flushes_skipped,
            stats.flushes_offline
        )
    }

    /// Save counters to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let persisted = PersistedStats {
                stats: self.stats(),
                last_updated: Utc::now(),
            };
            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;
                let s = persisted.stats;

                self.events_queued.store(s.events_queued, Ordering::Relaxed);
                self.customers_queued
                    .store(s.customers_queued, Ordering::Relaxed);
                self.suppressed_by_consent
                    .store(s.suppressed_by_consent, Ordering::Relaxed);
                self.uploaded.store(s.uploaded, Ordering::Relaxed);
                self.rejected.store(s.rejected, Ordering::Relaxed);
                self.evicted.store(s.evicted, Ordering::Relaxed);
                self.deferred.store(s.deferred, Ordering::Relaxed);
                self.flushes_completed
                    .store(s.flushes_completed, Ordering::Relaxed);
                self.flushes_skipped
                    .store(s.flushes_skipped, Ordering::Relaxed);
                self.flushes_offline
                    .store(s.flushes_offline, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Reset all counters.
    pub fn reset(&self) {
        for counter in [
            &self.events_queued,
            &self.customers_queued,
            &self.suppressed_by_consent,
            &self.uploaded,
            &self.rejected,
            &self.evicted,
            &self.deferred,
            &self.flushes_completed,
            &self.flushes_skipped,
            &self.flushes_offline,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of delivery counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub events_queued: u64,
    pub customers_queued: u64,
    pub suppressed_by_consent: u64,
    pub uploaded: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub deferred: u64,
    pub flushes_completed: u64,
    pub flushes_skipped: u64,
    pub flushes_offline: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    stats: DeliveryStats,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared delivery log.
pub type SharedDeliveryLog = Arc<DeliveryLog>;

pub fn create_shared_log() -> SharedDeliveryLog {
    Arc::new(DeliveryLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedDeliveryLog {
    Arc::new(DeliveryLog::with_persistence(path))
}
