//! Single-flight flush coordinator.
//!
//! One flush uploads every queued record concurrently, waits for all of them,
//! and applies the retry/eviction policy to each outcome.

use crate::error::{QueueError, TrackingError};
use crate::queue::{DurableQueue, FetchOrder};
use crate::record::{CustomerIds, RecordKind, TrackingRecord};
use crate::transparency::SharedDeliveryLog;
use crate::transport::{ConnectivityProbe, FailureClass, UploadOutcome, UploadTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};

/// How a flush attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Another flush held the single-flight flag; nothing was uploaded.
    AlreadyInProgress,
    /// The host was unreachable; the queue is untouched.
    Offline,
    /// The queue could not be read; the queue is untouched.
    QueueUnavailable,
    /// Nothing was queued.
    Empty,
    /// Every dispatched upload returned an outcome.
    Completed,
}

/// Summary passed to flush completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub status: FlushStatus,
    pub dispatched: usize,
    pub uploaded: usize,
    pub rejected: usize,
    pub evicted: usize,
    pub deferred: usize,
}

impl FlushReport {
    fn new(status: FlushStatus) -> Self {
        Self {
            status,
            dispatched: 0,
            uploaded: 0,
            rejected: 0,
            evicted: 0,
            deferred: 0,
        }
    }

    /// Map a flush that delivered nothing, or had uploads rejected, to an error.
    ///
    /// `AlreadyInProgress` and `Empty` are not failures.
    pub fn into_result(self) -> Result<FlushReport, TrackingError> {
        match self.status {
            FlushStatus::Offline => Err(TrackingError::ConnectivityUnavailable),
            FlushStatus::QueueUnavailable => Err(QueueError::Unreadable.into()),
            FlushStatus::Completed if self.rejected + self.evicted > 0 => {
                Err(TrackingError::UploadRejected(format!(
                    "{} of {} records rejected ({} evicted)",
                    self.rejected + self.evicted,
                    self.dispatched,
                    self.evicted
                )))
            }
            _ => Ok(self),
        }
    }

    fn tally(&mut self, result: RecordResult) {
        match result {
            RecordResult::Uploaded => self.uploaded += 1,
            RecordResult::Rejected => self.rejected += 1,
            RecordResult::Evicted => self.evicted += 1,
            RecordResult::Deferred => self.deferred += 1,
        }
    }
}

/// Per-record effect of the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordResult {
    Uploaded,
    Rejected,
    Evicted,
    Deferred,
}

/// Releases the single-flight flag on drop, whatever path the flush took.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct CoordinatorInner {
    queue: Arc<dyn DurableQueue>,
    transport: Arc<dyn UploadTransport>,
    connectivity: Arc<dyn ConnectivityProbe>,
    log: SharedDeliveryLog,
    max_retries: u32,
    flushing: AtomicBool,
}

/// Drains the durable queue through the upload transport, one flush at a time.
#[derive(Clone)]
pub struct FlushCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl FlushCoordinator {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        transport: Arc<dyn UploadTransport>,
        connectivity: Arc<dyn ConnectivityProbe>,
        log: SharedDeliveryLog,
        max_retries: u32,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                queue,
                transport,
                connectivity,
                log,
                max_retries: max_retries.max(1),
                flushing: AtomicBool::new(false),
            }),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.max_retries
    }

    /// Whether a flush currently holds the single-flight flag.
    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
    }

    /// Run one flush attempt. Never fails; per-record problems are logged.
    pub async fn request_flush(&self) -> FlushReport {
        let inner = &self.inner;
        let Some(_guard) = inner.try_acquire() else {
            tracing::warn!("flush already in progress; skipping");
            inner.log.record_flush_skipped();
            return FlushReport::new(FlushStatus::AlreadyInProgress);
        };

        if !inner.connectivity.is_connected().await {
            tracing::info!("collection host unreachable; flush postponed");
            inner.log.record_flush_offline();
            return FlushReport::new(FlushStatus::Offline);
        }

        let (records, ids) = match inner.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "could not read pending records");
                return FlushReport::new(FlushStatus::QueueUnavailable);
            }
        };

        if records.is_empty() {
            tracing::debug!("nothing to flush");
            return FlushReport::new(FlushStatus::Empty);
        }

        let mut report = FlushReport::new(FlushStatus::Completed);
        report.dispatched = records.len();
        tracing::debug!(records = records.len(), "flushing");

        let ids = Arc::new(ids);
        let mut uploads = JoinSet::new();
        for record in records {
            let inner = Arc::clone(inner);
            let ids = Arc::clone(&ids);
            uploads.spawn(async move { inner.deliver(record, &ids).await });
        }

        while let Some(joined) = uploads.join_next().await {
            match joined {
                Ok(result) => report.tally(result),
                Err(e) => {
                    // The record stays queued untouched.
                    tracing::error!(error = %e, "upload task failed");
                    report.tally(RecordResult::Deferred);
                }
            }
        }

        inner.log.record_uploaded(report.uploaded as u64);
        inner.log.record_rejected(report.rejected as u64);
        inner.log.record_evicted(report.evicted as u64);
        inner.log.record_deferred(report.deferred as u64);
        inner.log.record_flush_completed();

        tracing::info!(
            dispatched = report.dispatched,
            uploaded = report.uploaded,
            rejected = report.rejected,
            evicted = report.evicted,
            deferred = report.deferred,
            "flush complete"
        );
        report
    }

    /// Spawn a flush and call `completion` exactly once with its report.
    pub fn request_flush_with<F>(&self, completion: F) -> JoinHandle<()>
    where
        F: FnOnce(FlushReport) + Send + 'static,
    {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let report = coordinator.request_flush().await;
            completion(report);
        })
    }
}

impl CoordinatorInner {
    fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(&self.flushing))
    }

    /// Pending records oldest-first, customers before events, plus the identity snapshot.
    fn snapshot(&self) -> Result<(Vec<TrackingRecord>, CustomerIds), QueueError> {
        let mut records = self.queue.fetch_pending_customer_updates()?;
        let mut events = self.queue.fetch_pending_events()?;
        if self.queue.fetch_order() == FetchOrder::NewestFirst {
            records.reverse();
            events.reverse();
        }
        records.append(&mut events);

        let ids = self.queue.current_customer_ids()?;
        Ok((records, ids))
    }

    async fn deliver(&self, record: TrackingRecord, ids: &CustomerIds) -> RecordResult {
        let outcome = match record.kind {
            RecordKind::CustomerUpdate => self.transport.upload_customer(&record.payload, ids).await,
            RecordKind::Event => self.transport.upload_event(&record.payload, ids).await,
        };
        self.apply_outcome(&record, outcome)
    }

    fn apply_outcome(&self, record: &TrackingRecord, outcome: UploadOutcome) -> RecordResult {
        match outcome {
            UploadOutcome::Success => {
                match self.queue.delete_revision(record.id, record.revision) {
                    Ok(true) => {}
                    Ok(false) => {
                        // Merged into while uploading; the merged values still need delivery.
                        tracing::debug!(record = %record.id, "record changed during upload; kept");
                    }
                    Err(e) => {
                        tracing::warn!(record = %record.id, error = %e, "uploaded record could not be deleted");
                    }
                }
                RecordResult::Uploaded
            }
            UploadOutcome::Failure {
                class: FailureClass::ConnectivityOrServerUnavailable,
                detail,
            } => {
                tracing::debug!(record = %record.id, %detail, "upload deferred");
                RecordResult::Deferred
            }
            UploadOutcome::Failure {
                class: FailureClass::Rejected,
                detail,
            } => match self.queue.increment_retry(record.id) {
                Ok(retries) if retries >= self.max_retries => {
                    if let Err(e) = self.queue.delete(record.id) {
                        tracing::warn!(record = %record.id, error = %e, "could not evict record");
                    }
                    tracing::warn!(
                        record = %record.id,
                        retries,
                        %detail,
                        "record evicted after retry limit"
                    );
                    RecordResult::Evicted
                }
                Ok(retries) => {
                    tracing::info!(record = %record.id, retries, %detail, "upload rejected");
                    RecordResult::Rejected
                }
                Err(e) => {
                    tracing::warn!(record = %record.id, error = %e, "could not record retry");
                    RecordResult::Rejected
                }
            },
        }
    }
}
