//! Host-facing tracker.
//!
//! [`Tracker`] wires the consent gate, the session state machine, the
//! durable queue and the flush scheduler together. Hosts call `track*`,
//! `identify_customer` and `handle_lifecycle`; everything else happens on
//! the tokio runtime the tracker was built with.

use crate::config::Config;
use crate::consent::{self, ConsentDecision, EventKind};
use crate::error::TrackingError;
use crate::flush::{FlushCoordinator, FlushReport, FlushScheduler, FlushStatus, FlushingMode};
use crate::lifecycle::{LifecycleBus, LifecycleSignal};
use crate::queue::{DurableQueue, LocalQueue};
use crate::record::{
    customer_payload, event_payload, fields, timestamp_from_secs, CustomerIds, DeviceProperties,
    Payload, PropertyValue, RecordId,
};
use crate::session::{
    SessionEvent, SessionEventKind, SessionSink, SessionState, SessionStateMachine,
};
use crate::transparency::{create_shared_log, create_shared_log_with_persistence, SharedDeliveryLog};
use crate::transport::{ConnectivityProbe, StaticConnectivity, TcpProbe, UploadTransport};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Result of a consent-gated track call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    Queued(RecordId),
    /// Consent was required and missing; nothing was persisted.
    Suppressed,
}

/// Poll interval while waiting for a running flush to finish.
const FLUSH_WAIT: Duration = Duration::from_millis(20);

/// Current time as fractional epoch seconds.
pub fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Builder for [`Tracker`].
pub struct TrackerBuilder {
    config: Config,
    queue: Option<Arc<dyn DurableQueue>>,
    transport: Option<Arc<dyn UploadTransport>>,
    connectivity: Option<Arc<dyn ConnectivityProbe>>,
    log: Option<SharedDeliveryLog>,
    device: Option<DeviceProperties>,
    runtime: Option<Handle>,
    persistent: bool,
}

impl TrackerBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            queue: None,
            transport: None,
            connectivity: None,
            log: None,
            device: None,
            runtime: None,
            persistent: false,
        }
    }

    pub fn queue(mut self, queue: Arc<dyn DurableQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn UploadTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn connectivity(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity = Some(probe);
        self
    }

    pub fn delivery_log(mut self, log: SharedDeliveryLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn device(mut self, device: DeviceProperties) -> Self {
        self.device = Some(device);
        self
    }

    /// Runtime that runs flushes and triggers. Defaults to the current one.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Keep queue, session state, delivery counters and the install marker
    /// under `config.data_path`.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn build(self) -> Result<Tracker, TrackingError> {
        let config = self.config;
        config.validate()?;

        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| TrackingError::Runtime(e.to_string()))?,
        };

        if self.persistent {
            config.ensure_directories()?;
        }

        let queue: Arc<dyn DurableQueue> = match self.queue {
            Some(queue) => queue,
            None if self.persistent => Arc::new(LocalQueue::with_persistence(config.queue_path())?),
            None => Arc::new(LocalQueue::new()),
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&config)?,
        };

        let connectivity: Arc<dyn ConnectivityProbe> = match self.connectivity {
            Some(probe) => probe,
            None => match TcpProbe::from_base_url(&config.base_url, config.upload_timeout) {
                Some(probe) => Arc::new(probe),
                None => {
                    tracing::warn!(base_url = %config.base_url, "no host to probe; assuming online");
                    Arc::new(StaticConnectivity::default())
                }
            },
        };

        let log = match self.log {
            Some(log) => log,
            None if self.persistent => create_shared_log_with_persistence(config.delivery_log_path()),
            None => create_shared_log(),
        };

        let session = if self.persistent {
            SessionStateMachine::with_persistence(config.session_timeout_secs, config.session_path())
        } else {
            SessionStateMachine::new(config.session_timeout_secs)
        };

        let coordinator = FlushCoordinator::new(
            queue.clone(),
            transport,
            connectivity,
            log.clone(),
            config.max_retries,
        );
        let bus = LifecycleBus::new();
        let scheduler = FlushScheduler::new(coordinator.clone(), bus.clone(), runtime);
        scheduler.set_mode(config.flushing_mode);

        let install_marker = self.persistent.then(|| config.install_marker_path());

        Ok(Tracker {
            default_properties: config.default_payload(),
            config,
            queue,
            coordinator,
            scheduler,
            bus,
            session: Mutex::new(session),
            log,
            device: self.device.unwrap_or_else(DeviceProperties::detect),
            install_marker,
            installed: AtomicBool::new(false),
        })
    }
}

#[cfg(feature = "http")]
fn default_transport(config: &Config) -> Result<Arc<dyn UploadTransport>, TrackingError> {
    use crate::transport::{HttpTransport, TransportConfig};

    let mut transport_config =
        TransportConfig::new(config.base_url.clone()).with_timeout(config.upload_timeout);
    if let Some(ref token) = config.auth_token {
        transport_config = transport_config.with_auth_token(token.clone());
    }
    Ok(Arc::new(HttpTransport::new(transport_config)?))
}

#[cfg(not(feature = "http"))]
fn default_transport(_config: &Config) -> Result<Arc<dyn UploadTransport>, TrackingError> {
    Err(crate::config::ConfigError::InvalidValue {
        key: "transport".to_string(),
        message: "built without the `http` feature; supply a transport".to_string(),
    }
    .into())
}

/// Offline-first event tracker.
pub struct Tracker {
    config: Config,
    default_properties: Payload,
    queue: Arc<dyn DurableQueue>,
    coordinator: FlushCoordinator,
    scheduler: FlushScheduler,
    bus: LifecycleBus,
    session: Mutex<SessionStateMachine>,
    log: SharedDeliveryLog,
    device: DeviceProperties,
    install_marker: Option<PathBuf>,
    installed: AtomicBool,
}

impl Tracker {
    pub fn builder(config: Config) -> TrackerBuilder {
        TrackerBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Queue a custom event timestamped now.
    pub fn track(&self, event_type: &str, properties: Payload) -> Result<RecordId, TrackingError> {
        self.track_at(event_type, properties, Utc::now())
    }

    pub fn track_at(
        &self,
        event_type: &str,
        properties: Payload,
        timestamp: DateTime<Utc>,
    ) -> Result<RecordId, TrackingError> {
        let token = self.project_token(event_type)?;
        self.queue_event(token, event_type, properties, timestamp)
    }

    /// Queue an event that may be subject to consent.
    ///
    /// Denied events are counted and dropped before they reach the queue.
    pub fn track_gated(
        &self,
        kind: EventKind,
        mut properties: Payload,
        consider_consent: bool,
        has_consent: bool,
        forced_override: Option<&str>,
    ) -> Result<TrackOutcome, TrackingError> {
        let token = self.project_token(kind.event_type())?;

        let decision = consent::is_allowed(&kind, consider_consent, has_consent, forced_override);
        if decision == ConsentDecision::Denied {
            tracing::debug!(event_type = kind.event_type(), "event suppressed: no consent");
            self.log.record_suppressed();
            return Ok(TrackOutcome::Suppressed);
        }

        consent::annotate(&kind, decision, &mut properties);
        self.queue_event(token, kind.event_type(), properties, Utc::now())
            .map(TrackOutcome::Queued)
    }

    /// Queue a push or in-app message interaction.
    ///
    /// Consent is always considered; a force-tracking marker on `action_url`
    /// overrides missing consent.
    pub fn track_campaign(
        &self,
        kind: EventKind,
        properties: Payload,
        has_consent: bool,
        action_url: Option<&str>,
    ) -> Result<TrackOutcome, TrackingError> {
        let forced = action_url.and_then(consent::forced_override_from_url);
        self.track_gated(kind, properties, true, has_consent, forced.as_deref())
    }

    pub fn track_payment(&self, properties: Payload) -> Result<RecordId, TrackingError> {
        let token = self.project_token(EventKind::Payment.event_type())?;
        self.queue_event(token, EventKind::Payment.event_type(), properties, Utc::now())
    }

    /// Queue a customer update. Pending updates to the same project are merged.
    pub fn identify_customer(
        &self,
        ids: CustomerIds,
        properties: Payload,
    ) -> Result<RecordId, TrackingError> {
        let token = self
            .config
            .project_token
            .as_deref()
            .ok_or_else(|| TrackingError::ConfigurationMissing {
                event_type: "customer".to_string(),
            })?;

        let id = self
            .queue
            .append_or_merge_customer(customer_payload(token, &ids, properties))?;
        self.log.record_customer_queued();
        tracing::debug!(record = %id, "customer update queued");
        self.scheduler.notify_tracked();
        Ok(id)
    }

    /// Queue the `installation` event once per data directory.
    ///
    /// Returns `None` when it was already tracked.
    pub fn track_install(&self) -> Result<Option<RecordId>, TrackingError> {
        if self.installed.load(Ordering::Acquire) {
            return Ok(None);
        }
        if let Some(ref marker) = self.install_marker {
            if marker.exists() {
                self.installed.store(true, Ordering::Release);
                return Ok(None);
            }
        }

        let event_type = EventKind::Install.event_type();
        let token = self.project_token(event_type)?;
        let id = self.queue_event(token, event_type, self.device.to_payload(), Utc::now())?;
        self.installed.store(true, Ordering::Release);

        if let Some(ref marker) = self.install_marker {
            if let Err(e) = std::fs::write(marker, Utc::now().to_rfc3339()) {
                tracing::warn!(path = %marker.display(), error = %e, "could not write install marker");
            }
        }
        Ok(Some(id))
    }

    /// Deliver a lifecycle signal at the current time.
    pub fn handle_lifecycle(&self, signal: LifecycleSignal) -> Vec<SessionEvent> {
        self.handle_lifecycle_at(signal, now_secs())
    }

    /// Deliver a lifecycle signal observed at `now` (epoch seconds).
    ///
    /// Session records are queued first, then the signal is published to
    /// flush triggers.
    pub fn handle_lifecycle_at(&self, signal: LifecycleSignal, now: f64) -> Vec<SessionEvent> {
        let emitted = if self.config.automatic_session_tracking {
            self.session_machine().handle(signal, now, self)
        } else {
            Vec::new()
        };
        self.bus.publish(signal);
        emitted
    }

    /// Manually open a session, closing any open one.
    pub fn start_session(&self) -> Vec<SessionEvent> {
        self.start_session_at(now_secs())
    }

    pub fn start_session_at(&self, now: f64) -> Vec<SessionEvent> {
        self.session_machine().start_session(now, self)
    }

    /// Manually close the open session.
    pub fn end_session(&self) -> Vec<SessionEvent> {
        self.end_session_at(now_secs())
    }

    pub fn end_session_at(&self, now: f64) -> Vec<SessionEvent> {
        self.session_machine().end_session(now, self)
    }

    pub fn session_state(&self) -> SessionState {
        self.session_machine().state()
    }

    pub fn set_flushing_mode(&self, mode: FlushingMode) {
        self.scheduler.set_mode(mode);
    }

    pub fn flushing_mode(&self) -> FlushingMode {
        self.scheduler.mode()
    }

    pub async fn request_flush(&self) -> FlushReport {
        self.coordinator.request_flush().await
    }

    /// Spawn a flush and call `completion` exactly once with its report.
    pub fn request_flush_with<F>(&self, completion: F) -> JoinHandle<()>
    where
        F: FnOnce(FlushReport) + Send + 'static,
    {
        self.coordinator.request_flush_with(completion)
    }

    pub fn is_flushing(&self) -> bool {
        self.coordinator.is_flushing()
    }

    /// Flush after any running flush has finished.
    ///
    /// Retries while another flush holds the single-flight flag, so the
    /// report is never `AlreadyInProgress`. Await this before dropping the
    /// runtime so no upload is cancelled between acceptance and deletion.
    pub async fn flush_when_idle(&self) -> FlushReport {
        loop {
            let report = self.coordinator.request_flush().await;
            if report.status != FlushStatus::AlreadyInProgress {
                return report;
            }
            tokio::time::sleep(FLUSH_WAIT).await;
        }
    }

    pub fn pending_count(&self) -> Result<usize, TrackingError> {
        Ok(self.queue.pending_count()?)
    }

    pub fn current_customer_ids(&self) -> Result<CustomerIds, TrackingError> {
        Ok(self.queue.current_customer_ids()?)
    }

    pub fn delivery_log(&self) -> &SharedDeliveryLog {
        &self.log
    }

    pub fn lifecycle_bus(&self) -> &LifecycleBus {
        &self.bus
    }

    /// Stop flush triggers and persist delivery counters.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        if let Err(e) = self.log.save() {
            tracing::warn!(error = %e, "could not save delivery stats");
        }
    }

    fn project_token(&self, event_type: &str) -> Result<&str, TrackingError> {
        self.config
            .project_token
            .as_deref()
            .ok_or_else(|| TrackingError::ConfigurationMissing {
                event_type: event_type.to_string(),
            })
    }

    fn session_machine(&self) -> MutexGuard<'_, SessionStateMachine> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_event(
        &self,
        token: &str,
        event_type: &str,
        properties: Payload,
        timestamp: DateTime<Utc>,
    ) -> Result<RecordId, TrackingError> {
        // Event-supplied values win over defaults.
        let mut merged = self.default_properties.clone();
        merged.extend(properties);

        let id = self
            .queue
            .append_event(event_payload(token, event_type, timestamp, merged))?;
        self.log.record_event_queued();
        tracing::debug!(record = %id, event_type, "event queued");
        self.scheduler.notify_tracked();
        Ok(id)
    }
}

impl SessionSink for Tracker {
    fn append_session_event(&self, event: &SessionEvent) -> Result<(), TrackingError> {
        let kind = match event.kind {
            SessionEventKind::Start => EventKind::SessionStart,
            SessionEventKind::End => EventKind::SessionEnd,
        };
        let token = self.project_token(kind.event_type())?;

        let mut properties = self.device.to_payload();
        if let Some(duration) = event.duration {
            properties.insert(fields::DURATION.to_string(), PropertyValue::Number(duration));
        }
        self.queue_event(
            token,
            kind.event_type(),
            properties,
            timestamp_from_secs(event.timestamp),
        )
        .map(|_| ())
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Err(e) = self.log.save() {
            tracing::warn!(error = %e, "could not save delivery stats");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flush::FlushStatus;
    use crate::record::RecordKind;
    use crate::test_support::ScriptedTransport;
    use crate::transport::UploadOutcome;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config() -> Config {
        Config {
            project_token: Some("tok".to_string()),
            flushing_mode: FlushingMode::Manual,
            session_timeout_secs: 60.0,
            ..Config::default()
        }
    }

    fn tracker_with(config: Config, transport: Arc<ScriptedTransport>) -> Tracker {
        Tracker::builder(config)
            .transport(transport)
            .connectivity(Arc::new(StaticConnectivity::new(true)))
            .device(DeviceProperties::detect())
            .build()
            .unwrap()
    }

    fn tracker() -> (Tracker, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(UploadOutcome::Success));
        (tracker_with(config(), transport.clone()), transport)
    }

    fn pending_types(tracker: &Tracker) -> Vec<String> {
        tracker
            .queue
            .fetch_pending_events()
            .unwrap()
            .iter()
            .filter_map(|r| r.event_type().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_track_without_token_fails_and_queues_nothing() {
        let transport = Arc::new(ScriptedTransport::new(UploadOutcome::Success));
        let tracker = tracker_with(
            Config {
                project_token: None,
                ..config()
            },
            transport,
        );

        let err = tracker.track("purchase", Payload::new()).unwrap_err();
        assert!(matches!(err, TrackingError::ConfigurationMissing { ref event_type } if event_type == "purchase"));
        assert_eq!(tracker.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_default_properties_merged_under_event_values() {
        let mut cfg = config();
        cfg.default_properties
            .insert("channel".to_string(), "beta".to_string());
        cfg.default_properties
            .insert("plan".to_string(), "free".to_string());
        let tracker = tracker_with(cfg, Arc::new(ScriptedTransport::new(UploadOutcome::Success)));

        let mut props = Payload::new();
        props.insert("plan".to_string(), "pro".into());
        tracker.track("upgrade", props).unwrap();

        let record = &tracker.queue.fetch_pending_events().unwrap()[0];
        let properties = record.properties().unwrap();
        assert_eq!(properties.get("channel").and_then(PropertyValue::as_str), Some("beta"));
        assert_eq!(properties.get("plan").and_then(PropertyValue::as_str), Some("pro"));
    }

    #[tokio::test]
    async fn test_consent_denied_is_never_persisted() {
        let (tracker, _) = tracker();
        let outcome = tracker
            .track_campaign(EventKind::PushOpened, Payload::new(), false, None)
            .unwrap();

        assert_eq!(outcome, TrackOutcome::Suppressed);
        assert_eq!(tracker.pending_count().unwrap(), 0);
        assert_eq!(tracker.delivery_log().stats().suppressed_by_consent, 1);
    }

    #[tokio::test]
    async fn test_forced_campaign_is_annotated() {
        let (tracker, _) = tracker();
        let outcome = tracker
            .track_campaign(
                EventKind::InAppMessageClick,
                Payload::new(),
                false,
                Some("https://example.com/offer?force_track=TRUE"),
            )
            .unwrap();
        assert!(matches!(outcome, TrackOutcome::Queued(_)));

        let record = &tracker.queue.fetch_pending_events().unwrap()[0];
        assert_eq!(record.event_type(), Some("banner"));
        let properties = record.properties().unwrap();
        assert_eq!(
            properties.get(fields::TRACKING_FORCED),
            Some(&PropertyValue::Bool(true))
        );
        assert_eq!(properties.get("action").and_then(PropertyValue::as_str), Some("click"));
    }

    #[tokio::test]
    async fn test_identify_merges_pending_updates() {
        let (tracker, _) = tracker();
        let mut ids = CustomerIds::new();
        ids.insert("registered", "u1");
        let first = tracker.identify_customer(ids.clone(), Payload::new()).unwrap();

        let mut props = Payload::new();
        props.insert("email".to_string(), "a@example.com".into());
        let second = tracker.identify_customer(ids, props).unwrap();

        assert_eq!(first, second);
        let updates = tracker.queue.fetch_pending_customer_updates().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].kind, RecordKind::CustomerUpdate);
    }

    #[tokio::test]
    async fn test_session_timeout_emits_end_then_start() {
        let (tracker, _) = tracker();
        let t0 = 1_700_000_000.0;

        assert!(tracker
            .handle_lifecycle_at(LifecycleSignal::ForegroundEntered, t0)
            .is_empty());
        tracker.handle_lifecycle_at(LifecycleSignal::BackgroundEntered, t0 + 10.0);
        let emitted =
            tracker.handle_lifecycle_at(LifecycleSignal::ForegroundEntered, t0 + 10.0 + 61.0);

        assert_eq!(emitted.len(), 2);
        assert_eq!(pending_types(&tracker), vec!["session_end", "session_start"]);

        let end = &tracker.queue.fetch_pending_events().unwrap()[0];
        let duration = end
            .properties()
            .and_then(|p| p.get(fields::DURATION))
            .and_then(PropertyValue::as_f64);
        assert_eq!(duration, Some(10.0));
        assert_eq!(tracker.session_state().session_start_time, t0 + 71.0);
    }

    #[tokio::test]
    async fn test_session_within_timeout_emits_nothing() {
        let (tracker, _) = tracker();
        let t0 = 1_700_000_000.0;

        tracker.handle_lifecycle_at(LifecycleSignal::ForegroundEntered, t0);
        tracker.handle_lifecycle_at(LifecycleSignal::BackgroundEntered, t0 + 10.0);
        let emitted =
            tracker.handle_lifecycle_at(LifecycleSignal::ForegroundEntered, t0 + 10.0 + 59.0);

        assert!(emitted.is_empty());
        assert_eq!(tracker.pending_count().unwrap(), 0);
        assert_eq!(tracker.session_state().session_start_time, t0);
    }

    #[tokio::test]
    async fn test_session_tracking_can_be_disabled() {
        let transport = Arc::new(ScriptedTransport::new(UploadOutcome::Success));
        let tracker = tracker_with(
            Config {
                automatic_session_tracking: false,
                ..config()
            },
            transport,
        );
        tracker.handle_lifecycle_at(LifecycleSignal::ForegroundEntered, 100.0);
        tracker.handle_lifecycle_at(LifecycleSignal::WillTerminate, 200.0);
        assert_eq!(tracker.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_manual_session_control() {
        let (tracker, _) = tracker();
        tracker.start_session_at(100.0);
        tracker.end_session_at(130.0);
        assert_eq!(pending_types(&tracker), vec!["session_start", "session_end"]);
    }

    #[tokio::test]
    async fn test_install_tracked_once_per_data_dir() {
        let temp_dir = TempDir::new().unwrap();
        let cfg = Config {
            data_path: temp_dir.path().to_path_buf(),
            ..config()
        };

        let build = || {
            Tracker::builder(cfg.clone())
                .transport(Arc::new(ScriptedTransport::new(UploadOutcome::Success)))
                .connectivity(Arc::new(StaticConnectivity::new(true)))
                .persistent(true)
                .build()
                .unwrap()
        };

        let tracker = build();
        assert!(tracker.track_install().unwrap().is_some());
        assert!(tracker.track_install().unwrap().is_none());
        drop(tracker);

        let reopened = build();
        assert!(reopened.track_install().unwrap().is_none());
        // The installation event survived in the persisted queue.
        assert_eq!(pending_types(&reopened), vec!["installation"]);
    }

    #[tokio::test]
    async fn test_flush_through_tracker() {
        let (tracker, transport) = tracker();
        tracker.track("a", Payload::new()).unwrap();
        let report = tracker.request_flush().await;
        assert_eq!(report.status, FlushStatus::Completed);
        assert_eq!(transport.upload_count(), 1);
        assert_eq!(tracker.pending_count().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_mode_flushes_on_background_signal() {
        let (tracker, transport) = tracker();
        tracker.set_flushing_mode(FlushingMode::Automatic);
        tracker.track("a", Payload::new()).unwrap();

        tracker.handle_lifecycle(LifecycleSignal::BackgroundEntered);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.upload_count(), 1);
    }
}
