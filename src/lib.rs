//! Offline Tracker - offline-first event tracking and delivery.
//!
//! Events and customer updates are persisted locally the moment they are
//! tracked, then delivered to a collection API whenever the host is
//! reachable. Consent is checked before persistence, session boundaries
//! are derived from app lifecycle signals, and rejected records are retried
//! a bounded number of times.
//!
//! # Delivery Guarantees
//!
//! - **Consent first**: a denied event is never written to the queue
//! - **No loss to flaky networks**: connectivity failures never count as retries
//! - **Bounded retries**: a record rejected `max_retries` times is evicted
//! - **Single flight**: at most one flush runs at any instant
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Offline Tracker                        │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐          │
//! │  │   Consent   │──▶│  Durable    │──▶│   Flush     │          │
//! │  │    Gate     │   │   Queue     │   │ Coordinator │          │
//! │  └─────────────┘   └─────────────┘   └─────────────┘          │
//! │         ▲                 ▲                 │  ▲               │
//! │         │                 │                 ▼  │               │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐          │
//! │  │   Tracker   │──▶│  Session    │   │   Upload    │          │
//! │  │   (host)    │   │  Machine    │   │  Transport  │          │
//! │  └─────────────┘   └─────────────┘   └─────────────┘          │
//! │         │                                   ▲                  │
//! │         ▼                                   │                  │
//! │  ┌─────────────┐                     ┌─────────────┐          │
//! │  │  Lifecycle  │────────────────────▶│    Flush    │          │
//! │  │     Bus     │                     │  Scheduler  │          │
//! │  └─────────────┘                     └─────────────┘          │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use offline_tracker::{Config, FlushingMode, LifecycleSignal, Payload, Tracker};
//!
//! # async fn run() -> Result<(), offline_tracker::TrackingError> {
//! let config = Config {
//!     project_token: Some("project-token".to_string()),
//!     flushing_mode: FlushingMode::Automatic,
//!     ..Config::default()
//! };
//! let tracker = Tracker::builder(config).persistent(true).build()?;
//!
//! tracker.handle_lifecycle(LifecycleSignal::ForegroundEntered);
//! tracker.track("signup", Payload::new())?;
//!
//! // Automatic mode flushes when the app backgrounds.
//! tracker.handle_lifecycle(LifecycleSignal::BackgroundEntered);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consent;
pub mod error;
pub mod flush;
pub mod lifecycle;
pub mod queue;
pub mod record;
pub mod session;
pub mod tracker;
pub mod transparency;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export key types at crate root for convenience
pub use config::Config;
pub use consent::{ConsentDecision, EventKind};
pub use error::{ConfigError, QueueError, TrackingError};
pub use flush::{FlushCoordinator, FlushReport, FlushScheduler, FlushStatus, FlushingMode};
pub use lifecycle::{LifecycleBus, LifecycleSignal};
pub use queue::{DurableQueue, FetchOrder, LocalQueue};
pub use record::{CustomerIds, Payload, PropertyValue, RecordId, RecordKind, TrackingRecord};
pub use session::{SessionEvent, SessionEventKind, SessionState, SessionStateMachine};
pub use tracker::{TrackOutcome, Tracker, TrackerBuilder};
pub use transparency::{DeliveryLog, DeliveryStats, SharedDeliveryLog};
pub use transport::{
    ConnectivityProbe, FailureClass, StaticConnectivity, UploadOutcome, UploadTransport,
};

#[cfg(feature = "http")]
pub use transport::{HttpTransport, TransportConfig};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
