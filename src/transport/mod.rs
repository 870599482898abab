//! Upload transport and connectivity contracts.
//!
//! The flush coordinator performs one upload per record through
//! [`UploadTransport`] and asks a [`ConnectivityProbe`] before starting.

pub mod connectivity;
#[cfg(feature = "http")]
pub mod http;

pub use connectivity::{ConnectivityProbe, StaticConnectivity, TcpProbe};
#[cfg(feature = "http")]
pub use http::{HttpTransport, TransportConfig};

use crate::record::{CustomerIds, Payload};
use async_trait::async_trait;
use std::fmt;

/// How an upload failure should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// No usable answer from the server; retried forever without counting.
    ConnectivityOrServerUnavailable,
    /// The server answered and refused the record; counts towards eviction.
    Rejected,
}

/// Result of a single upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    Failure { class: FailureClass, detail: String },
}

impl UploadOutcome {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        UploadOutcome::Failure {
            class: FailureClass::ConnectivityOrServerUnavailable,
            detail: detail.into(),
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        UploadOutcome::Failure {
            class: FailureClass::Rejected,
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success)
    }
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadOutcome::Success => write!(f, "success"),
            UploadOutcome::Failure {
                class: FailureClass::ConnectivityOrServerUnavailable,
                detail,
            } => write!(f, "unavailable: {detail}"),
            UploadOutcome::Failure {
                class: FailureClass::Rejected,
                detail,
            } => write!(f, "rejected: {detail}"),
        }
    }
}

/// Performs one network upload per record.
///
/// Implementations own their timeouts; a timed-out request is reported as
/// a failure, never as a hang.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload_customer(&self, payload: &Payload, ids: &CustomerIds) -> UploadOutcome;

    async fn upload_event(&self, payload: &Payload, ids: &CustomerIds) -> UploadOutcome;
}
