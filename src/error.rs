//! Error types for the tracking pipeline.
//!
//! Errors inside a flush never reach the caller; they are logged per record.
//! Only `track`-style operations surface errors synchronously.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by host-facing tracking operations.
#[derive(Error, Debug)]
pub enum TrackingError {
    /// The durable queue could not be read or written.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),

    /// The collection host is not reachable.
    #[error("Connectivity unavailable")]
    ConnectivityUnavailable,

    /// The collection endpoint rejected an upload.
    #[error("Upload rejected: {0}")]
    UploadRejected(String),

    /// No destination project token is configured.
    #[error("No project token configured; cannot track '{event_type}'")]
    ConfigurationMissing { event_type: String },

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The tracker was built outside a tokio runtime.
    #[error("No async runtime available: {0}")]
    Runtime(String),
}

/// Failures of the durable queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Record {0} not found")]
    NotFound(u64),

    #[error("Queue storage at {path} failed: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Pending records or the identity snapshot could not be read for a flush.
    #[error("Pending records could not be read")]
    Unreadable,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Lock poisoned by a panicking writer.
    #[error("Queue state poisoned")]
    Poisoned,
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}
