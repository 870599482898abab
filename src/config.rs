//! Configuration for the offline tracker.

use crate::flush::FlushingMode;
use crate::record::{Payload, PropertyValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::error::ConfigError;

const APP_DIR: &str = "offline-tracker";

/// Main configuration for the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Destination project; tracking fails without it
    pub project_token: Option<String>,

    /// Sent as `Authorization: Token …` when set
    pub auth_token: Option<String>,

    /// Collection API base URL; its host also seeds the connectivity probe
    pub base_url: String,

    /// Background gap after which the next foreground starts a new session
    pub session_timeout_secs: f64,

    /// Rejected uploads before a record is evicted (at least 1)
    pub max_retries: u32,

    pub flushing_mode: FlushingMode,

    /// Emit session records from lifecycle signals
    pub automatic_session_tracking: bool,

    /// Per-request upload timeout
    #[serde(with = "duration_secs")]
    pub upload_timeout: Duration,

    /// Merged under every event's properties. Values are parsed as literals,
    /// so `"42"` becomes a number and `"true"` a boolean.
    pub default_properties: BTreeMap<String, String>,

    /// Path for the queue, session state and delivery log
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            project_token: None,
            auth_token: None,
            base_url: "http://localhost:8080".to_string(),
            session_timeout_secs: 60.0,
            max_retries: 10,
            flushing_mode: FlushingMode::default(),
            automatic_session_tracking: true,
            upload_timeout: Duration::from_secs(10),
            default_properties: BTreeMap::new(),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content).map_err(io_err)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|source| ConfigError::Io {
            path: self.data_path.clone(),
            source,
        })
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        if self.max_retries < 1 {
            return Err(invalid("max_retries", "must be at least 1".to_string()));
        }
        if !(self.session_timeout_secs.is_finite() && self.session_timeout_secs > 0.0) {
            return Err(invalid(
                "session_timeout_secs",
                format!("must be positive, got {}", self.session_timeout_secs),
            ));
        }
        if self.upload_timeout.is_zero() {
            return Err(invalid("upload_timeout", "must be positive".to_string()));
        }
        if let FlushingMode::Periodic { interval } = self.flushing_mode {
            if interval.is_zero() {
                return Err(invalid(
                    "flushing_mode",
                    "periodic interval must be positive".to_string(),
                ));
            }
        }
        url::Url::parse(&self.base_url).map_err(|e| invalid("base_url", e.to_string()))?;
        if let Some(ref token) = self.project_token {
            if token.trim().is_empty() {
                return Err(invalid("project_token", "must not be blank".to_string()));
            }
        }
        Ok(())
    }

    /// Default properties as typed values.
    pub fn default_payload(&self) -> Payload {
        self.default_properties
            .iter()
            .map(|(k, v)| (k.clone(), PropertyValue::parse_literal(v)))
            .collect()
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_path.join("queue.json")
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_path.join("session.json")
    }

    pub fn delivery_log_path(&self) -> PathBuf {
        self.data_path.join("delivery.json")
    }

    pub fn install_marker_path(&self) -> PathBuf {
        self.data_path.join("installed")
    }
}

/// Serde support for `Duration` as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
