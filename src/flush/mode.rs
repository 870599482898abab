//! Flushing modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// When the scheduler triggers flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FlushingMode {
    /// Only explicit `request_flush` calls.
    Manual,
    /// Flush `delay` after installation and after every tracked record.
    Immediate {
        #[serde(with = "crate::config::duration_secs")]
        delay: Duration,
    },
    /// Flush every `interval`.
    Periodic {
        #[serde(with = "crate::config::duration_secs")]
        interval: Duration,
    },
    /// Flush whenever the app enters the background.
    Automatic,
}

impl Default for FlushingMode {
    fn default() -> Self {
        FlushingMode::Immediate {
            delay: Duration::ZERO,
        }
    }
}

impl fmt::Display for FlushingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushingMode::Manual => write!(f, "manual"),
            FlushingMode::Immediate { delay } => write!(f, "immediate:{}", delay.as_secs()),
            FlushingMode::Periodic { interval } => write!(f, "periodic:{}", interval.as_secs()),
            FlushingMode::Automatic => write!(f, "automatic"),
        }
    }
}

/// Parses `manual`, `automatic`, `immediate[:secs]` and `periodic:secs`.
impl FromStr for FlushingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s, None),
        };
        let secs = |arg: Option<&str>| -> Result<Option<Duration>, String> {
            arg.map(|a| {
                a.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| format!("invalid seconds '{a}': {e}"))
            })
            .transpose()
        };

        match name.trim().to_lowercase().as_str() {
            "manual" => Ok(FlushingMode::Manual),
            "automatic" => Ok(FlushingMode::Automatic),
            "immediate" => Ok(FlushingMode::Immediate {
                delay: secs(arg)?.unwrap_or(Duration::ZERO),
            }),
            "periodic" => match secs(arg)? {
                Some(interval) if !interval.is_zero() => Ok(FlushingMode::Periodic { interval }),
                _ => Err("periodic mode needs a positive interval, e.g. periodic:60".to_string()),
            },
            other => Err(format!("unknown flushing mode '{other}'")),
        }
    }
}
