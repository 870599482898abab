//! Host application lifecycle signals.
//!
//! Signals are delivered by the host on its control path and fanned out on a
//! broadcast bus so that flush triggers can subscribe and unsubscribe freely.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A lifecycle transition of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    ForegroundEntered,
    BackgroundEntered,
    WillTerminate,
}

impl LifecycleSignal {
    /// Parse the short names used on the CLI (`fg`, `bg`, `quit`).
    pub fn from_short(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fg" | "foreground" => Some(LifecycleSignal::ForegroundEntered),
            "bg" | "background" => Some(LifecycleSignal::BackgroundEntered),
            "quit" | "terminate" => Some(LifecycleSignal::WillTerminate),
            _ => None,
        }
    }
}

const BUS_CAPACITY: usize = 64;

/// Fan-out of lifecycle signals to any number of subscribers.
#[derive(Debug, Clone)]
pub struct LifecycleBus {
    sender: broadcast::Sender<LifecycleSignal>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish a signal. Returns the number of subscribers that received it.
    pub fn publish(&self, signal: LifecycleSignal) -> usize {
        // No subscribers is not an error.
        self.sender.send(signal).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleSignal> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new()
    }
}
