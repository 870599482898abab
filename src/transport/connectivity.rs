//! Reachability checks for the collection host.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;

/// Reports whether the collection host can currently be reached.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// Connectivity controlled by the host (or by tests).
#[derive(Debug)]
pub struct StaticConnectivity {
    connected: AtomicBool,
}

impl StaticConnectivity {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for StaticConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ConnectivityProbe for StaticConnectivity {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Probes reachability by opening a TCP connection to the endpoint host.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    /// Build a probe from the configured endpoint URL.
    ///
    /// Returns `None` when the URL has no host.
    pub fn from_base_url(base_url: &str, timeout: Duration) -> Option<Self> {
        let parsed = url::Url::parse(base_url).ok()?;
        let host = parsed.host_str()?.to_string();
        let port = parsed.port_or_known_default()?;
        Some(Self {
            host,
            port,
            timeout,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn is_connected(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.address())).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(address = %self.address(), error = %e, "host unreachable");
                false
            }
            Err(_) => {
                tracing::debug!(address = %self.address(), "reachability probe timed out");
                false
            }
        }
    }
}
