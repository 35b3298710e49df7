//! Hub configuration loaded from environment variables

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{HubError, HubResult};

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Listen address for the HTTP/WebSocket server
    pub addr: SocketAddr,
    /// Capacity of the dispatch queue; producers wait when it is full
    pub queue_capacity: usize,
    /// Upper bound on a single write to one peer during fan-out
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl HubConfig {
    /// Load config from environment variables
    /// HUB_ADDR, HUB_QUEUE_CAPACITY, HUB_WRITE_TIMEOUT_MS
    ///
    /// An unparseable listen address is fatal; bad tuning values fall back to defaults.
    pub fn from_env() -> HubResult<Self> {
        let addr = match std::env::var("HUB_ADDR") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<SocketAddr>()
                .map_err(|e| HubError::Config(format!("HUB_ADDR={raw:?}: {e}")))?,
            _ => DEFAULT_ADDR
                .parse()
                .map_err(|e| HubError::Config(format!("default address: {e}")))?,
        };

        let queue_capacity = match std::env::var("HUB_QUEUE_CAPACITY") {
            Ok(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    tracing::warn!(
                        "Ignoring HUB_QUEUE_CAPACITY={:?}, using {}",
                        raw,
                        DEFAULT_QUEUE_CAPACITY
                    );
                    DEFAULT_QUEUE_CAPACITY
                }
            },
            Err(_) => DEFAULT_QUEUE_CAPACITY,
        };

        let write_timeout = match std::env::var("HUB_WRITE_TIMEOUT_MS") {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    tracing::warn!(
                        "Ignoring HUB_WRITE_TIMEOUT_MS={:?}, using {:?}",
                        raw,
                        DEFAULT_WRITE_TIMEOUT
                    );
                    DEFAULT_WRITE_TIMEOUT
                }
            },
            Err(_) => DEFAULT_WRITE_TIMEOUT,
        };

        Ok(Self {
            addr,
            queue_capacity,
            write_timeout,
        })
    }
}
