//! Network manager configuration.

use crate::error::{NetError, NetResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Connection timeouts shared by every worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// First read on an accepted connection
    pub init: Duration,
    /// Reads after the first message
    pub idle: Duration,
    /// Reads on handles that opted into keepalive
    pub keepalive: Duration,
    /// Value advertised to peers in EDNS keepalive
    pub advertised: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(30),
            idle: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
            advertised: Duration::from_secs(30),
        }
    }
}

/// Network manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Read timeouts
    pub timeouts: Timeouts,
    /// Per-send write timeout
    pub write_timeout: Duration,
    /// Bytes requested per socket read
    pub recv_chunk_size: usize,
    /// Bind one SO_REUSEPORT socket per worker instead of sharing one descriptor
    pub load_balance_sockets: bool,
    /// Disable Nagle on stream sockets
    pub tcp_nodelay: bool,
    /// Send requests kept for reuse
    pub request_pool_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            timeouts: Timeouts::default(),
            write_timeout: Duration::from_secs(30),
            recv_chunk_size: netmgr_wire::DEFAULT_RECV_CHUNK,
            load_balance_sockets: cfg!(unix),
            tcp_nodelay: true,
            request_pool_size: 1024,
        }
    }
}

impl NetConfig {
    /// Override the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Override the timeouts
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Check the settings before starting workers
    pub fn validate(&self) -> NetResult<()> {
        if self.workers == 0 {
            return Err(NetError::NoResources);
        }
        if self.recv_chunk_size == 0 {
            return Err(NetError::NoResources);
        }
        Ok(())
    }
}

/// Lock-free timeout storage readable from every worker
#[derive(Debug)]
pub(crate) struct TimeoutCell {
    init: AtomicU64,
    idle: AtomicU64,
    keepalive: AtomicU64,
    advertised: AtomicU64,
}

impl TimeoutCell {
    pub(crate) fn new(t: Timeouts) -> Self {
        let cell = Self {
            init: AtomicU64::new(0),
            idle: AtomicU64::new(0),
            keepalive: AtomicU64::new(0),
            advertised: AtomicU64::new(0),
        };
        cell.store(t);
        cell
    }

    pub(crate) fn store(&self, t: Timeouts) {
        self.init.store(t.init.as_millis() as u64, Ordering::Relaxed);
        self.idle.store(t.idle.as_millis() as u64, Ordering::Relaxed);
        self.keepalive
            .store(t.keepalive.as_millis() as u64, Ordering::Relaxed);
        self.advertised
            .store(t.advertised.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn load(&self) -> Timeouts {
        Timeouts {
            init: Duration::from_millis(self.init.load(Ordering::Relaxed)),
            idle: Duration::from_millis(self.idle.load(Ordering::Relaxed)),
            keepalive: Duration::from_millis(self.keepalive.load(Ordering::Relaxed)),
            advertised: Duration::from_millis(self.advertised.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.timeouts.init, Duration::from_secs(30));
        assert!(config.validate().is_ok());
        assert!(config.with_workers(0).validate().is_err());
    }

    #[test]
    fn test_timeout_cell() {
        let cell = TimeoutCell::new(Timeouts::default());
        let t = Timeouts {
            init: Duration::from_millis(1500),
            idle: Duration::from_secs(5),
            keepalive: Duration::from_secs(60),
            advertised: Duration::from_secs(120),
        };
        cell.store(t);
        assert_eq!(cell.load(), t);
    }
}
