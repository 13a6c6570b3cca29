//! Per-manager statistics counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatId {
    Accepted,
    AcceptFailed,
    QuotaDeferred,
    Connected,
    ConnectFailed,
    Sent,
    SendFailed,
    RecvFailed,
    SocketsOpened,
    SocketsClosed,
}

const STAT_COUNT: usize = 10;

/// Atomic counters updated by every worker
#[derive(Debug, Default)]
pub(crate) struct NetStats {
    counters: [AtomicU64; STAT_COUNT],
}

impl NetStats {
    pub(crate) fn incr(&self, id: StatId) {
        self.counters[id as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, id: StatId) -> u64 {
        self.counters[id as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        let opened = self.get(StatId::SocketsOpened);
        let closed = self.get(StatId::SocketsClosed);
        StatsSnapshot {
            accepted: self.get(StatId::Accepted),
            accept_failed: self.get(StatId::AcceptFailed),
            quota_deferred: self.get(StatId::QuotaDeferred),
            connected: self.get(StatId::Connected),
            connect_failed: self.get(StatId::ConnectFailed),
            sent: self.get(StatId::Sent),
            send_failed: self.get(StatId::SendFailed),
            recv_failed: self.get(StatId::RecvFailed),
            active_sockets: opened.saturating_sub(closed),
        }
    }
}

/// Point-in-time copy of the manager counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Connections accepted
    pub accepted: u64,
    /// Accept calls that failed
    pub accept_failed: u64,
    /// Accepts deferred by an exhausted quota
    pub quota_deferred: u64,
    /// Outgoing connections established
    pub connected: u64,
    /// Outgoing connections that failed
    pub connect_failed: u64,
    /// Messages or buffers fully sent
    pub sent: u64,
    /// Sends that failed
    pub send_failed: u64,
    /// Reads that ended in an error other than EOF
    pub recv_failed: u64,
    /// Sockets whose descriptor is still open
    pub active_sockets: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = NetStats::default();
        stats.incr(StatId::Accepted);
        stats.incr(StatId::Accepted);
        stats.incr(StatId::SocketsOpened);
        stats.incr(StatId::SocketsOpened);
        stats.incr(StatId::SocketsClosed);

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.active_sockets, 1);
        assert_eq!(snap.sent, 0);
    }
}
