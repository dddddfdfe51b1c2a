// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Server-wide counters shared by the reactor, the workers and the running-server handle.
///
/// `active_conns` is the one live-connection count the capacity check reads.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub active_conns: AtomicUsize,
    pub total_accepted: AtomicUsize,
    pub rejected: AtomicUsize,
    pub requests: AtomicUsize,
    pub bytes_sent: AtomicUsize,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub active_conns: usize,
    pub total_accepted: usize,
    pub rejected: usize,
    pub requests: usize,
    pub bytes_sent: usize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            total_accepted: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::AcqRel);
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active(&self) -> usize {
        self.active_conns.load(Ordering::Acquire)
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_conns: self.active_conns.load(Ordering::Acquire),
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_counters_track_open_and_close() {
        let m = ServerMetrics::new();
        m.inc_conn();
        m.inc_conn();
        m.dec_conn();
        m.inc_rejected();
        m.add_bytes(128);

        let snap = m.snapshot();
        assert_eq!(snap.active_conns, 1);
        assert_eq!(snap.total_accepted, 2);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.bytes_sent, 128);
        assert_eq!(snap.requests, 0);
    }
}
