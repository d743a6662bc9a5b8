//! Broker counters
//!
//! Lightweight atomic counters updated on the hot path. There is no
//! exposition endpoint here; embedders read the snapshot through
//! [`Metrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic broker counters
#[derive(Debug, Default)]
pub struct Metrics {
    /// Connections accepted on any listener
    pub connections_accepted: AtomicU64,
    /// Connections refused by admission control
    pub connections_refused: AtomicU64,
    /// PUBLISH packets received from clients
    pub messages_received: AtomicU64,
    /// PUBLISH packets written to clients
    pub messages_sent: AtomicU64,
    /// Offline-queue messages dropped on overflow
    pub messages_dropped: AtomicU64,
    /// Deliveries abandoned after the retry budget
    pub delivery_failures: AtomicU64,
    /// Persistent store failures
    pub storage_errors: AtomicU64,
}

/// Point-in-time counter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub delivery_failures: u64,
    pub storage_errors: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.messages_received);
        Metrics::incr(&metrics.messages_received);
        Metrics::incr(&metrics.messages_dropped);

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.messages_dropped, 1);
        assert_eq!(snap.messages_sent, 0);
    }
}
