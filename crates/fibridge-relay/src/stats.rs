//! Transfer statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Chunks and bytes forwarded for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub chunks: u64,
    pub bytes: u64,
}

impl TransferStats {
    pub fn record(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes += len as u64;
    }
}

/// Relay-wide totals, updated lock-free from every request task.
#[derive(Debug, Default)]
pub struct RelayStats {
    requests: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
    bytes_sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub bytes_sent: u64,
}

impl RelayStats {
    pub fn request_started(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self, transfer: TransferStats) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(transfer.bytes, Ordering::Relaxed);
    }

    pub fn request_cancelled(&self, transfer: TransferStats) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(transfer.bytes, Ordering::Relaxed);
    }

    pub fn request_failed(&self, transfer: TransferStats) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(transfer.bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_accumulate() {
        let stats = RelayStats::default();
        let mut transfer = TransferStats::default();
        transfer.record(100);
        transfer.record(24);

        stats.request_started();
        stats.request_started();
        stats.request_started();
        stats.request_completed(transfer);
        stats.request_cancelled(TransferStats { chunks: 1, bytes: 6 });
        stats.request_failed(TransferStats::default());

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                requests: 3,
                completed: 1,
                cancelled: 1,
                failed: 1,
                bytes_sent: 130,
            }
        );
        assert_eq!(transfer.chunks, 2);
    }
}
