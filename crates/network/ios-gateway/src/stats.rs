//! Gateway counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the accept, read and send paths
#[derive(Debug, Default)]
pub struct GatewayStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    sends: AtomicU64,
    send_failures: AtomicU64,
}

impl GatewayStats {
    /// Record an accepted connection
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection refused at the connection limit
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes read from a device
    pub fn record_bytes(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a decoded frame
    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful write
    pub fn record_send(&self) {
        self.sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed or timed-out write
    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`GatewayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatsSnapshot {
    /// Connections accepted
    pub accepted: u64,
    /// Connections refused at the limit
    pub rejected: u64,
    /// Frames decoded
    pub frames_received: u64,
    /// Bytes read
    pub bytes_received: u64,
    /// Successful writes
    pub sends: u64,
    /// Failed writes
    pub send_failures: u64,
}
