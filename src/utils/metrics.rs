//! Observability counters for one connection.
//!
//! Uses atomic counters for thread-safe collection; read them through
//! `Connection::metrics()`. There is no exporter — observability backends
//! are the consumer's concern.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Per-connection counters.
#[derive(Debug)]
pub struct ConnectionMetrics {
    /// Handshakes attempted (initial wrap plus every rekey).
    pub handshakes_total: AtomicU64,
    /// Handshakes completed successfully.
    pub handshakes_success: AtomicU64,
    /// Handshakes aborted by error.
    pub handshakes_failed: AtomicU64,
    /// Partial rekeys among the successful handshakes.
    pub rekeys_partial: AtomicU64,
    /// Packets written to the wire.
    pub packets_sent: AtomicU64,
    /// Packets received and dispatched.
    pub packets_received: AtomicU64,
    /// Wire bytes written, length prefixes included.
    pub bytes_sent: AtomicU64,
    /// Wire bytes read, length prefixes included.
    pub bytes_received: AtomicU64,
    /// Frames whose plaintext failed to decode.
    pub read_errors: AtomicU64,
    /// Start time for uptime calculation.
    started_at: Instant,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            rekeys_partial: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn partial_rekey(&self) {
        self.rekeys_partial.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self, wire_bytes: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(wire_bytes, Ordering::Relaxed);
    }

    pub fn packet_received(&self, wire_bytes: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(wire_bytes, Ordering::Relaxed);
    }

    pub fn read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds since the connection was wrapped.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
