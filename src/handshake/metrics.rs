//! Handshake metrics collection.
//!
//! Aggregate counters only; nothing identifies a peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Handshake metrics collector, shared by all connections of one server.
pub struct HandshakeMetrics {
    /// Collector start time
    start_time: Instant,
    /// Completed full handshakes (each one is a decapsulation)
    full_handshakes: AtomicU64,
    /// Accepted ticket resumptions
    resumptions: AtomicU64,
    /// Resumption randoms presented twice
    replays_rejected: AtomicU64,
    /// Explicit resumption attempts with an unknown ticket
    invalid_tickets: AtomicU64,
    /// Handshakes that failed for any other reason
    handshake_failures: AtomicU64,
    /// Tickets removed by the sweeper
    sessions_evicted: AtomicU64,
}

impl HandshakeMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            full_handshakes: AtomicU64::new(0),
            resumptions: AtomicU64::new(0),
            replays_rejected: AtomicU64::new(0),
            invalid_tickets: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
        }
    }

    /// Increment completed full handshakes.
    pub fn increment_full_handshakes(&self) {
        self.full_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment accepted resumptions.
    pub fn increment_resumptions(&self) {
        self.resumptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment rejected replays.
    pub fn increment_replays_rejected(&self) {
        self.replays_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment unknown-ticket rejections.
    pub fn increment_invalid_tickets(&self) {
        self.invalid_tickets.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment failed handshakes.
    pub fn increment_handshake_failures(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to the evicted-session counter.
    pub fn add_sessions_evicted(&self, count: u64) {
        self.sessions_evicted.fetch_add(count, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get completed full handshakes.
    pub fn full_handshakes(&self) -> u64 {
        self.full_handshakes.load(Ordering::Relaxed)
    }

    /// Get accepted resumptions.
    pub fn resumptions(&self) -> u64 {
        self.resumptions.load(Ordering::Relaxed)
    }

    /// Get rejected replays.
    pub fn replays_rejected(&self) -> u64 {
        self.replays_rejected.load(Ordering::Relaxed)
    }

    /// Get unknown-ticket rejections.
    pub fn invalid_tickets(&self) -> u64 {
        self.invalid_tickets.load(Ordering::Relaxed)
    }

    /// Get failed handshakes.
    pub fn handshake_failures(&self) -> u64 {
        self.handshake_failures.load(Ordering::Relaxed)
    }

    /// Get evicted sessions.
    pub fn sessions_evicted(&self) -> u64 {
        self.sessions_evicted.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            full_handshakes: self.full_handshakes(),
            resumptions: self.resumptions(),
            replays_rejected: self.replays_rejected(),
            invalid_tickets: self.invalid_tickets(),
            handshake_failures: self.handshake_failures(),
            sessions_evicted: self.sessions_evicted(),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"veil Handshake Metrics
======================
Uptime: {} seconds

Handshakes:
  Full:        {}
  Resumed:     {}
  Resume rate: {:.2}

Rejections:
  Replays:         {}
  Invalid tickets: {}
  Failures:        {}

Sessions evicted: {}
"#,
            snapshot.uptime_secs,
            snapshot.full_handshakes,
            snapshot.resumptions,
            snapshot.resumption_rate(),
            snapshot.replays_rejected,
            snapshot.invalid_tickets,
            snapshot.handshake_failures,
            snapshot.sessions_evicted,
        )
    }
}

impl Default for HandshakeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub full_handshakes: u64,
    pub resumptions: u64,
    pub replays_rejected: u64,
    pub invalid_tickets: u64,
    pub handshake_failures: u64,
    pub sessions_evicted: u64,
}

impl MetricsSnapshot {
    /// Share of successful handshakes that were resumptions.
    pub fn resumption_rate(&self) -> f64 {
        let total = self.full_handshakes + self.resumptions;
        if total == 0 {
            0.0
        } else {
            self.resumptions as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = HandshakeMetrics::new();
        assert_eq!(metrics.full_handshakes(), 0);
        assert_eq!(metrics.resumptions(), 0);
    }

    #[test]
    fn test_counting() {
        let metrics = HandshakeMetrics::new();

        metrics.increment_full_handshakes();
        metrics.increment_resumptions();
        metrics.increment_resumptions();
        metrics.increment_replays_rejected();
        metrics.add_sessions_evicted(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.full_handshakes, 1);
        assert_eq!(snapshot.resumptions, 2);
        assert_eq!(snapshot.replays_rejected, 1);
        assert_eq!(snapshot.sessions_evicted, 3);
    }

    #[test]
    fn test_resumption_rate() {
        let mut snapshot = HandshakeMetrics::new().snapshot();
        assert_eq!(snapshot.resumption_rate(), 0.0);

        snapshot.full_handshakes = 1;
        snapshot.resumptions = 3;
        assert!((snapshot.resumption_rate() - 0.75).abs() < 0.01);
    }

    #[test]
    fn test_format_report() {
        let metrics = HandshakeMetrics::new();
        metrics.increment_full_handshakes();

        let report = metrics.format_report();
        assert!(report.contains("veil Handshake Metrics"));
        assert!(report.contains("Full:        1"));
    }
}
