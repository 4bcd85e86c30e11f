//! Observability and Metrics
//!
//! Per-server session counters. Every [`Server`](crate::transport::server::Server)
//! owns one `Metrics` instance shared with its sessions.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one server
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted by any binding
    pub connections_accepted: AtomicU64,
    /// Currently registered sessions
    pub sessions_active: AtomicU64,
    /// Connections rejected by the global cap
    pub rejected_global: AtomicU64,
    /// Connections rejected by the per-address cap
    pub rejected_per_ip: AtomicU64,
    /// Commands parsed from the wire
    pub commands_received: AtomicU64,
    /// Commands written to the wire
    pub commands_sent: AtomicU64,
    /// Unrecognized commands
    pub bad_commands: AtomicU64,
    /// Commands whose handler failed or panicked
    pub business_errors: AtomicU64,
    /// Frames that violated the wire bounds
    pub protocol_violations: AtomicU64,
    /// Unexpected socket faults
    pub critical_errors: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            rejected_global: AtomicU64::new(0),
            rejected_per_ip: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            bad_commands: AtomicU64::new(0),
            business_errors: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            critical_errors: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session entering the registry
    pub fn session_registered(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session leaving the registry
    pub fn session_removed(&self) {
        // saturating: removal always follows a registration
        let _ = self
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn rejected_global(&self) {
        self.rejected_global.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_per_ip(&self) {
        self.rejected_per_ip.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame handed to the socket
    pub fn command_sent(&self, byte_count: u64) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn bad_command(&self) {
        self.bad_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn business_error(&self) {
        self.business_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn critical_error(&self) {
        self.critical_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            rejected_global: self.rejected_global.load(Ordering::Relaxed),
            rejected_per_ip: self.rejected_per_ip.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            bad_commands: self.bad_commands.load(Ordering::Relaxed),
            business_errors: self.business_errors.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            critical_errors: self.critical_errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_accepted = snapshot.connections_accepted,
            sessions_active = snapshot.sessions_active,
            rejected_global = snapshot.rejected_global,
            rejected_per_ip = snapshot.rejected_per_ip,
            commands_received = snapshot.commands_received,
            commands_sent = snapshot.commands_sent,
            bad_commands = snapshot.bad_commands,
            business_errors = snapshot.business_errors,
            protocol_violations = snapshot.protocol_violations,
            critical_errors = snapshot.critical_errors,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            uptime_seconds = snapshot.uptime_seconds,
            "Session server metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub sessions_active: u64,
    pub rejected_global: u64,
    pub rejected_per_ip: u64,
    pub commands_received: u64,
    pub commands_sent: u64,
    pub bad_commands: u64,
    pub business_errors: u64,
    pub protocol_violations: u64,
    pub critical_errors: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = Metrics::new();
        metrics.connection_accepted();
        metrics.session_registered();
        metrics.command_sent(16);
        metrics.bytes_read(32);
        metrics.bad_command();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_accepted, 1);
        assert_eq!(snap.sessions_active, 1);
        assert_eq!(snap.commands_sent, 1);
        assert_eq!(snap.bytes_sent, 16);
        assert_eq!(snap.bytes_received, 32);
        assert_eq!(snap.bad_commands, 1);
    }

    #[test]
    fn test_active_sessions_never_underflow() {
        let metrics = Metrics::new();
        metrics.session_removed();
        assert_eq!(metrics.snapshot().sessions_active, 0);
    }
}
