// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay counters.
//!
//! Atomic scalars readable at any time without locks. A snapshot is a
//! plain record built from one-shot reads; minor skew between fields
//! across a snapshot is acceptable.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared relay counters.
#[derive(Debug)]
pub struct RelayStats {
    /// Messages acknowledged by the upstream host.
    accepted: AtomicU64,

    /// Messages refused: upstream NACK, transport fault, queue overflow,
    /// or reply timeout.
    rejected: AtomicU64,

    /// Upstream dial attempts that followed a failure or disconnect.
    reconnects: AtomicU64,

    /// Whether the upstream connection is currently established.
    connected: AtomicBool,

    /// Relay start time; reset when the relay starts serving.
    started: Mutex<Instant>,
}

impl RelayStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            started: Mutex::new(Instant::now()),
        }
    }

    /// Record an upstream-acknowledged message.
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refused message.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upstream reconnect attempt.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the upstream connection status.
    pub fn set_connected(&self, status: bool) {
        self.connected.store(status, Ordering::Relaxed);
    }

    /// Current upstream connection status.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Zero the counters and restart the uptime clock.
    pub fn reset(&self) {
        self.accepted.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.reconnects.store(0, Ordering::Relaxed);
        *self.started.lock() = Instant::now();
    }

    /// One-shot snapshot of the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            uptime: self.started.lock().elapsed(),
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the relay counters.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub reconnects: u64,
    pub connected: bool,
    pub uptime: Duration,
}

impl StatsSnapshot {
    /// Total messages that reached a terminal status.
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected
    }

    /// Percentage of accepted messages, 0-100.
    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.accepted as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RelayStats::new();
        stats.record_accepted();
        stats.record_accepted();
        stats.record_rejected();
        stats.record_reconnect();

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.total(), 3);
    }

    #[test]
    fn test_connected_flag() {
        let stats = RelayStats::new();
        assert!(!stats.is_connected());
        stats.set_connected(true);
        assert!(stats.is_connected());
        assert!(stats.snapshot().connected);
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let stats = RelayStats::new();
        stats.record_accepted();
        stats.record_rejected();
        stats.set_connected(true);
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.total(), 0);
        // The connection flag reflects live state, not history.
        assert!(snap.connected);
    }

    #[test]
    fn test_success_rate() {
        let stats = RelayStats::new();
        assert_eq!(stats.snapshot().success_rate(), 0.0);

        stats.record_accepted();
        stats.record_accepted();
        stats.record_accepted();
        stats.record_rejected();
        let rate = stats.snapshot().success_rate();
        assert!((rate - 75.0).abs() < f64::EPSILON);
    }
}
