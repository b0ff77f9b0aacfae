//! Pool statistics types

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of a connection pool's state and lifetime counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Open connections, idle and in use
    total: usize,
    /// Connections waiting in the idle queue
    idle: usize,
    /// Connections checked out by callers
    in_use: usize,
    /// Callers currently waiting for a connection
    waiting: usize,
    /// Acquires served from the idle queue
    hits: u64,
    /// Acquires that had to dial a new connection
    misses: u64,
    /// Acquires that gave up waiting for capacity
    timeouts: u64,
    /// Idle connections evicted for exceeding the idle timeout or max age
    stale_conns: u64,
    /// Dial attempts that failed
    dial_failures: u64,
}

impl PoolStats {
    /// Get the total number of connections
    pub fn total(&self) -> usize {
        self.total
    }

    /// Get the number of idle connections
    pub fn idle(&self) -> usize {
        self.idle
    }

    /// Get the number of connections currently in use
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Get the number of waiting callers
    pub fn waiting(&self) -> usize {
        self.waiting
    }

    /// Get the number of acquires served from the idle queue
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Get the number of acquires that dialed a new connection
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Get the number of acquires that timed out or were cancelled
    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    /// Get the number of stale connections evicted
    pub fn stale_conns(&self) -> u64 {
        self.stale_conns
    }

    /// Get the number of failed dial attempts
    pub fn dial_failures(&self) -> u64 {
        self.dial_failures
    }

    /// Calculate pool utilization as a percentage (0.0 to 1.0)
    ///
    /// Returns 0.0 if total is 0 to avoid division by zero.
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.in_use as f64 / self.total as f64
        }
    }

    /// Check if the pool is fully utilized (all connections in use)
    pub fn is_full(&self) -> bool {
        self.idle == 0 && self.total > 0
    }
}

/// Lock-free lifetime counters, folded into [`PoolStats`] snapshots.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale_conns: AtomicU64,
    dial_failures: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self, count: usize) {
        self.stale_conns.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, total: usize, idle: usize, in_use: usize, waiting: usize) -> PoolStats {
        PoolStats {
            total,
            idle,
            in_use,
            waiting,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            stale_conns: self.stale_conns.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
        }
    }
}
