//! Server metrics.
//!
//! Counters are plain atomics updated from the dispatcher and the transfer
//! engine; a snapshot renders them as JSON for health endpoints and
//! operator tooling.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Monitor {
    started: Instant,
    total_transfers: AtomicU64,
    successful_transfers: AtomicU64,
    failed_transfers: AtomicU64,
    bytes_transferred: AtomicU64,
    total_transfer_ms: AtomicU64,
    total_connections: AtomicU64,
    failed_connections: AtomicU64,
    active_transfers: AtomicUsize,
    peak_transfers: AtomicUsize,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_transfers: u64,
    pub successful_transfers: u64,
    pub failed_transfers: u64,
    pub bytes_transferred: u64,
    pub average_transfer_ms: u64,
    pub total_connections: u64,
    pub failed_connections: u64,
    pub active_transfers: usize,
    pub peak_transfers: usize,
    pub errors: u64,
    pub timeouts: u64,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_transfers: AtomicU64::new(0),
            successful_transfers: AtomicU64::new(0),
            failed_transfers: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            total_transfer_ms: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            failed_connections: AtomicU64::new(0),
            active_transfers: AtomicUsize::new(0),
            peak_transfers: AtomicUsize::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn record_transfer(&self, bytes: u64, success: bool, duration_ms: u64) {
        self.total_transfers.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_transfers.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_transfers.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.total_transfer_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_connection(&self, success: bool) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_active(&self, count: usize) {
        self.active_transfers.store(count, Ordering::Relaxed);
        self.peak_transfers.fetch_max(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_transfers.load(Ordering::Relaxed);
        let total_ms = self.total_transfer_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            total_transfers: total,
            successful_transfers: self.successful_transfers.load(Ordering::Relaxed),
            failed_transfers: self.failed_transfers.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            average_transfer_ms: if total > 0 { total_ms / total } else { 0 },
            total_connections: self.total_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            active_transfers: self.active_transfers.load(Ordering::Relaxed),
            peak_transfers: self.peak_transfers.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}
