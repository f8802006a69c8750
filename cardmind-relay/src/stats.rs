//! Relay-wide counters.
//!
//! Updated from connection tasks and session tasks alike, so every field is
//! an atomic and the hot path never takes a lock. Read via [`RelayStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_fanned_out: u64,
    pub connections_dropped: u64,
    pub protocol_errors: u64,
    pub persisted_updates: u64,
    pub persistence_failures: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
}

#[derive(Debug, Default)]
pub struct RelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    frames_fanned_out: AtomicU64,
    connections_dropped: AtomicU64,
    protocol_errors: AtomicU64,
    persisted_updates: AtomicU64,
    persistence_failures: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a close without a matching open must not wrap.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn frame_received(&self, len: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn frames_fanned_out(&self, count: u64) {
        self.frames_fanned_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn connection_dropped(&self) {
        self.connections_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_persisted(&self) {
        self.persisted_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persistence_failed(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_fanned_out: self.frames_fanned_out.load(Ordering::Relaxed),
            connections_dropped: self.connections_dropped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            persisted_updates: self.persisted_updates.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
        }
    }
}
