/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicU64, Ordering};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
pub struct NetMetrics {
    pub relay_requests: AtomicU64,
    pub relay_rx_bytes: AtomicU64,
    pub relay_tx_bytes: AtomicU64,
    pub relay_timeouts: AtomicU64,
    pub http_timeouts: AtomicU64,
    pub http_errors: AtomicU64,
    pub sessions_started: AtomicU64,
    pub last_activity_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct NetMetricsSnapshot {
    pub relay_requests: u64,
    pub relay_rx_bytes: u64,
    pub relay_tx_bytes: u64,
    pub relay_timeouts: u64,
    pub http_timeouts: u64,
    pub http_errors: u64,
    pub sessions_started: u64,
    pub last_activity_ms: u64,
}

impl NetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relay_request(&self) {
        self.relay_requests.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn relay_rx_add(&self, n: u64) {
        self.relay_rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn relay_tx_add(&self, n: u64) {
        self.relay_tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// The relay answered with its own `[TIMEOUT]` marker.
    pub fn relay_timeout(&self) {
        self.relay_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_timeout(&self) {
        self.http_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_error(&self) {
        self.http_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetMetricsSnapshot {
        NetMetricsSnapshot {
            relay_requests: self.relay_requests.load(Ordering::Relaxed),
            relay_rx_bytes: self.relay_rx_bytes.load(Ordering::Relaxed),
            relay_tx_bytes: self.relay_tx_bytes.load(Ordering::Relaxed),
            relay_timeouts: self.relay_timeouts.load(Ordering::Relaxed),
            http_timeouts: self.http_timeouts.load(Ordering::Relaxed),
            http_errors: self.http_errors.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }
}
