/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ServerProtocol;

/// Process-wide counters sampled by the maintenance task. Anything beyond an
/// in-process snapshot (scrape endpoints etc.) is outside this crate.
#[derive(Default)]
pub struct Metrics {
    connections: [AtomicU64; 4],
    auth_success: [AtomicU64; 4],
    auth_failure: [AtomicU64; 4],
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    uploads_completed: AtomicU64,
    uploads_failed: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub connections_imap: u64,
    pub connections_pop3: u64,
    pub connections_lmtp: u64,
    pub connections_managesieve: u64,
    pub auth_success: u64,
    pub auth_failure: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub uploads_completed: u64,
    pub uploads_failed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

fn idx(protocol: ServerProtocol) -> usize {
    match protocol {
        ServerProtocol::Imap => 0,
        ServerProtocol::Pop3 => 1,
        ServerProtocol::Lmtp => 2,
        ServerProtocol::ManageSieve => 3,
    }
}

impl Metrics {
    pub fn connection_accepted(&self, protocol: ServerProtocol) {
        self.connections[idx(protocol)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_success(&self, protocol: ServerProtocol) {
        self.auth_success[idx(protocol)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failure(&self, protocol: ServerProtocol) {
        self.auth_failure[idx(protocol)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery(&self, success: bool) {
        if success {
            self.deliveries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn upload(&self, success: bool) {
        if success {
            self.uploads_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.uploads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_bytes_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_imap: self.connections[0].load(Ordering::Relaxed),
            connections_pop3: self.connections[1].load(Ordering::Relaxed),
            connections_lmtp: self.connections[2].load(Ordering::Relaxed),
            connections_managesieve: self.connections[3].load(Ordering::Relaxed),
            auth_success: self.auth_success.iter().map(|c| c.load(Ordering::Relaxed)).sum(),
            auth_failure: self.auth_failure.iter().map(|c| c.load(Ordering::Relaxed)).sum(),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            uploads_completed: self.uploads_completed.load(Ordering::Relaxed),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}
