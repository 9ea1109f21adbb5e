/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::ServerProtocol;

/// Process-wide session accounting. Sessions register at accept, update at
/// authentication and deregister at close; the authoritative per-session rows
/// live in `active_connections` and are written by the protocol servers.
#[derive(Default)]
pub struct ConnectionTracker {
    total: AtomicU64,
    authenticated: AtomicU64,
    imap: AtomicU64,
    pop3: AtomicU64,
    lmtp: AtomicU64,
    managesieve: AtomicU64,
    per_user: Mutex<AHashMap<String, u64>>,
    per_domain: Mutex<AHashMap<String, u64>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TrackerSnapshot {
    pub total: u64,
    pub authenticated: u64,
    pub imap: u64,
    pub pop3: u64,
    pub lmtp: u64,
    pub managesieve: u64,
    pub users: usize,
}

impl ConnectionTracker {
    fn counter(&self, protocol: ServerProtocol) -> &AtomicU64 {
        match protocol {
            ServerProtocol::Imap => &self.imap,
            ServerProtocol::Pop3 => &self.pop3,
            ServerProtocol::Lmtp => &self.lmtp,
            ServerProtocol::ManageSieve => &self.managesieve,
        }
    }

    pub fn connected(&self, protocol: ServerProtocol) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.counter(protocol).fetch_add(1, Ordering::Relaxed);
    }

    pub fn authenticated(&self, address: &str) {
        self.authenticated.fetch_add(1, Ordering::Relaxed);
        *self
            .per_user
            .lock()
            .entry(address.to_string())
            .or_insert(0) += 1;
        if let Some((_, domain)) = address.split_once('@') {
            *self
                .per_domain
                .lock()
                .entry(domain.to_string())
                .or_insert(0) += 1;
        }
    }

    pub fn disconnected(&self, protocol: ServerProtocol, address: Option<&str>) {
        self.total.fetch_sub(1, Ordering::Relaxed);
        self.counter(protocol).fetch_sub(1, Ordering::Relaxed);
        if let Some(address) = address {
            self.authenticated.fetch_sub(1, Ordering::Relaxed);
            let mut users = self.per_user.lock();
            if let Some(count) = users.get_mut(address) {
                *count -= 1;
                if *count == 0 {
                    users.remove(address);
                }
            }
            drop(users);
            if let Some((_, domain)) = address.split_once('@') {
                let mut domains = self.per_domain.lock();
                if let Some(count) = domains.get_mut(domain) {
                    *count -= 1;
                    if *count == 0 {
                        domains.remove(domain);
                    }
                }
            }
        }
    }

    pub fn connections_for(&self, address: &str) -> u64 {
        self.per_user.lock().get(address).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            total: self.total.load(Ordering::Relaxed),
            authenticated: self.authenticated.load(Ordering::Relaxed),
            imap: self.imap.load(Ordering::Relaxed),
            pop3: self.pop3.load(Ordering::Relaxed),
            lmtp: self.lmtp.load(Ordering::Relaxed),
            managesieve: self.managesieve.load(Ordering::Relaxed),
            users: self.per_user.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_follow_lifecycle() {
        let tracker = ConnectionTracker::default();
        tracker.connected(ServerProtocol::Imap);
        tracker.connected(ServerProtocol::Imap);
        tracker.authenticated("alice@x.test");
        tracker.authenticated("alice@x.test");

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.imap, 2);
        assert_eq!(snapshot.authenticated, 2);
        assert_eq!(tracker.connections_for("alice@x.test"), 2);

        tracker.disconnected(ServerProtocol::Imap, Some("alice@x.test"));
        tracker.disconnected(ServerProtocol::Imap, Some("alice@x.test"));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.users, 0);
    }
}
