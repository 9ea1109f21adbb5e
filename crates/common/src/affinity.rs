/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::ServerProtocol;

/// In-process backend affinity hints shared by all proxies. Never a source of
/// truth: a miss or an expired entry simply falls back to pre-lookup routing.
pub struct AffinityCache {
    entries: DashMap<(String, ServerProtocol), Entry>,
    ttl: Duration,
}

struct Entry {
    backend: SocketAddr,
    stored_at: Instant,
}

impl AffinityCache {
    pub fn new(ttl: Duration) -> Self {
        AffinityCache {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, username: &str, protocol: ServerProtocol) -> Option<SocketAddr> {
        let key = (username.to_string(), protocol);
        let entry = self.entries.get(&key)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.backend)
        } else {
            drop(entry);
            self.entries.remove(&key);
            None
        }
    }

    pub fn set(&self, username: &str, protocol: ServerProtocol, backend: SocketAddr) {
        self.entries.insert(
            (username.to_string(), protocol),
            Entry {
                backend,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, username: &str, protocol: ServerProtocol) {
        self.entries.remove(&(username.to_string(), protocol));
    }

    pub fn cleanup(&self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| entry.stored_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry() {
        let cache = AffinityCache::new(Duration::from_millis(10));
        let backend: SocketAddr = "10.0.0.1:143".parse().unwrap();
        cache.set("alice@x.test", ServerProtocol::Imap, backend);
        assert_eq!(
            cache.get("alice@x.test", ServerProtocol::Imap),
            Some(backend)
        );
        assert_eq!(cache.get("alice@x.test", ServerProtocol::Pop3), None);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("alice@x.test", ServerProtocol::Imap), None);
        cache.cleanup();
        assert!(cache.is_empty());
    }
}
