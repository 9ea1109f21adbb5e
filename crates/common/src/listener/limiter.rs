/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;

/// Two-tier connection limiter: a total cap across the listener and a per-IP
/// cap. Trusted networks (proxies, internal load balancers) bypass the
/// per-IP tier; a `max_per_ip` of 0 disables it entirely.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    pub max_concurrent: u64,
    pub max_per_ip: u64,
    pub concurrent: Arc<AtomicU64>,
    per_ip: Arc<DashMap<IpAddr, u64>>,
}

#[derive(Default)]
pub struct InFlight {
    concurrent: Option<Arc<AtomicU64>>,
    per_ip: Option<(Arc<DashMap<IpAddr, u64>>, IpAddr)>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: u64, max_per_ip: u64) -> Self {
        ConcurrencyLimiter {
            max_concurrent,
            max_per_ip,
            concurrent: Arc::new(0.into()),
            per_ip: Arc::new(DashMap::new()),
        }
    }

    /// Admits a connection from `remote_ip`, registering it against both
    /// tiers. `trusted` connections skip the per-IP cap.
    pub fn is_allowed(&self, remote_ip: IpAddr, trusted: bool) -> Option<InFlight> {
        if self.concurrent.load(Ordering::Relaxed) >= self.max_concurrent {
            return None;
        }

        let per_ip = if self.max_per_ip > 0 && !trusted {
            let mut count = self.per_ip.entry(remote_ip).or_insert(0);
            if *count >= self.max_per_ip {
                return None;
            }
            *count += 1;
            Some((self.per_ip.clone(), remote_ip))
        } else {
            None
        };

        self.concurrent.fetch_add(1, Ordering::Relaxed);
        Some(InFlight {
            concurrent: Some(self.concurrent.clone()),
            per_ip,
        })
    }

    pub fn check_is_allowed(&self, remote_ip: IpAddr, trusted: bool) -> bool {
        if self.concurrent.load(Ordering::Relaxed) >= self.max_concurrent {
            return false;
        }
        if self.max_per_ip > 0 && !trusted {
            if let Some(count) = self.per_ip.get(&remote_ip) {
                if *count >= self.max_per_ip {
                    return false;
                }
            }
        }
        true
    }

    pub fn is_active(&self) -> bool {
        self.concurrent.load(Ordering::Relaxed) > 0
    }

    pub fn connections_for(&self, remote_ip: IpAddr) -> u64 {
        self.per_ip
            .get(&remote_ip)
            .map(|count| *count)
            .unwrap_or(0)
    }
}

impl InFlight {
    pub fn num_concurrent(&self) -> u64 {
        self.concurrent
            .as_ref()
            .map_or(0, |concurrent| concurrent.load(Ordering::Relaxed))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(concurrent) = &self.concurrent {
            concurrent.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some((per_ip, remote_ip)) = &self.per_ip {
            // Drop the entry once the last connection from this IP is gone.
            if let Some(mut count) = per_ip.get_mut(remote_ip) {
                *count = count.saturating_sub(1);
                let empty = *count == 0;
                drop(count);
                if empty {
                    per_ip.remove_if(remote_ip, |_, count| *count == 0);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(value: &str) -> IpAddr {
        value.parse().unwrap()
    }

    #[test]
    fn total_cap() {
        let limiter = ConcurrencyLimiter::new(2, 0);
        let a = limiter.is_allowed(ip("10.0.0.1"), false).unwrap();
        let _b = limiter.is_allowed(ip("10.0.0.2"), false).unwrap();
        assert!(limiter.is_allowed(ip("10.0.0.3"), false).is_none());
        drop(a);
        assert!(limiter.is_allowed(ip("10.0.0.3"), false).is_some());
    }

    #[test]
    fn per_ip_cap() {
        let limiter = ConcurrencyLimiter::new(100, 2);
        let noisy = ip("203.0.113.9");
        let a = limiter.is_allowed(noisy, false).unwrap();
        let _b = limiter.is_allowed(noisy, false).unwrap();
        assert!(limiter.is_allowed(noisy, false).is_none());
        // Other clients are unaffected by the noisy IP's cap.
        assert!(limiter.is_allowed(ip("203.0.113.10"), false).is_some());

        drop(a);
        assert_eq!(limiter.connections_for(noisy), 1);
        assert!(limiter.is_allowed(noisy, false).is_some());
    }

    #[test]
    fn trusted_networks_bypass_per_ip() {
        let limiter = ConcurrencyLimiter::new(100, 1);
        let proxy = ip("10.0.0.5");
        let _a = limiter.is_allowed(proxy, true).unwrap();
        let _b = limiter.is_allowed(proxy, true).unwrap();
        assert!(limiter.is_allowed(proxy, true).is_some());
        // The total cap still applies to trusted sources.
        let strict = ConcurrencyLimiter::new(1, 1);
        let _c = strict.is_allowed(proxy, true).unwrap();
        assert!(strict.is_allowed(proxy, true).is_none());
    }

    #[test]
    fn zero_per_ip_means_unlimited() {
        let limiter = ConcurrencyLimiter::new(10, 0);
        let client = ip("203.0.113.9");
        let _held: Vec<_> = (0..5)
            .map(|_| limiter.is_allowed(client, false).unwrap())
            .collect();
        assert_eq!(limiter.connections_for(client), 0);
    }

    #[test]
    fn release_cleans_up_ip_entries() {
        let limiter = ConcurrencyLimiter::new(10, 4);
        let client = ip("203.0.113.9");
        let a = limiter.is_allowed(client, false).unwrap();
        let b = limiter.is_allowed(client, false).unwrap();
        assert_eq!(limiter.connections_for(client), 2);
        drop(a);
        drop(b);
        assert_eq!(limiter.connections_for(client), 0);
        assert!(!limiter.is_active());
    }
}
