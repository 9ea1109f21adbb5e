/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::config::AuthConfig;

/// Tracks authentication failures per (IP, username) pair and recent attempts
/// per IP. The delay for attempt `k` doubles per consecutive failure until a
/// success resets it.
pub struct AuthLimiter {
    failures: DashMap<(IpAddr, String), FailureEntry>,
    attempts: DashMap<IpAddr, AttemptWindow>,
    max_attempts: u32,
    window: Duration,
    delay_base: Duration,
    delay_max: Duration,
}

struct FailureEntry {
    consecutive: u32,
    last_attempt: Instant,
}

struct AttemptWindow {
    count: u32,
    window_start: Instant,
}

impl AuthLimiter {
    pub fn new(config: &AuthConfig) -> Self {
        AuthLimiter {
            failures: DashMap::new(),
            attempts: DashMap::new(),
            max_attempts: config.max_attempts_per_ip,
            window: config.attempt_window,
            delay_base: config.delay_base,
            delay_max: config.delay_max,
        }
    }

    /// Counts the attempt against the per-IP window; false when the cap is hit.
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        let mut entry = self.attempts.entry(ip).or_insert_with(|| AttemptWindow {
            count: 0,
            window_start: Instant::now(),
        });
        if entry.window_start.elapsed() > self.window {
            entry.count = 0;
            entry.window_start = Instant::now();
        }
        entry.count += 1;
        entry.count <= self.max_attempts
    }

    /// Progressive delay for this (IP, user) pair, if any failures are on
    /// record.
    pub fn delay(&self, ip: IpAddr, username: &str) -> Option<Duration> {
        let entry = self.failures.get(&(ip, username.to_string()))?;
        if entry.consecutive == 0 {
            return None;
        }
        let factor = 1u32 << entry.consecutive.min(16).saturating_sub(1);
        Some((self.delay_base * factor).min(self.delay_max))
    }

    pub fn record_failure(&self, ip: IpAddr, username: &str) {
        let mut entry = self
            .failures
            .entry((ip, username.to_string()))
            .or_insert_with(|| FailureEntry {
                consecutive: 0,
                last_attempt: Instant::now(),
            });
        entry.consecutive += 1;
        entry.last_attempt = Instant::now();
    }

    pub fn record_success(&self, ip: IpAddr, username: &str) {
        self.failures.remove(&(ip, username.to_string()));
    }

    /// Drops idle entries; run from the maintenance loop.
    pub fn cleanup(&self) {
        let window = self.window;
        self.failures
            .retain(|_, entry| entry.last_attempt.elapsed() < window * 2);
        self.attempts
            .retain(|_, entry| entry.window_start.elapsed() < window * 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> AuthLimiter {
        AuthLimiter::new(&AuthConfig {
            max_attempts_per_ip: 3,
            attempt_window: Duration::from_secs(60),
            delay_base: Duration::from_millis(100),
            delay_max: Duration::from_millis(400),
            ..Default::default()
        })
    }

    #[test]
    fn per_ip_cap() {
        let limiter = limiter();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        assert!(limiter.is_allowed(ip));
        assert!(limiter.is_allowed(ip));
        assert!(limiter.is_allowed(ip));
        assert!(!limiter.is_allowed(ip));
    }

    #[test]
    fn progressive_delay_monotonic() {
        let limiter = limiter();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        assert!(limiter.delay(ip, "alice").is_none());

        let mut last = Duration::ZERO;
        for _ in 0..5 {
            limiter.record_failure(ip, "alice");
            let delay = limiter.delay(ip, "alice").unwrap();
            assert!(delay >= last, "delay must never decrease");
            assert!(delay <= Duration::from_millis(400));
            last = delay;
        }

        limiter.record_success(ip, "alice");
        assert!(limiter.delay(ip, "alice").is_none());
    }
}
