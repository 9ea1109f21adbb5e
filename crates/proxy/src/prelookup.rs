/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use common::config::PrelookupConfig;
use parking_lot::RwLock;
use serde::Deserialize;
use store::circuit::CircuitBreaker;

/// HTTP authentication pre-lookup with positive/negative caching and a
/// circuit breaker. An open circuit reports `Transient` so callers degrade
/// gracefully instead of hammering a failing endpoint.
pub struct PrelookupClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    cache: RwLock<Cache>,
    breaker: CircuitBreaker,
    positive_ttl: Duration,
    negative_ttl: Duration,
    max_entries: usize,
}

#[derive(Default)]
struct Cache {
    entries: ahash::AHashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

struct CacheEntry {
    result: AuthResult,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
pub enum AuthResult {
    Authenticated(RoutingEntry),
    UserNotFound,
    Failed,
    Transient,
}

#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub address: String,
    pub password_hash: String,
    pub backend: Option<SocketAddr>,
}

#[derive(Deserialize)]
struct LookupResponse {
    status: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    password_hash: Option<String>,
    #[serde(default)]
    backend: Option<String>,
}

impl PrelookupClient {
    pub fn new(config: PrelookupConfig) -> Self {
        PrelookupClient {
            http: reqwest::Client::builder()
                .timeout(config.timeout)
                .build()
                .unwrap_or_default(),
            url: config.url,
            token: config.token,
            cache: RwLock::new(Cache::default()),
            breaker: CircuitBreaker::new(
                config.breaker_window,
                0.6,
                config.breaker_cooldown,
            ),
            positive_ttl: config.positive_ttl,
            negative_ttl: config.negative_ttl,
            max_entries: config.cache_max_entries,
        }
    }

    pub async fn lookup(&self, username: &str) -> AuthResult {
        if let Some(cached) = self.cache_get(username) {
            return cached;
        }

        if !self.breaker.allow() {
            return AuthResult::Transient;
        }

        let result = self.fetch(username).await;
        self.breaker
            .record(matches!(result, AuthResult::Transient));
        // Transient outcomes are never cached; negatives get the short TTL.
        match &result {
            AuthResult::Authenticated(_) => {
                self.cache_put(username, result.clone(), self.positive_ttl)
            }
            AuthResult::UserNotFound | AuthResult::Failed => {
                self.cache_put(username, result.clone(), self.negative_ttl)
            }
            AuthResult::Transient => (),
        }
        result
    }

    async fn fetch(&self, username: &str) -> AuthResult {
        let mut request = self.http.get(&self.url).query(&[("address", username)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(context = "prelookup", event = "error", reason = %err,
                    "Pre-lookup request failed.");
                return AuthResult::Transient;
            }
        };
        if response.status().is_server_error() {
            return AuthResult::Transient;
        }
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return AuthResult::UserNotFound;
        }
        let body: LookupResponse = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(context = "prelookup", event = "error", reason = %err,
                    "Pre-lookup returned an invalid body.");
                return AuthResult::Transient;
            }
        };

        match body.status.as_str() {
            "ok" | "authenticated" => match (body.address, body.password_hash) {
                (Some(address), Some(password_hash)) => {
                    AuthResult::Authenticated(RoutingEntry {
                        address,
                        password_hash,
                        backend: body.backend.and_then(|backend| backend.parse().ok()),
                    })
                }
                _ => AuthResult::Transient,
            },
            "not_found" => AuthResult::UserNotFound,
            "failed" | "denied" => AuthResult::Failed,
            _ => AuthResult::Transient,
        }
    }

    fn cache_get(&self, username: &str) -> Option<AuthResult> {
        let mut cache = self.cache.write();
        let hit = match cache.entries.get(username) {
            Some(entry) if entry.expires_at > Instant::now() => Some(Some(entry.result.clone())),
            Some(_) => {
                cache.entries.remove(username);
                None
            }
            None => None,
        };
        match hit {
            Some(result) => {
                cache.hits += 1;
                result
            }
            None => {
                cache.misses += 1;
                None
            }
        }
    }

    fn cache_put(&self, username: &str, result: AuthResult, ttl: Duration) {
        let mut cache = self.cache.write();
        // Oldest-expiry eviction above the size cap.
        if cache.entries.len() >= self.max_entries {
            if let Some(oldest) = cache
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone())
            {
                cache.entries.remove(&oldest);
            }
        }
        cache.entries.insert(
            username.to_string(),
            CacheEntry {
                result,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Periodic cleanup of expired entries; run from the maintenance loop.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.cache
            .write()
            .entries
            .retain(|_, entry| entry.expires_at > now);
    }

    pub fn stats(&self) -> (u64, u64, usize) {
        let cache = self.cache.read();
        (cache.hits, cache.misses, cache.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(max_entries: usize) -> PrelookupClient {
        PrelookupClient::new(PrelookupConfig {
            url: "http://127.0.0.1:0/lookup".to_string(),
            token: None,
            timeout: Duration::from_millis(10),
            positive_ttl: Duration::from_secs(60),
            negative_ttl: Duration::from_millis(20),
            cache_max_entries: max_entries,
            breaker_window: 4,
            breaker_cooldown: Duration::from_secs(1),
        })
    }

    #[test]
    fn negative_entries_expire_sooner() {
        let client = client(10);
        client.cache_put("alice", AuthResult::UserNotFound, client.negative_ttl);
        assert!(matches!(
            client.cache_get("alice"),
            Some(AuthResult::UserNotFound)
        ));
        std::thread::sleep(Duration::from_millis(30));
        assert!(client.cache_get("alice").is_none());
    }

    #[test]
    fn size_cap_evicts_oldest_expiry() {
        let client = client(2);
        client.cache_put("a", AuthResult::Failed, Duration::from_millis(10));
        client.cache_put("b", AuthResult::Failed, Duration::from_secs(60));
        client.cache_put("c", AuthResult::Failed, Duration::from_secs(60));
        let (_, _, size) = client.stats();
        assert_eq!(size, 2);
        assert!(matches!(client.cache_get("b"), Some(AuthResult::Failed)));
        assert!(matches!(client.cache_get("c"), Some(AuthResult::Failed)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient_and_trips_breaker() {
        let client = client(10);
        for _ in 0..4 {
            assert!(matches!(
                client.lookup("alice").await,
                AuthResult::Transient
            ));
        }
        // The breaker is open now; no request is attempted.
        assert!(!client.breaker.allow() || matches!(
            client.lookup("alice").await,
            AuthResult::Transient
        ));
    }
}
