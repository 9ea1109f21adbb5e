/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::Duration;

use rand::Rng;

use crate::Result;

/// Bounded exponential backoff with jitter, replaying only transient errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        // Up to 25% jitter to avoid thundering retries.
        let jitter = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 4);
        exp + Duration::from_millis(jitter)
    }

    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    tracing::debug!(
                        context = "store",
                        event = "retry",
                        attempt = attempt,
                        reason = %err,
                        "Retrying transient failure."
                    );
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn replays_transient_until_budget() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let result: crate::Result<()> = policy
            .run(|| async {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(Error::transient("down"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn does_not_replay_permanent() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: crate::Result<()> = policy
            .run(|| async {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(Error::not_found("missing"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn backoff_is_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            assert!(policy.backoff(attempt) <= policy.max_delay + policy.max_delay / 4);
        }
    }
}
