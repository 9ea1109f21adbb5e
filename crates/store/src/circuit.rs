/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Rolling-window circuit breaker. Opens when the failure ratio over the last
/// `window` outcomes reaches `threshold`; after `cooldown` a single half-open
/// probe is admitted.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    window: usize,
    threshold: f64,
    cooldown: Duration,
}

struct Inner {
    outcomes: VecDeque<bool>,
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(window: usize, threshold: f64, cooldown: Duration) -> Self {
        CircuitBreaker {
            inner: Mutex::new(Inner {
                outcomes: VecDeque::with_capacity(window),
                state: State::Closed,
            }),
            window,
            threshold,
            cooldown,
        }
    }

    /// Whether a call may proceed. In the open state this flips to half-open
    /// once the cooldown elapsed, admitting exactly one probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    inner.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record(&self, failure: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::HalfOpen => {
                if failure {
                    inner.state = State::Open {
                        since: Instant::now(),
                    };
                } else {
                    inner.state = State::Closed;
                    inner.outcomes.clear();
                }
                return;
            }
            State::Open { .. } => return,
            State::Closed => (),
        }

        if inner.outcomes.len() == self.window {
            inner.outcomes.pop_front();
        }
        inner.outcomes.push_back(failure);

        if inner.outcomes.len() == self.window {
            let failures = inner.outcomes.iter().filter(|&&f| f).count();
            if failures as f64 / self.window as f64 >= self.threshold {
                inner.state = State::Open {
                    since: Instant::now(),
                };
                tracing::warn!(
                    context = "store",
                    event = "circuit-open",
                    failures = failures,
                    window = self.window,
                    "Circuit breaker opened."
                );
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.inner.lock().state, State::Closed | State::HalfOpen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_at_threshold_and_probes() {
        let breaker = CircuitBreaker::new(5, 0.6, Duration::from_millis(10));
        for _ in 0..2 {
            breaker.record(false);
        }
        for _ in 0..3 {
            breaker.record(true);
        }
        assert!(!breaker.allow(), "60% failures over the window must open");

        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow(), "cooldown elapsed, half-open probe allowed");

        // Successful probe closes the breaker again.
        breaker.record(false);
        assert!(breaker.is_closed());
        assert!(breaker.allow());
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(2, 0.5, Duration::from_millis(5));
        breaker.record(true);
        breaker.record(true);
        assert!(!breaker.allow());

        std::thread::sleep(Duration::from_millis(10));
        assert!(breaker.allow());
        breaker.record(true);
        assert!(!breaker.allow());
    }
}
