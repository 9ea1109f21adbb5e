/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{borrow::Cow, sync::Arc, time::Duration};

pub mod blob;
pub mod circuit;
pub mod model;
pub mod postgres;
pub mod retry;

pub use model::*;
pub use postgres::{
    messages::{ExpungeResult, FlagsOp, FlagsUpdate},
    search::{SearchNode, SortField, SortKey},
    PgConfig, PgStore,
};

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by the whole data plane. Protocol layers map kinds
/// onto their own wire responses; the retry layer only ever replays
/// `Transient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    UniqueViolation,
    Unauthorized,
    Forbidden,
    Malformed,
    QuotaExceeded,
    RateLimited,
    /// Retryable: connection loss, serialization failure, lock timeout,
    /// open circuit, S3 5xx.
    Transient,
    /// Non-retryable internal failure.
    Permanent,
    Cancelled,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::AlreadyExists, message)
    }

    pub fn unique_violation(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::UniqueViolation, message)
    }

    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::Forbidden, message)
    }

    pub fn malformed(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::Malformed, message)
    }

    pub fn quota_exceeded(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::QuotaExceeded, message)
    }

    pub fn rate_limited(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::RateLimited, message)
    }

    pub fn transient(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::Transient, message)
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::Permanent, message)
    }

    pub fn cancelled() -> Self {
        Error::new(ErrorKind::Cancelled, "Operation cancelled")
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound)
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.kind, ErrorKind::Unauthorized)
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, ErrorKind::UniqueViolation)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

/// Resilient facade over the Postgres store: every operation is retried with
/// bounded backoff while the error is `Transient`, behind a circuit breaker
/// that short-circuits a persistently failing database.
#[derive(Clone)]
pub struct Store {
    pub(crate) pg: Arc<postgres::PgStore>,
    pub(crate) breaker: Arc<circuit::CircuitBreaker>,
    pub(crate) retry: retry::RetryPolicy,
}

impl Store {
    pub fn new(pg: postgres::PgStore) -> Self {
        Store {
            pg: Arc::new(pg),
            breaker: Arc::new(circuit::CircuitBreaker::new(
                20,
                0.6,
                Duration::from_secs(30),
            )),
            retry: retry::RetryPolicy::default(),
        }
    }

    /// Direct access for callers that manage their own transaction scope
    /// (the uploader claim loop, CLI maintenance).
    pub fn pg(&self) -> &postgres::PgStore {
        &self.pg
    }

    pub fn is_available(&self) -> bool {
        self.breaker.is_closed()
    }

    pub(crate) async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.breaker.allow() {
            return Err(Error::transient("Database unavailable"));
        }
        let result = self.retry.run(op).await;
        // Only infrastructure failures trip the breaker; application errors
        // such as NotFound count as healthy round-trips.
        self.breaker
            .record(matches!(&result, Err(err) if err.is_transient()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert!(Error::transient("db down").is_transient());
        assert!(!Error::not_found("missing").is_transient());
        assert!(Error::unauthorized("nope").is_unauthorized());
    }
}
