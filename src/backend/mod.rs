mod input_builder;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

pub use input_builder::{IdentityInputBuilder, IdentityInputFuture};
use std::future::Future;

use crate::HeaderCompatibleOutput;
use actix_web::rt::time::Instant;
use std::time::Duration;

/// The default number of requests admitted per identity within one window.
pub const DEFAULT_MAX_REQUESTS: u64 = 10;

/// The default fixed window length (one hour).
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// A store of per-identity admission counters.
///
/// A Backend must be [Clone]; clones share the same counters, which usually means the state
/// lives behind an [Arc](std::sync::Arc). Each clone is handed to the
/// [RateLimiter](crate::RateLimiter) middleware, so tests can build independent instances and
/// a server can share a single instance across workers.
pub trait Backend<I: 'static = FixedWindowInput>: Clone {
    type Output;
    type RollbackToken;
    type Error;

    /// Check the input against its window and consume one admission if allowed.
    ///
    /// Returns the decision, output describing the window state, and a token that can be passed
    /// to [Backend::rollback()] to give the admission back.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<(Decision, Self::Output, Self::RollbackToken), Self::Error>>;

    /// Give back an admission that was granted by [Backend::request()].
    ///
    /// Used when a request is rejected by the handler before it performed any downstream work.
    /// The request has already been allowed at this point, so a failure here can only be
    /// logged.
    fn rollback(&self, token: Self::RollbackToken)
        -> impl Future<Output = Result<(), Self::Error>>;
}

/// Input to a fixed window [Backend].
#[derive(Debug, Clone)]
pub struct FixedWindowInput {
    /// Length of the fixed window.
    pub interval: Duration,
    /// Requests admitted per identity within the window.
    pub max_requests: u64,
    /// Authenticated identity the window belongs to.
    pub key: String,
}

/// Window state returned by a fixed window [Backend].
#[derive(Debug, Clone)]
pub struct FixedWindowOutput {
    /// Requests admitted per window.
    pub limit: u64,
    /// Requests still admitted before the window resets.
    pub remaining: u64,
    /// Instant at which the window resets.
    pub reset: Instant,
}

/// Additional functions for a [Backend] that uses [FixedWindowInput] and [FixedWindowOutput].
pub trait FixedWindowBackend: Backend<FixedWindowInput, Output = FixedWindowOutput> {
    /// Discard the window of a given identity, so its next request opens a fresh window.
    fn remove_key(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;
}

impl HeaderCompatibleOutput for FixedWindowOutput {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Seconds until the window resets, rounded upwards so that waiting this long is always
    /// enough.
    fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn test_seconds_until_reset() {
        tokio::time::pause();
        let output = FixedWindowOutput {
            limit: 0,
            remaining: 0,
            reset: Instant::now() + DEFAULT_WINDOW,
        };
        tokio::time::advance(Duration::from_secs_f64(3599.2)).await;
        // 0.8 seconds left is reported as a whole second
        assert_eq!(output.seconds_until_reset(), 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(output.seconds_until_reset(), 0);
    }

    #[test]
    fn test_decision() {
        assert!(Decision::from_allowed(true).is_allowed());
        assert!(Decision::from_allowed(false).is_denied());
    }
}
