use crate::auth::{bearer_token, Authenticator};
use crate::backend::{FixedWindowInput, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW};
use actix_web::dev::ServiceRequest;
use actix_web::HttpMessage;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::time::Duration;

pub type IdentityInputFuture = Ready<Result<FixedWindowInput, actix_web::Error>>;

/// Builds the input function for the [RateLimiter](crate::RateLimiter) middleware that keys each
/// window by the caller's authenticated identity.
///
/// The produced function authenticates the bearer token and stores the resulting
/// [Identity](crate::auth::Identity) in the request extensions, so handlers can read it with
/// `web::ReqData<Identity>`. Requests that fail authentication are answered with
/// 401 before any window is touched.
pub struct IdentityInputBuilder {
    interval: Duration,
    max_requests: u64,
    authenticator: Arc<dyn Authenticator>,
    key_prefix: Option<String>,
}

impl IdentityInputBuilder {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            interval: DEFAULT_WINDOW,
            max_requests: DEFAULT_MAX_REQUESTS,
            authenticator,
            key_prefix: None,
        }
    }

    /// Override the window length (one hour by default).
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Override the requests admitted per window (10 by default).
    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Namespace the windows, for when one backend is shared by several limiters.
    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = Some(prefix.to_owned());
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> IdentityInputFuture + 'static {
        move |req| {
            let input = || -> Result<FixedWindowInput, actix_web::Error> {
                let token = bearer_token(req.request())?;
                let identity = self.authenticator.authenticate(token)?;
                let key = match &self.key_prefix {
                    Some(prefix) => format!("{prefix}:{}", identity.subject()),
                    None => identity.subject().to_owned(),
                };
                req.extensions_mut().insert(identity);
                Ok(FixedWindowInput {
                    interval: self.interval,
                    max_requests: self.max_requests,
                    key,
                })
            };
            ready(input())
        }
    }
}
