use crate::backend::Backend;
use crate::middleware::{AllowedTransformation, DeniedResponse, RateLimiter, RollbackCondition};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::future::Future;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

pub const RATE_LIMITED_MESSAGE: &str = "Rate limit exceeded. Try again later.";

pub struct RateLimiterBuilder<BE, BO, F> {
    backend: BE,
    input_fn: F,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation<BO>>>,
    denied_response: Rc<DeniedResponse<BO>>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<BE, BI, BO, F, O> RateLimiterBuilder<BE, BO, F>
where
    BE: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    pub(super) fn new(backend: BE, input_fn: F) -> Self {
        Self {
            backend,
            input_fn,
            fail_open: false,
            allowed_transformation: None,
            denied_response: Rc::new(|_: &BO| rate_limited(None)),
            rollback_condition: None,
        }
    }

    /// Choose whether to allow a request if the backend returns a failure.
    ///
    /// Default is false.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Report the window state to clients:
    ///
    /// - `x-ratelimit-limit`
    /// - `x-ratelimit-remaining`
    /// - `x-ratelimit-reset` (seconds until the reset)
    /// - `retry-after` (denied only, seconds until the reset)
    ///
    /// The denied response body also carries `retryAfter`, so clients can tell a rate limit
    /// rejection apart from any other failure and schedule a retry.
    pub fn add_headers(mut self) -> Self
    where
        BO: HeaderCompatibleOutput,
    {
        self.allowed_transformation = Some(Rc::new(|map: &mut HeaderMap, output: Option<&BO>| {
            if let Some(status) = output {
                insert_window_headers(map, status);
            }
        }));
        self.denied_response = Rc::new(|status: &BO| {
            let seconds = status.seconds_until_reset();
            let mut response = rate_limited(Some(seconds));
            let map = response.headers_mut();
            insert_window_headers(map, status);
            map.insert(RETRY_AFTER, HeaderValue::from(seconds));
            response
        });
        self
    }

    /// Mutate the response headers of allowed requests.
    ///
    /// The output is [None] if the backend failed and [RateLimiterBuilder::fail_open] is
    /// enabled.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&BO>) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation<BO>>);
        self
    }

    /// Configure the [HttpResponse] returned for denied requests.
    ///
    /// Defaults to status 429 with a JSON error body.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&BO) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    /// Give the admission back when the wrapped service answers with a status matching the
    /// condition.
    ///
    /// By default admissions are never given back.
    pub fn rollback_condition<C>(mut self, condition: Option<C>) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.rollback_condition = condition.map(|m| Rc::new(m) as Rc<RollbackCondition>);
        self
    }

    /// Give the admission back for requests the service rejected as invalid before doing any
    /// work: 400, 403 and 422.
    pub fn rollback_rejected_requests(mut self) -> Self {
        self.rollback_condition = Some(Rc::new(|status: StatusCode| {
            matches!(
                status,
                StatusCode::BAD_REQUEST
                    | StatusCode::FORBIDDEN
                    | StatusCode::UNPROCESSABLE_ENTITY
            )
        }));
        self
    }

    pub fn build(self) -> RateLimiter<BE, BO, F> {
        RateLimiter {
            backend: self.backend,
            input_fn: Rc::new(self.input_fn),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation,
            denied_response: self.denied_response,
            rollback_condition: self.rollback_condition,
        }
    }
}

fn rate_limited(retry_after: Option<u64>) -> HttpResponse {
    let body = match retry_after {
        Some(seconds) => serde_json::json!({
            "error": RATE_LIMITED_MESSAGE,
            "retryAfter": seconds,
        }),
        None => serde_json::json!({ "error": RATE_LIMITED_MESSAGE }),
    };
    HttpResponse::TooManyRequests().json(body)
}

fn insert_window_headers<BO: HeaderCompatibleOutput>(map: &mut HeaderMap, status: &BO) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit()));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(status.remaining()),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(status.seconds_until_reset()),
    );
}

/// A trait that a [Backend::Output] should implement in order to use the
/// [RateLimiterBuilder::add_headers] function.
pub trait HeaderCompatibleOutput {
    /// Value for the `x-ratelimit-limit` header.
    fn limit(&self) -> u64;

    /// Value for the `x-ratelimit-remaining` header.
    fn remaining(&self) -> u64;

    /// Value for the `x-ratelimit-reset` and `retry-after` headers.
    ///
    /// This should be the number of seconds from now until the limit resets.\
    /// If the limit has already reset this should return 0.
    fn seconds_until_reset(&self) -> u64;
}
