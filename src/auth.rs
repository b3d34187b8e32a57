//! Bearer token authentication.
//!
//! Every request to the analysis function must carry `Authorization: Bearer <token>`. The token
//! is resolved to an [Identity] before any rate limit quota or downstream call is spent.

use actix_web::dev::Payload;
use actix_web::http::header::AUTHORIZATION;
use actix_web::http::StatusCode;
use actix_web::{web, FromRequest, HttpMessage, HttpRequest, HttpResponse, ResponseError};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::{ready, Ready};
use thiserror::Error;

/// The authenticated subject a request acts on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self(subject.into())
    }

    pub fn subject(&self) -> &str {
        &self.0
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reuses the identity established by the rate limiter's input function when there is one,
/// otherwise authenticates with the `web::Data<dyn Authenticator>` registered on the app.
impl FromRequest for Identity {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        if let Some(identity) = req.extensions().get::<Identity>() {
            return ready(Ok(identity.clone()));
        }
        let Some(authenticator) = req.app_data::<web::Data<dyn Authenticator>>() else {
            log::error!("No authenticator registered for {}", req.path());
            return ready(Err(actix_web::error::ErrorInternalServerError(
                "Authentication is not configured",
            )));
        };
        ready(
            bearer_token(req)
                .and_then(|token| authenticator.authenticate(token))
                .map_err(actix_web::Error::from),
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingToken,
    #[error("Authorization header must use the Bearer scheme")]
    MalformedHeader,
    #[error("Invalid or expired token")]
    InvalidToken,
}

impl ResponseError for AuthError {
    fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

/// Resolves a bearer token to the identity it was issued to.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// An [Authenticator] backed by a fixed table of tokens.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Identity>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Token entry {0:?} must have the form <subject>:<token>")]
pub struct InvalidTokenEntry(String);

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, subject: &str, token: &str) -> Self {
        self.tokens.insert(token.to_owned(), Identity::new(subject));
        self
    }

    /// Parse a comma separated list of `<subject>:<token>` pairs.
    pub fn parse(entries: &str) -> Result<Self, InvalidTokenEntry> {
        entries
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .try_fold(Self::new(), |auth, entry| match entry.split_once(':') {
                Some((subject, token)) if !subject.is_empty() && !token.is_empty() => {
                    Ok(auth.with_token(subject.trim(), token.trim()))
                }
                _ => Err(InvalidTokenEntry(entry.to_owned())),
            })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(req: &HttpRequest) -> Result<&str, AuthError> {
    let value = req
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;
    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or(AuthError::MalformedHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MalformedHeader);
    }
    match token.trim() {
        "" => Err(AuthError::MalformedHeader),
        token => Ok(token),
    }
}
