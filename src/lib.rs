#![cfg_attr(docsrs, feature(doc_cfg))]
//! An authenticated, rate limited analysis endpoint for actix-web.
//!
//! Requests are authenticated by bearer token, counted against a per identity fixed window by
//! the [RateLimiter] middleware, and forwarded to a chat completion API. Successful analyses are
//! kept in a quota managed history store that evicts the oldest entries as it fills up.

pub mod analyze;
pub mod auth;
pub mod backend;
pub mod completion;
pub mod config;
mod middleware;
pub mod storage;

pub use middleware::builder::{HeaderCompatibleOutput, RateLimiterBuilder};
pub use middleware::RateLimiter;
