#![deny(missing_docs)]

//! Networking utilities for the Google Maps web services, specifically retrying
//! and signing requests.
pub use backoff::{
    BackoffMiddleware, JitterSource, RandomJitter, RetryAttempts, Sleeper, TokioSleeper,
};
pub use error::{BackoffError, HttpError};
pub use retry_policies::{default_retry_policy, Backoff, BackoffPolicy, RetryConfig, MIN_BASE_DELAY};
pub use signing_middleware::{Credentials, SigningError, SigningMiddleware};

pub mod backoff;
pub mod error;
pub mod retry_policies;
pub mod signing_middleware;

mod redaction;

pub use redaction::{redact_known_secrets_from_url, Redact, DEFAULT_REDACTION_STR};
