//! The retry policy used by [`crate::BackoffMiddleware`] and the per-request wait schedule that is
//! derived from it.
//!
//! A [`BackoffPolicy`] is immutable and can be shared between any number of concurrent requests.
//! Every logical request calls [`BackoffPolicy::start`] to obtain its own [`Backoff`], which holds
//! the attempt counter and the current wait. Nothing about one request leaks into the next.

use std::{num::NonZeroU32, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::BackoffError;

/// The number of attempts made when nothing else is configured.
pub const DEFAULT_MAX_TRIES: u32 = 5;

/// The wait before the first retry when nothing else is configured.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// The shortest wait before the first retry, the resolution of [`RetryConfig::base_delay_ms`].
pub const MIN_BASE_DELAY: Duration = Duration::from_millis(1);

/// The largest absolute jitter, expressed as a fraction of the base delay.
const MAX_JITTER_FRACTION: f64 = 0.5;

/// Bounded exponential backoff: at most `max_tries` attempts, the first retry waits `base_delay`
/// and every following wait is twice the previous one plus a random offset of at most half a
/// `base_delay` in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    max_tries: NonZeroU32,
    base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_tries: NonZeroU32::new(DEFAULT_MAX_TRIES).expect("the default is not zero"),
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Constructs a policy that makes at most `max_tries` attempts with the default base delay.
    pub fn new(max_tries: NonZeroU32) -> Self {
        Self {
            max_tries,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    /// Constructs a policy from a plain attempt count, rejecting zero.
    pub fn with_max_tries(max_tries: u32) -> Result<Self, BackoffError> {
        NonZeroU32::new(max_tries)
            .map(Self::new)
            .ok_or_else(|| BackoffError::InvalidPolicy("max-tries must be at least 1".to_string()))
    }

    /// Returns a policy that sends every request exactly once.
    pub fn no_retry() -> Self {
        Self::new(NonZeroU32::MIN)
    }

    /// Sets the wait before the first retry. This is also the unit in which jitter is measured.
    ///
    /// Delays shorter than [`MIN_BASE_DELAY`] are raised to it.
    #[must_use]
    pub fn with_base_delay(self, base_delay: Duration) -> Self {
        Self {
            base_delay: base_delay.max(MIN_BASE_DELAY),
            ..self
        }
    }

    /// The maximum number of attempts made for a single request.
    pub fn max_tries(&self) -> u32 {
        self.max_tries.get()
    }

    /// The wait before the first retry.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Starts the wait schedule for a new logical request.
    pub fn start(&self) -> Backoff {
        Backoff {
            max_tries: self.max_tries.get(),
            base_delay: self.base_delay,
            attempts: 0,
            wait: self.base_delay,
        }
    }
}

/// Returns the default retry policy.
///
/// This is useful if you just do not care about a retry policy and you just want something
/// sensible: five attempts, starting at one second between them.
pub fn default_retry_policy() -> BackoffPolicy {
    BackoffPolicy::default()
}

/// The attempt state of a single logical request.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_tries: u32,
    base_delay: Duration,
    attempts: u32,
    wait: Duration,
}

impl Backoff {
    /// Records that an attempt is about to be made.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// The number of attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns true if no further attempt is allowed.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_tries
    }

    /// Returns how long to wait before the next attempt, or `None` if the last allowed attempt
    /// has been made.
    ///
    /// `jitter` is a fraction of the base delay in `[-0.5, 0.5)`; values outside that range are
    /// clamped and non-finite values count as no jitter. It is applied to the wait that follows
    /// the returned one.
    pub fn next_wait(&mut self, jitter: f64) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let jitter = if jitter.is_finite() { jitter } else { 0.0 };

        let wait = self.wait;
        let offset = self
            .base_delay
            .mul_f64(jitter.abs().min(MAX_JITTER_FRACTION));
        let doubled = self.wait.saturating_mul(2);
        self.wait = if jitter.is_sign_negative() {
            doubled.saturating_sub(offset)
        } else {
            doubled.saturating_add(offset)
        };
        Some(wait)
    }
}

fn default_max_tries() -> u32 {
    DEFAULT_MAX_TRIES
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY.as_millis() as u64
}

/// The serializable form of a [`BackoffPolicy`], for use in configuration files.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    /// The maximum number of attempts per request.
    // Needing to set this default next to the default of the full struct to avoid serde defaulting
    // to 0 if the field was omitted.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// The wait before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Returns true if this configuration equals the default.
    pub fn is_default(&self) -> bool {
        RetryConfig::default() == *self
    }

    /// Checks that the configuration describes a usable policy.
    pub fn validate(&self) -> Result<(), BackoffError> {
        if self.max_tries == 0 {
            return Err(BackoffError::InvalidPolicy(
                "max-tries must be at least 1".to_string(),
            ));
        }

        if self.base_delay_ms == 0 {
            return Err(BackoffError::InvalidPolicy(
                "base-delay-ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl TryFrom<RetryConfig> for BackoffPolicy {
    type Error = BackoffError;

    fn try_from(config: RetryConfig) -> Result<Self, Self::Error> {
        config.validate()?;
        Ok(BackoffPolicy::with_max_tries(config.max_tries)?
            .with_base_delay(Duration::from_millis(config.base_delay_ms)))
    }
}

impl From<BackoffPolicy> for RetryConfig {
    fn from(policy: BackoffPolicy) -> Self {
        Self {
            max_tries: policy.max_tries(),
            // Round up so a policy always converts to a valid configuration.
            base_delay_ms: policy.base_delay().as_micros().div_ceil(1000) as u64,
        }
    }
}
