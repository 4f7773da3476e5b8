//! Configuration of a [`crate::Client`] that can be stored in a configuration file.
//!
//! Credentials are deliberately not part of the configuration, they are passed to
//! [`crate::ClientBuilder::new`] directly.
use maps_networking::{BackoffError, BackoffPolicy, RetryConfig};
use serde::{Deserialize, Serialize};
use url::Url;

/// The base url of the Maps web services.
pub const DEFAULT_BASE_URL: &str = "https://maps.googleapis.com/maps/api/";

fn default_base_url() -> Url {
    Url::parse(DEFAULT_BASE_URL).expect("the default base url is valid")
}

/// An error that occurs when a configuration is not usable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A field has a value that is not allowed.
    #[error("invalid value for '{0}': {1}")]
    InvalidValue(String, String),

    /// The retry configuration is invalid.
    #[error(transparent)]
    Retry(#[from] BackoffError),
}

/// Configuration of the client.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    /// The url that all request paths are resolved against.
    #[serde(default = "default_base_url")]
    pub base_url: Url,

    /// How failed requests are retried.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Returns true if this configuration equals the default.
    pub fn is_default(&self) -> bool {
        ClientConfig::default() == *self
    }

    /// Checks that the configuration can be used to build a client.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.base_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue(
                "base-url".to_string(),
                format!("unsupported scheme '{}'", self.base_url.scheme()),
            ));
        }

        // Without the trailing slash `Url::join` would replace the last segment.
        if !self.base_url.path().ends_with('/') {
            return Err(ConfigError::InvalidValue(
                "base-url".to_string(),
                "the url must end with a '/'".to_string(),
            ));
        }

        self.retry.validate()?;
        Ok(())
    }

    /// Returns the retry policy described by this configuration.
    pub fn retry_policy(&self) -> Result<BackoffPolicy, ConfigError> {
        Ok(BackoffPolicy::try_from(self.retry.clone())?)
    }
}
