#![deny(missing_docs)]

//! A client for the Google Maps web services.
//!
//! Every request made through a [`Client`] is signed with the configured [`Credentials`] and
//! retried with exponential backoff when the server is temporarily unavailable. The endpoint
//! specific request builders and response types are layered on top of [`Client::get_json`].
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), maps_client::MapsError> {
//! use maps_client::{ClientBuilder, Credentials};
//!
//! #[derive(serde::Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct TimeZone {
//!     time_zone_id: String,
//! }
//!
//! let client = ClientBuilder::new(Credentials::ApiKey("my-api-key".to_string())).build()?;
//! let time_zone: TimeZone = client
//!     .get_json("timezone/json?location=39.6034810,-119.6822510&timestamp=1331161200")
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod error;
pub mod status;

pub use config::{ClientConfig, ConfigError, DEFAULT_BASE_URL};
pub use error::MapsError;
pub use maps_networking::{BackoffPolicy, Credentials, HttpError, Redact};
pub use status::{ApiError, ApiResponse, ApiStatus};

use maps_networking::{BackoffMiddleware, SigningMiddleware};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Builds a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    credentials: Credentials,
    config: ClientConfig,
    retry_policy: Option<BackoffPolicy>,
    reqwest_client: Option<reqwest::Client>,
}

impl ClientBuilder {
    /// Starts building a client that authenticates with the given credentials.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            config: ClientConfig::default(),
            retry_policy: None,
            reqwest_client: None,
        }
    }

    /// Uses the base url and retry settings of the given configuration.
    #[must_use]
    pub fn with_config(self, config: ClientConfig) -> Self {
        Self {
            config,
            retry_policy: None,
            ..self
        }
    }

    /// Sets the url that request paths are resolved against.
    #[must_use]
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.config.base_url = base_url;
        self
    }

    /// Sets the retry policy, overriding the retry settings of the configuration.
    #[must_use]
    pub fn with_retry_policy(self, retry_policy: BackoffPolicy) -> Self {
        Self {
            retry_policy: Some(retry_policy),
            ..self
        }
    }

    /// Uses the given `reqwest` client to send requests, e.g. to share a connection pool.
    #[must_use]
    pub fn with_reqwest_client(self, client: reqwest::Client) -> Self {
        Self {
            reqwest_client: Some(client),
            ..self
        }
    }

    /// Validates the configuration and builds the client.
    pub fn build(self) -> Result<Client, MapsError> {
        self.config.validate()?;
        let retry_policy = match self.retry_policy {
            Some(policy) => policy,
            None => self.config.retry_policy()?,
        };

        // The signing middleware runs first so every retry sends the same signed url.
        let client =
            reqwest_middleware::ClientBuilder::new(self.reqwest_client.unwrap_or_default())
                .with(SigningMiddleware::new(self.credentials))
                .with(BackoffMiddleware::new(retry_policy))
                .build();

        Ok(Client {
            client,
            base_url: self.config.base_url,
        })
    }
}

/// A client for the Maps web services.
///
/// Clones of this struct share the same connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    client: reqwest_middleware::ClientWithMiddleware,
    base_url: Url,
}

impl Client {
    /// The url that request paths are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sends a GET request for `path_and_query`, relative to the base url, and returns the
    /// response if the server answered with `200 OK`.
    pub async fn get(&self, path_and_query: &str) -> Result<Response, MapsError> {
        self.send(path_and_query, None).await
    }

    /// Like [`Client::get`], but gives up as soon as the token is cancelled.
    pub async fn get_with_cancellation(
        &self,
        path_and_query: &str,
        cancellation: CancellationToken,
    ) -> Result<Response, MapsError> {
        self.send(path_and_query, Some(cancellation)).await
    }

    /// Sends a GET request for `path_and_query` and decodes the JSON response. Fails with
    /// [`MapsError::Api`] if the `status` of the response is not `OK`.
    pub async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, MapsError> {
        let response = self.get(path_and_query).await?;
        decode(response).await
    }

    /// Like [`Client::get_json`], but gives up as soon as the token is cancelled.
    pub async fn get_json_with_cancellation<T: DeserializeOwned>(
        &self,
        path_and_query: &str,
        cancellation: CancellationToken,
    ) -> Result<T, MapsError> {
        let response = self
            .get_with_cancellation(path_and_query, cancellation)
            .await?;
        decode(response).await
    }

    async fn send(
        &self,
        path_and_query: &str,
        cancellation: Option<CancellationToken>,
    ) -> Result<Response, MapsError> {
        let url = self.base_url.join(path_and_query)?;
        tracing::debug!("GET {}", url.clone().redact());

        let mut request = self.client.get(url);
        if let Some(cancellation) = cancellation {
            request = request.with_extension(cancellation);
        }

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(MapsError::Http(HttpError::from_response(response).await));
        }
        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, MapsError> {
    let bytes = response.bytes().await?;
    status::decode_body(&bytes)
}
