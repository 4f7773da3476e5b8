//! Errors produced by the middlewares in this crate.
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use reqwest::Response;
use url::Url;

use crate::redaction::Redact;

/// The server answered, but with a status code that the caller treats as a failure.
///
/// The [`crate::BackoffMiddleware`] produces this for every `5xx` response it gives up on. The
/// response body is drained so the error can be inspected after the connection is released.
#[derive(Clone, Debug, thiserror::Error)]
#[error("http error {}", .status.as_u16())]
pub struct HttpError {
    status: StatusCode,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl HttpError {
    /// Consumes the response and captures everything needed to inspect it later.
    pub async fn from_response(response: Response) -> Self {
        let status = response.status();
        let url = response.url().clone().redact();
        let headers = response.headers().clone();
        let body = response.bytes().await.ok();
        Self {
            status,
            url,
            headers,
            body,
        }
    }

    /// The status code returned by the server.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The url of the request, with known secrets redacted.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The headers returned by the server.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The response body, if it could be read.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// The response body as text, if it could be read.
    pub fn text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|body| String::from_utf8_lossy(body).into_owned())
    }
}

/// Errors raised by the [`crate::BackoffMiddleware`] itself, as opposed to errors of the requests
/// it retries.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackoffError {
    /// The request was cancelled through the `CancellationToken` in its extensions.
    #[error("the request was cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// The number of attempts that were made before the cancellation was observed.
        attempts: u32,
    },

    /// The retry configuration cannot be turned into a policy.
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),
}
