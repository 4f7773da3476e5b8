use maps_networking::{BackoffError, HttpError, Redact, SigningError};

use crate::{config::ConfigError, status::ApiError};

/// An error that can occur when calling one of the Maps web services.
#[derive(Debug, thiserror::Error)]
pub enum MapsError {
    /// The request URL could not be constructed.
    #[error("invalid request url")]
    InvalidUrl(#[from] url::ParseError),

    /// The client configuration is invalid.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// The private key could not be used to sign the request.
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// The server answered with a status code other than `200 OK`.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The server answered with `200 OK` but the response reports a failure.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The body of the response is not the expected JSON.
    #[error("failed to decode the response")]
    Decode(#[source] serde_json::Error),

    /// The request was cancelled.
    #[error("the request was cancelled")]
    Cancelled,

    /// The request could not be sent or the response could not be read.
    #[error(transparent)]
    Transport(reqwest_middleware::Error),
}

impl From<reqwest_middleware::Error> for MapsError {
    fn from(err: reqwest_middleware::Error) -> Self {
        let err = match err {
            reqwest_middleware::Error::Middleware(err) => err,
            err => return MapsError::Transport(err.redact()),
        };

        let err = match err.downcast::<HttpError>() {
            Ok(err) => return MapsError::Http(err),
            Err(err) => err,
        };

        let err = match err.downcast::<SigningError>() {
            Ok(err) => return MapsError::Signing(err),
            Err(err) => err,
        };

        match err.downcast::<BackoffError>() {
            Ok(BackoffError::Cancelled { .. }) => MapsError::Cancelled,
            Ok(err) => MapsError::InvalidConfig(ConfigError::Retry(err)),
            Err(err) => MapsError::Transport(reqwest_middleware::Error::Middleware(err)),
        }
    }
}

impl From<reqwest::Error> for MapsError {
    fn from(err: reqwest::Error) -> Self {
        MapsError::Transport(reqwest_middleware::Error::Reqwest(err.redact()))
    }
}
