//! The status envelope that wraps every JSON response of the Maps web services.
use std::fmt::{Display, Formatter};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::MapsError;

/// The value of the `status` field of a response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ApiStatus {
    /// The response contains a valid result.
    Ok,
    /// At least one of the locations specified could not be geocoded.
    NotFound,
    /// No result could be found for the request, e.g. no route between the origin and the
    /// destination.
    ZeroResults,
    /// Too many waypoints were provided in the request.
    MaxWaypointsExceeded,
    /// The provided request was invalid.
    InvalidRequest,
    /// The service denied use of the service by your application.
    RequestDenied,
    /// The request could not be processed due to a server error. The request may succeed if you
    /// try again.
    UnknownError,
    /// The service has received too many requests from your application within the allowed time
    /// period.
    OverQueryLimit,
    /// A status this library does not know about.
    Other(String),
}

impl ApiStatus {
    /// Returns the status as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            ApiStatus::Ok => "OK",
            ApiStatus::NotFound => "NOT_FOUND",
            ApiStatus::ZeroResults => "ZERO_RESULTS",
            ApiStatus::MaxWaypointsExceeded => "MAX_WAYPOINTS_EXCEEDED",
            ApiStatus::InvalidRequest => "INVALID_REQUEST",
            ApiStatus::RequestDenied => "REQUEST_DENIED",
            ApiStatus::UnknownError => "UNKNOWN_ERROR",
            ApiStatus::OverQueryLimit => "OVER_QUERY_LIMIT",
            ApiStatus::Other(status) => status,
        }
    }
}

impl From<String> for ApiStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "OK" => ApiStatus::Ok,
            "NOT_FOUND" => ApiStatus::NotFound,
            "ZERO_RESULTS" => ApiStatus::ZeroResults,
            "MAX_WAYPOINTS_EXCEEDED" => ApiStatus::MaxWaypointsExceeded,
            "INVALID_REQUEST" => ApiStatus::InvalidRequest,
            "REQUEST_DENIED" => ApiStatus::RequestDenied,
            "UNKNOWN_ERROR" => ApiStatus::UnknownError,
            "OVER_QUERY_LIMIT" => ApiStatus::OverQueryLimit,
            _ => ApiStatus::Other(status),
        }
    }
}

impl From<ApiStatus> for String {
    fn from(status: ApiStatus) -> Self {
        match status {
            ApiStatus::Other(status) => status,
            status => status.as_str().to_string(),
        }
    }
}

impl Display for ApiStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The server answered with `200 OK` but the `status` of the response indicates a failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("API error \"{status}\"{}", format_message(.message))]
pub struct ApiError {
    /// The status of the response.
    pub status: ApiStatus,
    /// The `error_message` of the response, if any.
    pub message: Option<String>,
}

fn format_message(message: &Option<String>) -> String {
    match message {
        Some(message) if !message.is_empty() => format!(": {message}"),
        _ => String::new(),
    }
}

/// The status fields that every response carries next to its endpoint specific payload.
///
/// Failed responses usually contain nothing but these fields, so the envelope is decoded and
/// checked before the payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    /// The status of the response.
    pub status: ApiStatus,
    /// A human readable description of a failure.
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ApiResponse {
    /// Returns an [`ApiError`] unless the status is [`ApiStatus::Ok`].
    pub fn into_result(self) -> Result<(), ApiError> {
        if self.status == ApiStatus::Ok {
            Ok(())
        } else {
            Err(ApiError {
                status: self.status,
                message: self.error_message,
            })
        }
    }
}

/// Decodes a response body: first the status envelope, then the payload from the same bytes.
pub(crate) fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MapsError> {
    let envelope: ApiResponse = serde_json::from_slice(bytes).map_err(MapsError::Decode)?;
    envelope.into_result()?;
    serde_json::from_slice(bytes).map_err(MapsError::Decode)
}
