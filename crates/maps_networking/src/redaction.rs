use itertools::Itertools;
use url::Url;

/// A default string to use for redaction.
pub const DEFAULT_REDACTION_STR: &str = "********";

/// Query parameters that carry credentials of the Maps web services.
const SECRET_QUERY_PARAMETERS: [&str; 3] = ["key", "client", "signature"];

/// Every request to the Maps web services carries its credentials in the query string. This
/// function checks if a URL contains a secret by looking for the `key`, `client` and `signature`
/// query parameters. If it does, the function returns a modified URL where the value of every
/// secret has been masked.
///
/// The `redaction` argument can be used to specify a custom string that should be used to replace
/// a secret. For consistency between applications it is recommended to pass
/// [`DEFAULT_REDACTION_STR`].
///
/// # Example
///
/// ```rust
/// # use maps_networking::{redact_known_secrets_from_url, DEFAULT_REDACTION_STR};
/// # use url::Url;
///
/// let url = Url::parse("https://maps.googleapis.com/maps/api/timezone/json?location=1,2&key=abc").unwrap();
/// let redacted_url = redact_known_secrets_from_url(&url, DEFAULT_REDACTION_STR).unwrap_or(url);
/// ```
pub fn redact_known_secrets_from_url(url: &Url, redaction: &str) -> Option<Url> {
    let is_secret = |name: &str| SECRET_QUERY_PARAMETERS.contains(&name);
    if !url.query_pairs().any(|(name, _)| is_secret(&name)) {
        return None;
    }

    let pairs = url
        .query_pairs()
        .map(|(name, value)| {
            if is_secret(&name) {
                (name, redaction.into())
            } else {
                (name, value)
            }
        })
        .collect_vec();

    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    Some(redacted)
}

/// A trait to redact known secrets from a type.
pub trait Redact {
    /// Redacts any secrets from this instance.
    fn redact(self) -> Self;
}

fn redacted_url(url: Option<&Url>) -> Option<Url> {
    url.and_then(|url| redact_known_secrets_from_url(url, DEFAULT_REDACTION_STR))
}

impl Redact for reqwest_middleware::Error {
    fn redact(self) -> Self {
        let redacted = redacted_url(self.url());
        match redacted {
            Some(url) => self.with_url(url),
            None => self,
        }
    }
}

impl Redact for reqwest::Error {
    fn redact(self) -> Self {
        let redacted = redacted_url(self.url());
        match redacted {
            Some(url) => self.with_url(url),
            None => self,
        }
    }
}

impl Redact for Url {
    fn redact(self) -> Self {
        redacted_url(Some(&self)).unwrap_or(self)
    }
}
