//! `reqwest` middleware that adds the credentials of the Maps web services to every request
use async_trait::async_trait;
use base64::prelude::BASE64_URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use itertools::Itertools;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use url::{form_urlencoded, Url};

/// The credentials that can be used to access the Maps web services.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credentials {
    /// An API key, sent as the `key` query parameter.
    ApiKey(String),
    /// A client id and private key of an enterprise account. The client id is sent as the
    /// `client` query parameter and every URL is signed with the private key.
    Enterprise {
        /// The client id of the account.
        client_id: String,
        /// The URL-safe base64 encoded private key used to sign requests.
        private_key: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ApiKey(_) => f.debug_tuple("ApiKey").field(&"********").finish(),
            Credentials::Enterprise { client_id, .. } => f
                .debug_struct("Enterprise")
                .field("client_id", client_id)
                .field("private_key", &"********")
                .finish(),
        }
    }
}

/// An error that occurs when a URL cannot be signed.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// The private key is not valid URL-safe base64.
    #[error("the private key is not valid url-safe base64")]
    InvalidPrivateKey(#[source] base64::DecodeError),
}

/// `reqwest` middleware to authenticate requests to the Maps web services
#[derive(Clone, Debug)]
pub struct SigningMiddleware {
    credentials: Credentials,
}

#[async_trait]
impl Middleware for SigningMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let url = self
            .authenticate_url(req.url())
            .map_err(reqwest_middleware::Error::middleware)?;
        *req.url_mut() = url;
        next.run(req, extensions).await
    }
}

impl SigningMiddleware {
    /// Create a new signing middleware with the given credentials
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    /// Returns the credentials used by this middleware.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Adds the credentials to the query of the given URL.
    ///
    /// Query parameters are re-encoded in order of their name so the signed string is the same
    /// for equal requests. Existing credential parameters are replaced. The signature, if any, is
    /// always appended last.
    pub fn authenticate_url(&self, url: &Url) -> Result<Url, SigningError> {
        let mut pairs = url
            .query_pairs()
            .into_owned()
            .filter(|(name, _)| !matches!(name.as_str(), "key" | "client" | "signature"))
            .collect_vec();

        match &self.credentials {
            Credentials::ApiKey(key) if !key.is_empty() => {
                pairs.push(("key".to_string(), key.clone()));
            }
            Credentials::Enterprise { client_id, .. } if !client_id.is_empty() => {
                pairs.push(("client".to_string(), client_id.clone()));
            }
            _ => {}
        }

        // `sort_by` is stable, repeated parameters keep their relative order
        pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
        let mut query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&pairs)
            .finish();

        if let Credentials::Enterprise { private_key, .. } = &self.credentials {
            if !private_key.is_empty() {
                let signature = sign(private_key, url.path(), &query)?;
                if !query.is_empty() {
                    query.push('&');
                }
                query.push_str("signature=");
                query.push_str(&signature);
            }
        }

        let mut url = url.clone();
        url.set_query(if query.is_empty() { None } else { Some(query.as_str()) });
        Ok(url)
    }
}

/// Computes the URL signature for the given path and (already encoded) query.
///
/// See <https://developers.google.com/maps/documentation/business/webservices/auth>
pub fn sign(private_key: &str, path: &str, query: &str) -> Result<String, SigningError> {
    let decoded_key = BASE64_URL_SAFE
        .decode(private_key)
        .map_err(SigningError::InvalidPrivateKey)?;
    let mut mac = Hmac::<Sha1>::new_from_slice(&decoded_key)
        .expect("hmac accepts keys of any length");
    mac.update(path.as_bytes());
    mac.update(b"?");
    mac.update(query.as_bytes());
    Ok(BASE64_URL_SAFE.encode(mac.finalize().into_bytes()))
}
