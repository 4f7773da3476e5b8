//! `reqwest` middleware that retries transient failures with exponential backoff and jitter.
//!
//! An attempt is retried when the rest of the middleware chain returns an error (the request
//! could not be completed) or when the server answers with a `5xx` status. Any other response,
//! including `4xx` responses, is returned to the caller unmodified. When every attempt failed the
//! error of the last attempt is returned; a `5xx` response is turned into an [`HttpError`].
//!
//! The middleware itself holds no per-request state and can be shared by any number of concurrent
//! requests.
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{BackoffError, HttpError},
    redaction::Redact,
    retry_policies::{Backoff, BackoffPolicy},
};

/// Suspends the current task between two attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Sleeps for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// A [`Sleeper`] that uses the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A source of jitter, expressed as a fraction of the base delay of a [`BackoffPolicy`].
pub trait JitterSource: Send + Sync {
    /// Returns a value in `[-0.5, 0.5)`.
    fn sample(&self) -> f64;
}

/// Uniformly distributed jitter from the thread local random number generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(-0.5..0.5)
    }
}

impl<F> JitterSource for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn sample(&self) -> f64 {
        self()
    }
}

/// The number of attempts the [`BackoffMiddleware`] made for a request.
///
/// This is inserted into the extensions of the request once the middleware is done, which allows
/// callers that use `execute_with_extensions` to tell a request that failed on its first attempt
/// from one that failed after exhausting its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempts(pub u32);

/// `reqwest` middleware that retries requests according to a [`BackoffPolicy`].
///
/// If the extensions of a request contain a [`CancellationToken`] it is checked before every
/// attempt and while sleeping. A cancelled request fails with [`BackoffError::Cancelled`].
#[derive(Debug, Clone)]
pub struct BackoffMiddleware<S = TokioSleeper, J = RandomJitter> {
    policy: BackoffPolicy,
    sleeper: S,
    jitter: J,
}

impl Default for BackoffMiddleware {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl BackoffMiddleware {
    /// Create a new backoff middleware with the given policy
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            sleeper: TokioSleeper,
            jitter: RandomJitter,
        }
    }
}

impl<S, J> BackoffMiddleware<S, J> {
    /// Replaces the way the middleware waits between attempts.
    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> BackoffMiddleware<S2, J> {
        BackoffMiddleware {
            policy: self.policy,
            sleeper,
            jitter: self.jitter,
        }
    }

    /// Replaces the source of jitter.
    pub fn with_jitter<J2: JitterSource>(self, jitter: J2) -> BackoffMiddleware<S, J2> {
        BackoffMiddleware {
            policy: self.policy,
            sleeper: self.sleeper,
            jitter,
        }
    }

    /// Returns the policy of this middleware.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

fn cancelled(backoff: &Backoff) -> reqwest_middleware::Error {
    reqwest_middleware::Error::middleware(BackoffError::Cancelled {
        attempts: backoff.attempts(),
    })
}

impl<S: Sleeper, J: JitterSource> BackoffMiddleware<S, J> {
    async fn execute(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
        cancellation: Option<CancellationToken>,
        backoff: &mut Backoff,
    ) -> reqwest_middleware::Result<Response> {
        let url = req.url().clone().redact();
        loop {
            if cancellation.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(cancelled(backoff));
            }

            backoff.record_attempt();
            let Some(attempt) = req.try_clone() else {
                // Streaming bodies cannot be replayed, send the original request exactly once.
                tracing::debug!("request to {url} cannot be cloned, sending it without retries");
                return next.run(req, extensions).await;
            };

            let err = match next.clone().run(attempt, extensions).await {
                Ok(response) if !response.status().is_server_error() => return Ok(response),
                Ok(response) => {
                    reqwest_middleware::Error::middleware(HttpError::from_response(response).await)
                }
                Err(err) => err.redact(),
            };

            let Some(wait) = backoff.next_wait(self.jitter.sample()) else {
                tracing::warn!(
                    "request to {url} failed after {} attempt(s): {err}",
                    backoff.attempts()
                );
                return Err(err);
            };

            tracing::debug!(
                "attempt {} of request to {url} failed ({err}), retrying in {wait:?}",
                backoff.attempts()
            );

            match &cancellation {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(cancelled(backoff)),
                        _ = self.sleeper.sleep(wait) => {}
                    }
                }
                None => self.sleeper.sleep(wait).await,
            }
        }
    }
}

#[async_trait]
impl<S, J> Middleware for BackoffMiddleware<S, J>
where
    S: Sleeper + 'static,
    J: JitterSource + 'static,
{
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let cancellation = extensions.get::<CancellationToken>().cloned();
        let mut backoff = self.policy.start();
        let result = self
            .execute(req, extensions, next, cancellation, &mut backoff)
            .await;
        extensions.insert(RetryAttempts(backoff.attempts()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use http::StatusCode;
    use reqwest_middleware::ClientBuilder;
    use rstest::rstest;
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex,
        },
    };

    /// What the fake backend does on a single attempt.
    #[derive(Clone, Copy, Debug)]
    enum Outcome {
        Status(u16),
        ConnectionError,
    }

    /// Terminal middleware that plays back a list of outcomes instead of sending requests.
    /// The last outcome repeats once the list is exhausted.
    struct FakeBackend {
        outcomes: Mutex<VecDeque<Outcome>>,
        attempts: Arc<AtomicU32>,
    }

    impl FakeBackend {
        fn new(outcomes: impl IntoIterator<Item = Outcome>, attempts: Arc<AtomicU32>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                attempts,
            }
        }
    }

    #[async_trait]
    impl Middleware for FakeBackend {
        async fn handle(
            &self,
            _: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> reqwest_middleware::Result<Response> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let outcome = {
                let mut outcomes = self.outcomes.lock().unwrap();
                if outcomes.len() > 1 {
                    outcomes.pop_front().unwrap()
                } else {
                    *outcomes.front().unwrap()
                }
            };
            match outcome {
                Outcome::Status(status) => Ok(Response::from(
                    http::response::Builder::new()
                        .status(status)
                        .body(format!("attempt {attempt}"))
                        .unwrap(),
                )),
                Outcome::ConnectionError => Err(reqwest_middleware::Error::Middleware(anyhow!(
                    "connection refused (attempt {attempt})"
                ))),
            }
        }
    }

    /// Records every sleep instead of waiting.
    #[derive(Clone, Default)]
    struct RecordingSleeper {
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl RecordingSleeper {
        fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    struct Harness {
        client: reqwest_middleware::ClientWithMiddleware,
        sleeper: RecordingSleeper,
        attempts: Arc<AtomicU32>,
    }

    impl Harness {
        fn new(max_tries: u32, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
            Self::with_jitter(max_tries, outcomes, || 0.0)
        }

        fn with_jitter(
            max_tries: u32,
            outcomes: impl IntoIterator<Item = Outcome>,
            jitter: impl JitterSource + 'static,
        ) -> Self {
            let sleeper = RecordingSleeper::default();
            let attempts = Arc::new(AtomicU32::new(0));
            let middleware = BackoffMiddleware::new(BackoffPolicy::with_max_tries(max_tries).unwrap())
                .with_sleeper(sleeper.clone())
                .with_jitter(jitter);
            let client = ClientBuilder::new(reqwest::Client::default())
                .with(middleware)
                .with(FakeBackend::new(outcomes, attempts.clone()))
                .build();
            Self {
                client,
                sleeper,
                attempts,
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }

        async fn get(
            &self,
            extensions: &mut http::Extensions,
        ) -> reqwest_middleware::Result<Response> {
            let request = self
                .client
                .get("https://maps.googleapis.com/maps/api/timezone/json?key=secret")
                .build()
                .unwrap();
            self.client.execute_with_extensions(request, extensions).await
        }
    }

    fn http_error(err: &reqwest_middleware::Error) -> &HttpError {
        match err {
            reqwest_middleware::Error::Middleware(err) => err
                .downcast_ref::<HttpError>()
                .expect("expected an http error"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(5)]
    #[tokio::test]
    async fn test_every_attempt_fails(#[case] max_tries: u32) {
        let harness = Harness::new(max_tries, [Outcome::Status(500)]);
        let mut extensions = http::Extensions::new();
        let err = harness.get(&mut extensions).await.unwrap_err();

        assert_eq!(harness.attempts(), max_tries);
        assert_eq!(harness.sleeper.sleeps().len() as u32, max_tries - 1);
        assert_eq!(http_error(&err).status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            extensions.get::<RetryAttempts>(),
            Some(&RetryAttempts(max_tries))
        );
    }

    #[tokio::test]
    async fn test_service_unavailable_ten_tries() {
        let harness = Harness::new(10, [Outcome::Status(503)]);
        let err = harness.get(&mut http::Extensions::new()).await.unwrap_err();

        assert_eq!(harness.attempts(), 10);
        assert_eq!(harness.sleeper.sleeps().len(), 9);
        let http_error = http_error(&err);
        assert_eq!(http_error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_error.text().as_deref(), Some("attempt 10"));
    }

    #[tokio::test]
    async fn test_connection_errors_return_last_error() {
        let harness = Harness::new(3, [Outcome::ConnectionError]);
        let err = harness.get(&mut http::Extensions::new()).await.unwrap_err();

        assert_eq!(harness.attempts(), 3);
        assert_eq!(harness.sleeper.sleeps().len(), 2);
        assert!(err.to_string().contains("connection refused (attempt 3)"));
    }

    #[tokio::test]
    async fn test_success_after_server_errors() {
        let harness = Harness::new(
            5,
            [
                Outcome::Status(500),
                Outcome::Status(500),
                Outcome::Status(200),
            ],
        );
        let mut extensions = http::Extensions::new();
        let response = harness.get(&mut extensions).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "attempt 3");
        assert_eq!(harness.attempts(), 3);
        assert_eq!(
            harness.sleeper.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(extensions.get::<RetryAttempts>(), Some(&RetryAttempts(3)));
    }

    #[tokio::test]
    async fn test_success_after_connection_error() {
        let harness = Harness::new(2, [Outcome::ConnectionError, Outcome::Status(200)]);
        let response = harness.get(&mut http::Extensions::new()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(harness.attempts(), 2);
        assert_eq!(harness.sleeper.sleeps().len(), 1);
    }

    #[rstest]
    #[case(400)]
    #[case(403)]
    #[case(404)]
    #[case(429)]
    #[tokio::test]
    async fn test_client_errors_are_not_retried(#[case] status: u16) {
        let harness = Harness::new(5, [Outcome::Status(status), Outcome::Status(200)]);
        let response = harness.get(&mut http::Extensions::new()).await.unwrap();

        assert_eq!(response.status().as_u16(), status);
        assert_eq!(harness.attempts(), 1);
        assert!(harness.sleeper.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_waits_include_jitter() {
        let jitter = Mutex::new(VecDeque::from([-0.5, 0.25, 0.0]));
        let harness = Harness::with_jitter(4, [Outcome::Status(502)], move || {
            jitter.lock().unwrap().pop_front().unwrap_or(0.0)
        });
        harness.get(&mut http::Extensions::new()).await.unwrap_err();

        assert_eq!(
            harness.sleeper.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_millis(1500),
                Duration::from_millis(3250),
            ]
        );
    }

    #[tokio::test]
    async fn test_random_jitter_keeps_second_wait_in_range() {
        let harness = Harness::with_jitter(3, [Outcome::Status(500)], RandomJitter);
        harness.get(&mut http::Extensions::new()).await.unwrap_err();

        let sleeps = harness.sleeper.sleeps();
        assert_eq!(sleeps.len(), 2);
        assert_eq!(sleeps[0], Duration::from_secs(1));
        assert!(sleeps[1] >= Duration::from_millis(1500));
        assert!(sleeps[1] < Duration::from_millis(2500));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_exhaustion_is_logged_without_secrets() {
        let harness = Harness::new(2, [Outcome::Status(500)]);
        harness.get(&mut http::Extensions::new()).await.unwrap_err();

        assert!(logs_contain("failed after 2 attempt(s)"));
        assert!(logs_contain("key=********"));
        assert!(!logs_contain("key=secret"));
    }

    #[tokio::test]
    async fn test_calls_do_not_share_attempts() {
        let harness = Harness::new(2, [Outcome::Status(500)]);
        harness.get(&mut http::Extensions::new()).await.unwrap_err();
        harness.get(&mut http::Extensions::new()).await.unwrap_err();

        assert_eq!(harness.attempts(), 4);
        assert_eq!(harness.sleeper.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let harness = Harness::new(5, [Outcome::Status(200)]);
        let token = CancellationToken::new();
        token.cancel();

        let mut extensions = http::Extensions::new();
        extensions.insert(token);
        let err = harness.get(&mut extensions).await.unwrap_err();

        assert_eq!(harness.attempts(), 0);
        match err {
            reqwest_middleware::Error::Middleware(err) => assert!(matches!(
                err.downcast_ref::<BackoffError>(),
                Some(BackoffError::Cancelled { attempts: 0 })
            )),
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Cancels the token the first time it is asked to sleep.
    struct CancellingSleeper {
        token: CancellationToken,
    }

    #[async_trait]
    impl Sleeper for CancellingSleeper {
        async fn sleep(&self, _: Duration) {
            self.token.cancel();
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_cancelled_while_sleeping() {
        let token = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let client = ClientBuilder::new(reqwest::Client::default())
            .with(BackoffMiddleware::default().with_sleeper(CancellingSleeper {
                token: token.clone(),
            }))
            .with(FakeBackend::new([Outcome::Status(500)], attempts.clone()))
            .build();

        let err = client
            .get("https://maps.googleapis.com/maps/api/timezone/json")
            .with_extension(token)
            .send()
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("cancelled after 1 attempt(s)"));
    }
}
