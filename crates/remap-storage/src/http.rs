//! Outbound HTTP shared by feed fetches and collaborator clients.
//!
//! Every call is bounded by the client timeout, limited by a global and a per-scope
//! permit pool, optionally paced, and retried with capped exponential backoff when the
//! failure is transient (connect/timeout errors, 5xx, 429).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

const ERROR_BODY_PREVIEW: usize = 512;

pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_request_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based): doubles each time, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// At most `burst` requests back to back, then one per `interval`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_scope: usize,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_scope: 4,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug)]
struct Pacer {
    limit: RateLimit,
    state: Mutex<(u32, Instant)>,
}

impl Pacer {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new((limit.burst, Instant::now())),
        }
    }

    async fn wait_turn(&self) {
        if self.limit.interval.is_zero() {
            return;
        }
        loop {
            let wait = {
                let mut guard = self.state.lock().await;
                let (tokens, refilled_at) = &mut *guard;
                let earned = refilled_at.elapsed().as_nanos() / self.limit.interval.as_nanos();
                if earned > 0 {
                    let earned = u32::try_from(earned).unwrap_or(u32::MAX);
                    *tokens = tokens.saturating_add(earned).min(self.limit.burst);
                    *refilled_at = Instant::now();
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    return;
                }
                self.limit.interval.saturating_sub(refilled_at.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, CollaboratorError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            CollaboratorError::Rejected(format!("unexpected response body from {}: {e}", self.final_url))
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("http client is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => is_transient_request_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(is_transient_status)
                .unwrap_or(false),
            FetchError::Closed => false,
        }
    }
}

/// Failure calling an external collaborator (feed, geocoder, embedder, search index).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Connection failures, timeouts and 5xx/429 responses that outlived the retries.
    #[error("transient collaborator failure: {0}")]
    Transient(String),
    /// Malformed requests, authentication failures and undecodable responses.
    #[error("collaborator rejected the request: {0}")]
    Rejected(String),
    #[error("no result: {0}")]
    NotFound(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Transient(_))
    }
}

impl From<FetchError> for CollaboratorError {
    fn from(err: FetchError) -> Self {
        if err.is_transient() {
            CollaboratorError::Transient(err.to_string())
        } else {
            CollaboratorError::Rejected(err.to_string())
        }
    }
}

/// Shared HTTP client. Scopes name a provider feed or a collaborator service.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_scope_limit: usize,
    scopes: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<Pacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_scope_limit: config.max_in_flight_per_scope.max(1),
            scopes: Mutex::new(HashMap::new()),
            pacer: config.rate_limit.map(Pacer::new),
            retry: config.retry,
        })
    }

    async fn scope_permits(&self, scope: &str) -> Arc<Semaphore> {
        let mut scopes = self.scopes.lock().await;
        Arc::clone(
            scopes
                .entry(scope.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit))),
        )
    }

    /// GET a provider feed.
    pub async fn fetch_bytes(&self, run_id: Uuid, provider: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send(provider, |client| client.get(url))
            .instrument(info_span!("feed_fetch", %run_id, provider, url))
            .await
    }

    /// Send the request produced by `build`, rebuilt for every attempt.
    pub async fn send<F>(&self, scope: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _global = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let scoped = self.scope_permits(scope).await;
        let _scoped = scoped.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut retry = 0;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }
            match self.attempt(&build).await {
                Err(err) if err.is_transient() && retry < self.retry.max_retries => {
                    debug!(scope, retry, error = %err, "transient http failure; retrying");
                    tokio::time::sleep(self.retry.delay(retry)).await;
                    retry += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn attempt<F>(&self, build: &F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let response = build(&self.client).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body: body.chars().take(ERROR_BODY_PREVIEW).collect(),
            });
        }
        let body = response.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
