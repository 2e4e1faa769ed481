//! HTTP boundary of the dispatcher.
//!
//! The dispatcher only needs "send this endpoint these parameters, give me a
//! status, the rate-limit headers and the body". Keeping that behind the
//! [`Transport`] trait lets tests script responses without a server.

use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Rate-limit information a response carried in its headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// `x-rate-limit-limit`
    pub limit: Option<u64>,
    /// `x-rate-limit-remaining`
    pub remaining: Option<u64>,
    /// `x-rate-limit-reset`, converted to epoch milliseconds.
    pub reset_at_ms: Option<u64>,
    /// `retry-after`, in seconds on the wire.
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Parses the headers the source API uses to report quota.
    ///
    /// Unparsable values are ignored rather than treated as errors.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        fn number(headers: &HeaderMap, name: &str) -> Option<u64> {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
        }

        Self {
            limit: number(headers, "x-rate-limit-limit"),
            remaining: number(headers, "x-rate-limit-remaining"),
            reset_at_ms: number(headers, "x-rate-limit-reset").map(|secs| secs.saturating_mul(1000)),
            retry_after: number(headers, "retry-after").map(Duration::from_secs),
        }
    }

    /// Absolute reset instant: the explicit reset header if present,
    /// otherwise `now_ms + retry-after`.
    pub fn reset_instant(&self, now_ms: u64) -> Option<u64> {
        self.reset_at_ms.or_else(|| {
            self.retry_after
                .map(|wait| now_ms.saturating_add(wait.as_millis() as u64))
        })
    }
}

/// Status, quota headers and body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed rate-limit headers.
    pub rate_limit: RateLimitHeaders,
    /// Raw response body.
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Response with a status and body and no rate-limit headers.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            rate_limit: RateLimitHeaders::default(),
            body: body.into(),
        }
    }

    /// Attaches rate-limit headers.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitHeaders) -> Self {
        self.rate_limit = rate_limit;
        self
    }
}

/// Sends one request for an endpoint.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Issues a single network call. Any HTTP status is `Ok`; only failures
    /// that produced no status are `Err`.
    async fn send(
        &self,
        endpoint_id: &str,
        params: &[(String, String)],
    ) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] over `reqwest`.
///
/// Endpoint ids map to URL paths under `base_url`; an id without a mapping
/// is used as the path itself.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    endpoints: BTreeMap<String, String>,
}

impl HttpTransport {
    /// Builds a client with bearer auth and a per-request timeout.
    pub fn new(
        base_url: &str,
        bearer_token: Option<&str>,
        endpoints: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = bearer_token.map(str::trim).filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| TransportError::Setup("invalid bearer token".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| TransportError::Setup(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            endpoints,
        })
    }

    /// Full URL for an endpoint id.
    pub fn url_for(&self, endpoint_id: &str) -> String {
        let path = self
            .endpoints
            .get(endpoint_id)
            .map(String::as_str)
            .unwrap_or(endpoint_id);
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        endpoint_id: &str,
        params: &[(String, String)],
    ) -> Result<TransportResponse, TransportError> {
        let url = self.url_for(endpoint_id);
        debug!("GET {} ({} params)", url, params.len());

        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let rate_limit = RateLimitHeaders::from_headers(response.headers());
        let body = response.bytes().await.map_err(classify)?.to_vec();

        Ok(TransportResponse {
            status,
            rate_limit,
            body,
        })
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

type Scripted = Result<TransportResponse, TransportError>;

/// In-memory [`Transport`] that replays queued responses.
///
/// Queued responses are served first, then the fallback (if any). Every call
/// is logged so callers can assert on what was sent.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    queue: Mutex<VecDeque<Scripted>>,
    fallback: Option<Scripted>,
    latency: Duration,
    calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl ScriptedTransport {
    /// Empty script; calls fail once the queue runs dry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer used whenever the queue is empty.
    pub fn with_fallback(mut self, fallback: Scripted) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queues a response.
    pub fn push_response(&self, response: TransportResponse) {
        self.push(Ok(response));
    }

    /// Queues a response or transport failure.
    pub fn push(&self, outcome: Scripted) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    /// Number of calls received.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Endpoint and parameters of every call, in order.
    pub fn calls(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        endpoint_id: &str,
        params: &[(String, String)],
    ) -> Result<TransportResponse, TransportError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((endpoint_id.to_string(), params.to_vec()));

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Err(TransportError::Request("script exhausted".to_string())))
    }
}
