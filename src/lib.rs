//! # Tweetpace - Quota-Aware Fetching for Rate-Limited Analytics APIs
//!
//! Collects posts from a rate-limited API and turns the raw pages into a
//! validated, de-duplicated record stream, without ever spending more quota
//! than the API grants.
//!
//! ## The Problem
//!
//! Analytics APIs hand out a fixed number of calls per endpoint per window
//! (say 450 per 15 minutes). Many concurrent workers share that budget, the
//! server may throttle earlier than expected, and the same post shows up on
//! several pages. Tweetpace puts one shared gate in front of every request and
//! one shared dedup set behind every response.
//!
//! ## Architecture Overview
//!
//! ```text
//!                    ┌─────────────────────────┐
//!                    │   Caller / CLI          │
//!                    └──────────┬──────────────┘
//!                               │ fetch(criteria, N)
//!                    ┌──────────▼──────────────┐
//!                    │  Pipeline Coordinator   │ ◄── bounded concurrent chains
//!                    └──────────┬──────────────┘
//!                               │ RequestSpec
//!                    ┌──────────▼──────────────┐
//!                    │  Request Dispatcher     │ ◄── retry, backoff, 429 signals
//!                    └───┬──────────────┬──────┘
//!                        │              │
//!          ┌─────────────▼───┐   ┌──────▼─────────┐
//!          │  Rate Limiter   │   │   Transport    │
//!          │  quota + bucket │   │   (reqwest)    │
//!          │  + pacer        │   └──────┬─────────┘
//!          └─────────────────┘          │ payload
//!                               ┌───────▼─────────┐
//!                               │ Tweet Ingestor  │ ◄── validate + dedup
//!                               └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tweetpace::{
//!     CancelToken, FetchCriteria, PipelineBuilder, PipelineConfig, ScriptedTransport,
//!     TransportResponse,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let transport = Arc::new(ScriptedTransport::new());
//! transport.push_response(TransportResponse::new(
//!     200,
//!     r#"{"data":[{"id":"1","created_at":"2024-05-13T09:30:00Z","text":"hello"}]}"#,
//! ));
//!
//! let mut config = PipelineConfig::default();
//! config.pacing.enabled = false;
//!
//! let coordinator = PipelineBuilder::new()
//!     .config(config)
//!     .transport(transport)
//!     .try_build()
//!     .unwrap();
//!
//! let outcome = coordinator
//!     .fetch(&FetchCriteria::new("search").with_query("rust"), 50, &CancelToken::new())
//!     .await;
//! assert_eq!(outcome.records.len(), 1);
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! The quota tracker, limiter, dispatcher and dedup set are all `Send + Sync`
//! and meant to be shared through `Arc`. Per-endpoint state is locked per
//! endpoint, so a saturated endpoint never blocks the others.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_code)]

mod cancel;
mod config;
mod dispatcher;
mod error;
mod ingest;
mod pipeline;
mod rate_limiter;

pub use cancel::CancelToken;
pub use config::{
    ApiConfig, ConfigProvider, CoordinatorConfig, PipelineConfig, RetryConfig, StaticConfig,
};
pub use dispatcher::{
    backoff_delay, Dispatcher, FetchResult, HttpTransport, RateLimitHeaders, RequestSpec,
    ScriptedTransport, Transport, TransportResponse, DEFAULT_BASE_BACKOFF, DEFAULT_MAX_RETRIES,
    JITTER_FRACTION, MAX_BACKOFF,
};
pub use error::{
    BuildError, Cancelled, ConfigError, ErrorKind, IngestError, PipelineError, SinkError,
    StoreError, TransportError,
};
pub use ingest::{
    DedupSet, ExportRow, IngestBatch, RawHash, TweetIngestor, TweetRecord, LEGACY_TIME_FORMAT,
    METRIC_BOOKMARKS, METRIC_LIKES, METRIC_QUOTES, METRIC_REPLIES, METRIC_RETWEETS,
};
pub use pipeline::{
    FetchCriteria, FetchOutcome, JsonLinesSink, MemorySink, PipelineCoordinator, RecordSink,
};
pub use rate_limiter::{
    current_time_ms, AdaptivePacer, AdmissionDecision, BucketMetrics, Clock, EndpointQuota,
    HealthReport, HealthStatus, JsonFileStore, LimiterConfig, ManualClock, PaceReason,
    PacerStats, PacingConfig, Priority, QuotaConfig, QuotaStats, QuotaStore, QuotaTracker,
    QuotaWindow, RateLimiter, RejectReason, Reservation, SharedClock, SmoothingConfig,
    SystemClock, TokenBucket, WindowState, MAX_REFILL_PERIODS,
};

/// A rate limiter wrapped in `Arc` for sharing between dispatchers.
pub type SharedRateLimiter = std::sync::Arc<RateLimiter>;

/// A quota tracker wrapped in `Arc`.
pub type SharedQuotaTracker = std::sync::Arc<QuotaTracker>;

/// A dedup set wrapped in `Arc`, shared by every ingestor of a session.
pub type SharedDedupSet = std::sync::Arc<DedupSet>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
///
/// ```rust
/// use tweetpace::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for typical fetch pipelines.
    //!
    //! # Example
    //! ```rust
    //! use tweetpace::prelude::*;
    //!
    //! let criteria = FetchCriteria::new("search").with_query("rust");
    //! let status = HealthStatus::Healthy;
    //! let token = CancelToken::new();
    //! ```

    pub use crate::{
        AdmissionDecision, CancelToken, ErrorKind, FetchCriteria, FetchOutcome, HealthStatus,
        PipelineBuilder, PipelineConfig, PipelineCoordinator, PipelineError, RateLimiter,
        RecordSink, RequestSpec, SharedDedupSet, SharedRateLimiter, TweetRecord,
    };
}

/// Builder that wires a [`PipelineCoordinator`] from a [`PipelineConfig`].
///
/// Without an explicit transport an [`HttpTransport`] is built from the
/// `api` section; without an explicit clock the [`SystemClock`] is used.
///
/// # Example
///
/// ```rust
/// use tweetpace::{PipelineBuilder, PipelineConfig};
///
/// let coordinator = PipelineBuilder::new()
///     .config(PipelineConfig::default())
///     .try_build();
/// assert!(coordinator.is_ok());
///
/// let mut bad = PipelineConfig::default();
/// bad.pipeline.max_in_flight = 0;
/// assert!(PipelineBuilder::new().config(bad).try_build().is_err());
/// ```
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    transport: Option<std::sync::Arc<dyn Transport>>,
    clock: Option<SharedClock>,
}

impl PipelineBuilder {
    /// Builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configuration.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `transport` instead of building an HTTP client.
    pub fn transport(mut self, transport: std::sync::Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Uses `clock` for all quota arithmetic.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates the configuration and wires the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Config`] for an invalid configuration and
    /// [`BuildError::Transport`] when the HTTP client cannot be built.
    pub fn try_build(self) -> Result<PipelineCoordinator, BuildError> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let api = &self.config.api;
                std::sync::Arc::new(HttpTransport::new(
                    &api.base_url,
                    api.bearer_token.as_deref(),
                    api.endpoints.clone(),
                    api.request_timeout(),
                )?)
            }
        };
        let clock = self
            .clock
            .unwrap_or_else(|| std::sync::Arc::new(SystemClock));

        Ok(PipelineCoordinator::from_config(&self.config, transport, clock))
    }
}
