//! # Pipeline Coordinator
//!
//! The single entry point callers use: "fetch N records matching these
//! criteria".
//!
//! ## Module Structure
//!
//! ```text
//!     pipeline/
//!     ├── mod.rs          (You are here - FetchCriteria, coordinator loop)
//!     └── sink.rs         (RecordSink, JSON lines and memory sinks)
//! ```
//!
//! ## Fetch Loop
//!
//! ```text
//!     queries ──► one cursor chain each, up to max_in_flight at once
//!
//!     chain:  spec(query, cursor) ──► Dispatcher ──► Ingestor ──► records
//!               ▲                                        │
//!               └────────── next cursor ◄────────────────┘
//!
//!     stop when: target reached, cursor exhausted, a request failed,
//!                or the caller cancelled
//!
//!     output = chain order, page order, truncated to target
//! ```
//!
//! Every chain shares the same [`Dispatcher`] and therefore the same
//! [`RateLimiter`](crate::RateLimiter), so concurrency never widens the
//! quota. A client error or malformed payload in any chain stops the others.

mod sink;

pub use sink::{JsonLinesSink, MemorySink, RecordSink};

use crate::cancel::CancelToken;
use crate::config::{CoordinatorConfig, PipelineConfig, RetryConfig};
use crate::dispatcher::{Dispatcher, FetchResult, RequestSpec, Transport};
use crate::error::{ErrorKind, PipelineError, SinkError};
use crate::ingest::{DedupSet, TweetIngestor, TweetRecord};
use crate::rate_limiter::{
    AdaptivePacer, JsonFileStore, QuotaTracker, RateLimiter, SharedClock,
};
use futures_util::stream::{self, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCriteria {
    /// Endpoint every request goes to.
    pub endpoint_id: String,
    /// One independent cursor chain per query. Empty means a single chain
    /// without a query parameter.
    pub queries: Vec<String>,
    /// Overrides the configured page size.
    pub page_size: Option<u32>,
    /// Extra parameters sent with every page.
    pub params: Vec<(String, String)>,
}

impl FetchCriteria {
    /// Criteria for `endpoint_id` with no queries.
    pub fn new(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            queries: Vec::new(),
            page_size: None,
            params: Vec::new(),
        }
    }

    /// Adds a query chain.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.queries.push(query.into());
        self
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Adds a parameter sent with every page.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

/// Records gathered by one [`PipelineCoordinator::fetch`], plus the error
/// that stopped it early, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Records in chain order, then page order.
    pub records: Vec<TweetRecord>,
    /// Entries skipped as duplicates or invalid.
    pub skipped: usize,
    /// Pages ingested.
    pub pages: usize,
    /// Why the fetch stopped short, if it did.
    pub error: Option<PipelineError>,
}

impl FetchOutcome {
    /// Whether the fetch finished without error.
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// Writes and removes every buffered record. Returns how many were
    /// written; on a sink error the unwritten records stay buffered.
    pub fn drain_into(&mut self, sink: &mut dyn RecordSink) -> Result<usize, SinkError> {
        let mut written = 0;
        while written < self.records.len() {
            if let Err(err) = sink.write(&self.records[written]) {
                self.records.drain(..written);
                return Err(err);
            }
            written += 1;
        }
        self.records.clear();
        sink.flush()?;
        Ok(written)
    }
}

#[derive(Default)]
struct ChainResult {
    records: Vec<TweetRecord>,
    skipped: usize,
    pages: usize,
    error: Option<PipelineError>,
}

/// Failures no later page could recover from and that leave nothing worth
/// continuing for.
fn is_fatal(kind: ErrorKind) -> bool {
    !kind.is_retryable() && !kind.is_partial_result()
}

/// Drives dispatcher and ingestor for callers.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tweetpace::{
///     CancelToken, DedupSet, Dispatcher, FetchCriteria, LimiterConfig, PipelineCoordinator,
///     QuotaConfig, RateLimiter, ScriptedTransport, SystemClock, TransportResponse,
///     TweetIngestor,
/// };
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let transport = Arc::new(ScriptedTransport::new());
/// transport.push_response(TransportResponse::new(
///     200,
///     r#"{"data":[{"id":"1","created_at":"2024-05-13T09:30:00Z","text":"hello"}]}"#,
/// ));
///
/// let limiter = Arc::new(RateLimiter::new(
///     LimiterConfig::new(QuotaConfig::per_minute(60)),
///     Arc::new(SystemClock),
/// ));
/// let coordinator = PipelineCoordinator::new(
///     Arc::new(Dispatcher::new(limiter, transport)),
///     TweetIngestor::new(Arc::new(DedupSet::new())),
/// );
///
/// let outcome = coordinator
///     .fetch(&FetchCriteria::new("search").with_query("rust"), 10, &CancelToken::new())
///     .await;
/// assert!(outcome.is_complete());
/// assert_eq!(outcome.records.len(), 1);
/// # }
/// ```
pub struct PipelineCoordinator {
    dispatcher: Arc<Dispatcher>,
    ingestor: TweetIngestor,
    settings: CoordinatorConfig,
    retry: RetryConfig,
}

impl PipelineCoordinator {
    /// Coordinator with default concurrency and retry settings.
    pub fn new(dispatcher: Arc<Dispatcher>, ingestor: TweetIngestor) -> Self {
        Self {
            dispatcher,
            ingestor,
            settings: CoordinatorConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Wires a full pipeline from `config`.
    ///
    /// When `state_path` is set the quota tracker is attached to a
    /// [`JsonFileStore`] and loaded from it; an unreadable store is logged
    /// and the tracker starts empty.
    pub fn from_config(
        config: &PipelineConfig,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> Self {
        let limiter_config = config.limiter_config();
        let mut tracker = QuotaTracker::new(limiter_config.quota.clone(), clock.clone());
        if let Some(path) = &config.state_path {
            tracker = tracker.with_store(
                Arc::new(JsonFileStore::new(path.clone())),
                config.state_flush_interval(),
            );
            if let Err(err) = tracker.load_from_store() {
                warn!("Ignoring unreadable quota state {}: {}", path.display(), err);
            }
        }

        let limiter = Arc::new(RateLimiter::with_tracker(
            limiter_config,
            Arc::new(tracker),
            clock,
        ));
        let dispatcher = Dispatcher::new(limiter, transport)
            .with_pacer(Arc::new(AdaptivePacer::new(config.pacing)))
            .with_jitter(config.retry.jitter);

        let dedup = match config.dedup_capacity {
            Some(capacity) => DedupSet::with_capacity(capacity),
            None => DedupSet::new(),
        };

        Self::new(Arc::new(dispatcher), TweetIngestor::new(Arc::new(dedup)))
            .with_settings(config.pipeline.clone())
            .with_retry(config.retry)
    }

    /// Replaces concurrency and pagination settings.
    pub fn with_settings(mut self, settings: CoordinatorConfig) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the retry policy used for every page request.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Shared dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Shared quota tracker.
    pub fn quota(&self) -> &Arc<QuotaTracker> {
        self.dispatcher.limiter().quota()
    }

    /// The ingestor and its dedup set.
    pub fn ingestor(&self) -> &TweetIngestor {
        &self.ingestor
    }

    /// Forgets every record delivered so far.
    pub fn reset_session(&self) {
        self.ingestor.dedup().reset();
        info!("Dedup session reset");
    }

    /// Fetches up to `target_count` new records.
    ///
    /// Never fails outright: whatever was gathered is returned, with
    /// `error` set when the fetch stopped early. A target of zero returns
    /// immediately without touching the network.
    pub async fn fetch(
        &self,
        criteria: &FetchCriteria,
        target_count: usize,
        cancel: &CancelToken,
    ) -> FetchOutcome {
        if target_count == 0 {
            return FetchOutcome::default();
        }

        let queries: Vec<Option<&str>> = if criteria.queries.is_empty() {
            vec![None]
        } else {
            criteria.queries.iter().map(|q| Some(q.as_str())).collect()
        };
        let session = cancel.child();
        let collected = AtomicUsize::new(0);
        let max_in_flight = self.settings.max_in_flight.max(1);

        info!(
            "Fetching {} records from {} ({} chains, {} in flight)",
            target_count,
            criteria.endpoint_id,
            queries.len(),
            max_in_flight
        );

        let chains: Vec<ChainResult> = stream::iter(queries.into_iter().enumerate())
            .map(|(index, query)| {
                self.run_chain(index, criteria, query, target_count, &collected, &session)
            })
            .buffered(max_in_flight)
            .collect()
            .await;

        let mut outcome = FetchOutcome::default();
        let mut fatal = None;
        let mut first_error = None;
        for chain in chains {
            outcome.records.extend(chain.records);
            outcome.skipped += chain.skipped;
            outcome.pages += chain.pages;
            if let Some(err) = chain.error {
                if is_fatal(err.kind) {
                    fatal.get_or_insert(err);
                } else if err.kind != ErrorKind::Cancelled {
                    first_error.get_or_insert(err);
                }
            }
        }
        outcome.error = fatal.or_else(|| {
            if cancel.is_cancelled() {
                Some(PipelineError::cancelled())
            } else {
                first_error
            }
        });

        if outcome.records.len() > target_count {
            let surplus = outcome.records.split_off(target_count);
            for record in &surplus {
                self.ingestor.dedup().forget(record);
            }
            debug!("Released {} surplus records", surplus.len());
        }

        match &outcome.error {
            Some(err) => warn!(
                "Fetch stopped early with {} records after {} pages: {}",
                outcome.records.len(),
                outcome.pages,
                err
            ),
            None => info!(
                "Fetched {} records in {} pages ({} skipped)",
                outcome.records.len(),
                outcome.pages,
                outcome.skipped
            ),
        }
        outcome
    }

    fn page_request(
        &self,
        criteria: &FetchCriteria,
        query: Option<&str>,
        cursor: Option<&str>,
    ) -> RequestSpec {
        let page_size = criteria.page_size.unwrap_or(self.settings.page_size);
        let mut spec = self.retry.request_template(criteria.endpoint_id.clone());
        if let Some(query) = query {
            spec = spec.with_param(self.settings.query_param.clone(), query);
        }
        spec = spec.with_param(self.settings.page_size_param.clone(), page_size.to_string());
        for (key, value) in &criteria.params {
            spec = spec.with_param(key.clone(), value.clone());
        }
        if let Some(cursor) = cursor {
            spec = spec.with_param(self.settings.cursor_param.clone(), cursor);
        }
        spec
    }

    async fn run_chain(
        &self,
        index: usize,
        criteria: &FetchCriteria,
        query: Option<&str>,
        target_count: usize,
        collected: &AtomicUsize,
        session: &CancelToken,
    ) -> ChainResult {
        let mut result = ChainResult::default();
        let mut cursor: Option<String> = None;

        loop {
            if collected.load(Ordering::Acquire) >= target_count {
                break;
            }
            if session.is_cancelled() {
                result.error = Some(PipelineError::cancelled());
                break;
            }

            let spec = self.page_request(criteria, query, cursor.as_deref());
            let payload = match self.dispatcher.execute(&spec, session).await {
                FetchResult::Success { payload, .. } => payload,
                FetchResult::Failure {
                    kind,
                    attempts,
                    status,
                } => {
                    let mut err = PipelineError::new(
                        kind,
                        format!("chain {} page {} failed after {} attempts", index, result.pages + 1, attempts),
                    );
                    if let Some(status) = status {
                        err = err.with_status(status);
                    }
                    if is_fatal(kind) {
                        session.cancel();
                    }
                    result.error = Some(err);
                    break;
                }
            };

            let batch = match self.ingestor.ingest(&payload) {
                Ok(batch) => batch,
                Err(err) => {
                    session.cancel();
                    result.error = Some(err.into());
                    break;
                }
            };

            result.pages += 1;
            result.skipped += batch.skipped;
            collected.fetch_add(batch.records.len(), Ordering::AcqRel);
            info!(
                "Chain {} page {}: {} new, {} skipped",
                index,
                result.pages,
                batch.records.len(),
                batch.skipped
            );
            result.records.extend(batch.records);

            match batch.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                Some(_) => {
                    warn!("Chain {} returned the same cursor twice; stopping", index);
                    break;
                }
                None => {
                    debug!("Chain {} exhausted after {} pages", index, result.pages);
                    break;
                }
            }
        }
        result
    }
}

impl fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("dispatcher", &self.dispatcher)
            .field("ingestor", &self.ingestor)
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{ScriptedTransport, TransportResponse};
    use crate::error::TransportError;
    use crate::rate_limiter::{LimiterConfig, QuotaConfig, SystemClock};
    use async_trait::async_trait;
    use std::time::Duration;

    fn page(ids: &[&str], next: Option<&str>) -> TransportResponse {
        let entries: Vec<String> = ids
            .iter()
            .map(|id| {
                format!(
                    r#"{{"id":"{}","author_id":"1","created_at":"2024-05-13T09:30:00Z","text":"post {}"}}"#,
                    id, id
                )
            })
            .collect();
        let meta = match next {
            Some(token) => format!(r#","meta":{{"next_token":"{}"}}"#, token),
            None => String::new(),
        };
        TransportResponse::new(200, format!(r#"{{"data":[{}]{}}}"#, entries.join(","), meta))
    }

    fn coordinator(transport: Arc<dyn Transport>, limit: u64) -> PipelineCoordinator {
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig::new(QuotaConfig::per_minute(limit))
                .with_admission_timeout(Duration::from_secs(5)),
            Arc::new(SystemClock),
        ));
        let dispatcher = Dispatcher::new(limiter, transport).with_jitter(false);
        PipelineCoordinator::new(
            Arc::new(dispatcher),
            TweetIngestor::new(Arc::new(DedupSet::new())),
        )
        .with_retry(RetryConfig {
            max_retries: 1,
            base_backoff_ms: 1,
            jitter: false,
        })
    }

    /// Serves pages keyed by the query parameter, following cursors.
    #[derive(Debug)]
    struct QueryRouter;

    #[async_trait]
    impl Transport for QueryRouter {
        async fn send(
            &self,
            _endpoint_id: &str,
            params: &[(String, String)],
        ) -> Result<TransportResponse, TransportError> {
            let get = |key: &str| {
                params
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
            };
            Ok(match (get("query"), get("next_token")) {
                (Some("a"), None) => page(&["a1", "a2"], Some("a-p2")),
                (Some("a"), Some("a-p2")) => page(&["a3"], None),
                (Some("b"), None) => page(&["b1"], None),
                (Some("bad"), _) => TransportResponse::new(403, "forbidden"),
                _ => TransportResponse::new(400, "unknown"),
            })
        }
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(is_fatal(ErrorKind::ClientError));
        assert!(is_fatal(ErrorKind::MalformedPayload));
        for kind in [
            ErrorKind::QuotaExceeded,
            ErrorKind::RateLimitExceeded,
            ErrorKind::TransportError,
            ErrorKind::RetriesExhausted,
            ErrorKind::Cancelled,
        ] {
            assert!(!is_fatal(kind), "{} should not stop other chains", kind);
        }
    }

    #[test]
    fn test_page_request_carries_retry_policy_and_params() {
        let coordinator = coordinator(Arc::new(ScriptedTransport::new()), 10);
        let criteria = FetchCriteria::new("search")
            .with_page_size(25)
            .with_param("lang", "en");

        let spec = coordinator.page_request(&criteria, Some("rust"), Some("abc"));
        assert_eq!(spec.endpoint_id, "search");
        assert_eq!(spec.max_retries, 1);
        assert_eq!(spec.base_backoff, Duration::from_millis(1));

        let params: Vec<(&str, &str)> = spec
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(
            params,
            vec![
                ("query", "rust"),
                ("max_results", "25"),
                ("lang", "en"),
                ("next_token", "abc"),
            ]
        );
    }

    #[tokio::test]
    async fn test_zero_target_skips_network() {
        let transport = Arc::new(ScriptedTransport::new());
        let coordinator = coordinator(transport.clone(), 10);

        let outcome = coordinator
            .fetch(&FetchCriteria::new("search").with_query("x"), 0, &CancelToken::new())
            .await;
        assert!(outcome.records.is_empty());
        assert!(outcome.is_complete());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_follows_cursor_until_exhausted() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(page(&["1", "2"], Some("p2")));
        transport.push_response(page(&["3"], None));
        let coordinator = coordinator(transport.clone(), 10);

        let outcome = coordinator
            .fetch(&FetchCriteria::new("search").with_query("rust"), 10, &CancelToken::new())
            .await;
        let ids: Vec<&str> = outcome.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(outcome.pages, 2);
        assert!(outcome.is_complete());

        let calls = transport.calls();
        assert!(calls[1].1.contains(&("next_token".to_string(), "p2".to_string())));
        assert!(calls[0].1.contains(&("max_results".to_string(), "100".to_string())));
    }

    #[tokio::test]
    async fn test_truncates_to_target_and_releases_surplus() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(page(&["1", "2", "3"], Some("p2")));
        let coordinator = coordinator(transport.clone(), 10);

        let outcome = coordinator
            .fetch(&FetchCriteria::new("search"), 2, &CancelToken::new())
            .await;
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(transport.call_count(), 1);

        let dedup = coordinator.ingestor().dedup();
        assert!(dedup.contains_id("1"));
        assert!(!dedup.contains_id("3"));
    }

    #[tokio::test]
    async fn test_concurrent_chains_keep_chain_order() {
        let coordinator = coordinator(Arc::new(QueryRouter), 10).with_settings(CoordinatorConfig {
            max_in_flight: 2,
            ..CoordinatorConfig::default()
        });

        let criteria = FetchCriteria::new("search").with_query("a").with_query("b");
        let outcome = coordinator.fetch(&criteria, 100, &CancelToken::new()).await;
        let ids: Vec<&str> = outcome.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "a3", "b1"]);
        assert_eq!(outcome.pages, 3);
        assert!(outcome.is_complete());
    }

    #[tokio::test]
    async fn test_client_error_reported_with_partial_results() {
        // Sequential chains so "b" finishes before "bad" stops the session.
        let coordinator = coordinator(Arc::new(QueryRouter), 10).with_settings(CoordinatorConfig {
            max_in_flight: 1,
            ..CoordinatorConfig::default()
        });

        let criteria = FetchCriteria::new("search").with_query("b").with_query("bad");
        let outcome = coordinator.fetch(&criteria, 100, &CancelToken::new()).await;
        let err = outcome.error.clone().unwrap();
        assert_eq!(err.kind, ErrorKind::ClientError);
        assert_eq!(err.status, Some(403));
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_returns_partial_results() {
        let transport = Arc::new(ScriptedTransport::new().with_fallback(Ok(page(&[], Some("x")))));
        transport.push_response(page(&["1"], Some("p2")));
        // One call per minute: the second page cannot be admitted in time.
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig::new(QuotaConfig::per_minute(1))
                .with_admission_timeout(Duration::from_millis(50)),
            Arc::new(SystemClock),
        ));
        let coordinator = PipelineCoordinator::new(
            Arc::new(Dispatcher::new(limiter, transport.clone())),
            TweetIngestor::new(Arc::new(DedupSet::new())),
        );

        let outcome = coordinator
            .fetch(&FetchCriteria::new("search"), 10, &CancelToken::new())
            .await;
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::RateLimitExceeded);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_page_stops_fetch() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(TransportResponse::new(200, "<html>"));
        let coordinator = coordinator(transport, 10);

        let outcome = coordinator
            .fetch(&FetchCriteria::new("search"), 10, &CancelToken::new())
            .await;
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::MalformedPayload);
        assert!(outcome.records.is_empty());
    }

    #[tokio::test]
    async fn test_drain_into_sink() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(page(&["1", "2"], None));
        let coordinator = coordinator(transport, 10);

        let mut outcome = coordinator
            .fetch(&FetchCriteria::new("search"), 10, &CancelToken::new())
            .await;
        let mut sink = MemorySink::new();
        assert_eq!(outcome.drain_into(&mut sink).unwrap(), 2);
        assert!(outcome.records.is_empty());
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_session_allows_refetch() {
        let transport = Arc::new(ScriptedTransport::new().with_fallback(Ok(page(&["1"], None))));
        let coordinator = coordinator(transport, 10);
        let criteria = FetchCriteria::new("search");

        assert_eq!(coordinator.fetch(&criteria, 5, &CancelToken::new()).await.records.len(), 1);
        let again = coordinator.fetch(&criteria, 5, &CancelToken::new()).await;
        assert!(again.records.is_empty());
        assert_eq!(again.skipped, 1);

        coordinator.reset_session();
        assert_eq!(coordinator.fetch(&criteria, 5, &CancelToken::new()).await.records.len(), 1);
    }
}
