//! # Pipeline Configuration
//!
//! One TOML file configures the whole pipeline:
//!
//! ```text
//!     admission_timeout_ms = 60000
//!     state_path = "quota-state.json"
//!
//!     [api]        base_url, bearer_token, endpoints, request_timeout_ms
//!     [quota]      default_limit, default_window_ms, [quota.endpoints.<id>]
//!     [smoothing]  max_burst, refill_rate, refill_interval_ms
//!     [retry]      max_retries, base_backoff_ms, jitter
//!     [pacing]     base_delay_ms, adaptive_factor, cooldown_period_ms, ...
//!     [pipeline]   max_in_flight, page_size, parameter names
//! ```
//!
//! Every section is optional; missing keys take their defaults.

use crate::dispatcher::RequestSpec;
use crate::error::ConfigError;
use crate::rate_limiter::{LimiterConfig, PacingConfig, QuotaConfig, SmoothingConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where and how to reach the source API.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Scheme and host, e.g. `https://api.twitter.com`.
    pub base_url: String,
    /// Bearer credential sent on every request.
    pub bearer_token: Option<String>,
    /// Endpoint id to URL path.
    pub endpoints: BTreeMap<String, String>,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("search".to_string(), "2/tweets/search/recent".to_string());
        Self {
            base_url: "https://api.twitter.com".to_string(),
            bearer_token: None,
            endpoints,
            request_timeout_ms: 30_000,
        }
    }
}

impl ApiConfig {
    /// Request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// Keeps the token out of logs.
impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "***"))
            .field("endpoints", &self.endpoints)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

/// Retry policy applied to each [`RequestSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff step in milliseconds.
    pub base_backoff_ms: u64,
    /// Randomise backoff by ±20%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// First backoff step as a `Duration`.
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    /// Empty request for `endpoint_id` carrying this retry policy.
    pub fn request_template(&self, endpoint_id: impl Into<String>) -> RequestSpec {
        RequestSpec::new(endpoint_id)
            .with_max_retries(self.max_retries)
            .with_base_backoff(self.base_backoff())
    }
}

/// Coordinator concurrency and pagination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Cursor chains fetched at once.
    pub max_in_flight: usize,
    /// Entries requested per page.
    pub page_size: u32,
    /// Parameter carrying the search query.
    pub query_param: String,
    /// Parameter carrying the pagination cursor.
    pub cursor_param: String,
    /// Parameter carrying the page size.
    pub page_size_param: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            page_size: 100,
            query_param: "query".to_string(),
            cursor_param: "next_token".to_string(),
            page_size_param: "max_results".to_string(),
        }
    }
}

/// Complete configuration.
///
/// # Example
///
/// ```rust
/// use tweetpace::PipelineConfig;
///
/// let config = PipelineConfig::from_toml_str(r#"
///     admission_timeout_ms = 5000
///
///     [quota]
///     default_limit = 180
///
///     [pipeline]
///     max_in_flight = 2
/// "#).unwrap();
///
/// assert_eq!(config.quota.default_limit, 180);
/// assert_eq!(config.pipeline.max_in_flight, 2);
/// assert_eq!(config.retry.max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// API connection.
    pub api: ApiConfig,
    /// Hard windows.
    pub quota: QuotaConfig,
    /// Smoothing bucket.
    pub smoothing: SmoothingConfig,
    /// Set to false to admit straight off the quota.
    pub smoothing_enabled: bool,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Longest admission wait before a request is rejected.
    pub admission_timeout_ms: u64,
    /// Adaptive pacing.
    pub pacing: PacingConfig,
    /// Coordinator settings.
    pub pipeline: CoordinatorConfig,
    /// Persisted quota file; none keeps quota in memory only.
    pub state_path: Option<PathBuf>,
    /// Period of the background quota flush.
    pub state_flush_interval_ms: u64,
    /// Bound on the dedup set; none means unbounded.
    pub dedup_capacity: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            quota: QuotaConfig::default(),
            smoothing: SmoothingConfig::default(),
            smoothing_enabled: true,
            retry: RetryConfig::default(),
            admission_timeout_ms: 60_000,
            pacing: PacingConfig::default(),
            pipeline: CoordinatorConfig::default(),
            state_path: None,
            state_flush_interval_ms: 30_000,
            dedup_capacity: None,
        }
    }
}

impl PipelineConfig {
    /// Parses and validates TOML.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Limiter settings derived from this config.
    pub fn limiter_config(&self) -> LimiterConfig {
        let mut limiter = LimiterConfig::new(self.quota.clone())
            .with_admission_timeout(Duration::from_millis(self.admission_timeout_ms));
        if self.smoothing_enabled {
            limiter = limiter.with_smoothing(self.smoothing);
        }
        limiter
    }

    /// Background flush period as a `Duration`.
    pub fn state_flush_interval(&self) -> Duration {
        Duration::from_millis(self.state_flush_interval_ms)
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limiter_config().validate()?;
        self.pacing.validate()?;

        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api base_url must not be empty"));
        }
        if self.api.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("api request_timeout_ms must be greater than 0"));
        }
        if self.pipeline.max_in_flight == 0 {
            return Err(ConfigError::Invalid("pipeline max_in_flight must be greater than 0"));
        }
        if self.pipeline.page_size == 0 {
            return Err(ConfigError::Invalid("pipeline page_size must be greater than 0"));
        }
        if self.state_path.is_some() && self.state_flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "state_flush_interval_ms must be greater than 0 when state_path is set",
            ));
        }
        Ok(())
    }
}

/// Supplies the current configuration.
pub trait ConfigProvider: Send + Sync {
    /// Snapshot of the configuration in force.
    fn get_config(&self) -> PipelineConfig;
}

/// [`ConfigProvider`] over a fixed value.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(PipelineConfig);

impl StaticConfig {
    /// Wraps `config`.
    pub fn new(config: PipelineConfig) -> Self {
        Self(config)
    }
}

impl ConfigProvider for StaticConfig {
    fn get_config(&self) -> PipelineConfig {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.limiter_config().smoothing.is_some());
        assert_eq!(config.limiter_config().admission_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_full_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            state_path = "state.json"
            dedup_capacity = 5000
            smoothing_enabled = false

            [api]
            base_url = "https://example.test"
            bearer_token = "secret"
            endpoints = { search = "2/tweets/search/all" }

            [quota]
            default_limit = 300
            default_window_ms = 900000

            [quota.endpoints.timeline]
            limit = 900
            window_ms = 900000

            [retry]
            max_retries = 5
            base_backoff_ms = 250
            jitter = false

            [pacing]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.api.endpoints["search"], "2/tweets/search/all");
        assert_eq!(config.quota.quota_for("timeline").limit, 900);
        assert_eq!(config.quota.quota_for("search").limit, 300);
        assert_eq!(config.dedup_capacity, Some(5000));
        assert!(config.limiter_config().smoothing.is_none());
        assert!(!config.pacing.enabled);

        let spec = config.retry.request_template("search");
        assert_eq!(spec.max_retries, 5);
        assert_eq!(spec.base_backoff, Duration::from_millis(250));

        assert!(!format!("{:?}", config.api).contains("secret"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = PipelineConfig::from_toml_str("[pipeline]\nmax_in_flight = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = PipelineConfig::from_toml_str("[quota]\ndefault_limit = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = PipelineConfig::from_toml_str("admission_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\npage_size = 10").unwrap();
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.pipeline.page_size, 10);

        let missing = PipelineConfig::load(Path::new("/nonexistent/tweetpace.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticConfig::new(PipelineConfig::default());
        assert_eq!(provider.get_config(), PipelineConfig::default());
    }
}
