//! # Rate Limiter Configuration
//!
//! Settings for the three layers that decide when a request may go out:
//!
//! ```text
//!     ┌──────────────────────────────────────┐
//!     │ QuotaConfig      hard window limit   │ ← what the API allows
//!     │   limit: 450 per 900_000ms           │
//!     ├──────────────────────────────────────┤
//!     │ SmoothingConfig  token bucket        │ ← how fast we spend it
//!     │   max_burst: 10, refill 1 / 2000ms   │
//!     ├──────────────────────────────────────┤
//!     │ PacingConfig     adaptive delay      │ ← how polite we are
//!     │   base 800ms, ×1.3 on throttle       │
//!     └──────────────────────────────────────┘
//! ```
//!
//! All durations are stored as milliseconds so the structs map one-to-one
//! onto the TOML config file.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Maximum number of refill periods credited in a single refill.
///
/// An endpoint that sat idle for an hour gets at most this many periods of
/// tokens back, which is always enough to fill the bucket anyway.
pub const MAX_REFILL_PERIODS: u64 = 100;

/// Limit for a single endpoint's quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointQuota {
    /// Calls allowed per window.
    pub limit: u64,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl EndpointQuota {
    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Hard per-endpoint quota windows.
///
/// Endpoints without an explicit entry use the default limit and window.
///
/// ```rust
/// use std::time::Duration;
/// use tweetpace::QuotaConfig;
///
/// let config = QuotaConfig::per_window(450, Duration::from_secs(900))
///     .with_endpoint("users/lookup", 300, Duration::from_secs(900));
///
/// assert_eq!(config.quota_for("users/lookup").limit, 300);
/// assert_eq!(config.quota_for("search/recent").limit, 450);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Calls per window for endpoints without an override.
    pub default_limit: u64,
    /// Window length for endpoints without an override.
    pub default_window_ms: u64,
    /// Per-endpoint overrides keyed by endpoint id.
    pub endpoints: BTreeMap<String, EndpointQuota>,
}

impl Default for QuotaConfig {
    /// 450 calls per 15 minutes, the usual search quota of the source API.
    fn default() -> Self {
        Self {
            default_limit: 450,
            default_window_ms: 15 * 60 * 1000,
            endpoints: BTreeMap::new(),
        }
    }
}

impl QuotaConfig {
    /// Same limit for every endpoint.
    pub fn per_window(limit: u64, window: Duration) -> Self {
        Self {
            default_limit: limit,
            default_window_ms: window.as_millis() as u64,
            endpoints: BTreeMap::new(),
        }
    }

    /// Convenience for "N calls per minute".
    pub fn per_minute(limit: u64) -> Self {
        Self::per_window(limit, Duration::from_secs(60))
    }

    /// Adds or replaces an endpoint-specific limit.
    pub fn with_endpoint(mut self, endpoint_id: &str, limit: u64, window: Duration) -> Self {
        self.endpoints.insert(
            endpoint_id.to_string(),
            EndpointQuota {
                limit,
                window_ms: window.as_millis() as u64,
            },
        );
        self
    }

    /// Resolves the limit that applies to `endpoint_id`.
    pub fn quota_for(&self, endpoint_id: &str) -> EndpointQuota {
        self.endpoints
            .get(endpoint_id)
            .copied()
            .unwrap_or(EndpointQuota {
                limit: self.default_limit,
                window_ms: self.default_window_ms,
            })
    }

    /// Checks that every limit and window is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_limit == 0 {
            return Err(ConfigError::Invalid("quota default_limit must be greater than 0"));
        }
        if self.default_window_ms == 0 {
            return Err(ConfigError::Invalid("quota default_window_ms must be greater than 0"));
        }
        for quota in self.endpoints.values() {
            if quota.limit == 0 || quota.window_ms == 0 {
                return Err(ConfigError::Invalid(
                    "endpoint quotas need a non-zero limit and window",
                ));
            }
        }
        Ok(())
    }
}

/// Token-bucket smoothing applied on top of the hard quota.
///
/// Keeps a full window's quota from being spent in one instant.
///
/// ```text
///     max_burst: 10       ← requests that may go back-to-back
///     refill_rate: 1      ← tokens added
///     refill_interval: 2s ← every interval
///
///     Result: bursts of 10, then one request every 2 seconds
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// Bucket capacity.
    pub max_burst: u64,
    /// Tokens added each interval.
    pub refill_rate: u32,
    /// Milliseconds between refills.
    pub refill_interval_ms: u64,
}

impl Default for SmoothingConfig {
    /// Bursts of 10 with one request per two seconds sustained.
    fn default() -> Self {
        Self {
            max_burst: 10,
            refill_rate: 1,
            refill_interval_ms: 2_000,
        }
    }
}

impl SmoothingConfig {
    /// Creates a smoothing layer with explicit parameters.
    pub fn new(max_burst: u64, refill_rate: u32, refill_interval_ms: u64) -> Self {
        Self {
            max_burst,
            refill_rate,
            refill_interval_ms,
        }
    }

    /// `requests_per_second` sustained with a burst of twice that.
    pub fn per_second(requests_per_second: u32) -> Self {
        Self {
            max_burst: (requests_per_second as u64) * 2,
            refill_rate: requests_per_second,
            refill_interval_ms: 1000,
        }
    }

    /// `requests_per_minute` sustained, bursting up to the same amount.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self {
            max_burst: requests_per_minute as u64,
            refill_rate: requests_per_minute,
            refill_interval_ms: 60_000,
        }
    }

    /// Sets the burst as a multiple of the refill rate.
    pub fn with_burst_multiplier(mut self, multiplier: u32) -> Self {
        self.max_burst = (self.refill_rate as u64) * (multiplier as u64);
        self
    }

    /// Sustained requests per second implied by the refill parameters.
    pub fn effective_rate_per_second(&self) -> f64 {
        if self.refill_interval_ms == 0 {
            0.0
        } else {
            (self.refill_rate as f64 * 1000.0) / self.refill_interval_ms as f64
        }
    }

    /// Checks the bucket parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_burst == 0 {
            return Err(ConfigError::Invalid("smoothing max_burst must be greater than 0"));
        }
        if self.refill_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "smoothing refill_interval_ms must be greater than 0",
            ));
        }
        if self.refill_rate == 0 {
            return Err(ConfigError::Invalid("smoothing refill_rate must be greater than 0"));
        }
        if self.refill_rate as u64 > self.max_burst {
            return Err(ConfigError::Invalid("smoothing refill_rate should not exceed max_burst"));
        }
        Ok(())
    }
}

/// Adaptive delay inserted before every dispatched request.
///
/// The delay grows when the server pushes back and shrinks again after a run
/// of successes. After `detection_threshold` consecutive failures the pacer
/// holds all traffic for `cooldown_period_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// When false the pacer never sleeps but still records stats.
    pub enabled: bool,
    /// Starting (and floor) delay in milliseconds.
    pub base_delay_ms: u64,
    /// Lower clamp applied after priority scaling and jitter.
    pub min_delay_ms: u64,
    /// Upper clamp for any delay.
    pub max_delay_ms: u64,
    /// Multiplier applied when the server throttles.
    pub adaptive_factor: f64,
    /// Hold time once the failure threshold is reached.
    pub cooldown_period_ms: u64,
    /// Consecutive failures that trigger a cooldown.
    pub detection_threshold: u32,
    /// Responses slower than this nudge the delay up.
    pub slow_response_ms: u64,
    /// Consecutive successes needed before the delay shrinks.
    pub recovery_successes: u32,
    /// Soft ceiling on paced requests per rolling minute; 0 disables it.
    pub requests_per_minute: u32,
    /// Add 100..300ms of random jitter to each delay.
    pub jitter: bool,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 800,
            min_delay_ms: 100,
            max_delay_ms: 15_000,
            adaptive_factor: 1.3,
            cooldown_period_ms: 30_000,
            detection_threshold: 3,
            slow_response_ms: 5_000,
            recovery_successes: 20,
            requests_per_minute: 80,
            jitter: true,
        }
    }
}

impl PacingConfig {
    /// Pacing that records stats but never delays. Used by tests and by
    /// callers that rely purely on the quota and smoothing layers.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            jitter: false,
            requests_per_minute: 0,
            ..Self::default()
        }
    }

    /// Base delay as a `Duration`.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Checks that clamps and factors make sense.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid("pacing max_delay_ms must be >= base_delay_ms"));
        }
        if self.max_delay_ms < self.min_delay_ms {
            return Err(ConfigError::Invalid("pacing max_delay_ms must be >= min_delay_ms"));
        }
        if !(self.adaptive_factor >= 1.0) {
            return Err(ConfigError::Invalid("pacing adaptive_factor must be >= 1.0"));
        }
        if self.detection_threshold == 0 {
            return Err(ConfigError::Invalid("pacing detection_threshold must be greater than 0"));
        }
        Ok(())
    }
}

/// Everything the [`crate::RateLimiter`] needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Hard windows.
    pub quota: QuotaConfig,
    /// Optional smoothing bucket; `None` admits straight off the quota.
    pub smoothing: Option<SmoothingConfig>,
    /// Longest wait `admit` will turn into a `Delay` instead of a `Reject`.
    pub admission_timeout_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            quota: QuotaConfig::default(),
            smoothing: Some(SmoothingConfig::default()),
            admission_timeout_ms: 60_000,
        }
    }
}

impl LimiterConfig {
    /// Limiter with the given quota and no smoothing.
    pub fn new(quota: QuotaConfig) -> Self {
        Self {
            quota,
            smoothing: None,
            ..Self::default()
        }
    }

    /// Enables the smoothing bucket.
    pub fn with_smoothing(mut self, smoothing: SmoothingConfig) -> Self {
        self.smoothing = Some(smoothing);
        self
    }

    /// Sets the admission timeout.
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Admission timeout as a `Duration`.
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    /// Validates the quota and, when present, the smoothing layer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quota.validate()?;
        if let Some(smoothing) = &self.smoothing {
            smoothing.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_overrides() {
        let config = QuotaConfig::per_minute(60).with_endpoint("timeline", 5, Duration::from_secs(1));

        assert_eq!(
            config.quota_for("timeline"),
            EndpointQuota {
                limit: 5,
                window_ms: 1000
            }
        );
        assert_eq!(config.quota_for("other").limit, 60);
        assert_eq!(config.quota_for("other").window(), Duration::from_secs(60));
    }

    #[test]
    fn test_quota_validation() {
        assert!(QuotaConfig::default().validate().is_ok());
        assert!(QuotaConfig::per_minute(0).validate().is_err());
        assert!(QuotaConfig::per_window(5, Duration::ZERO).validate().is_err());

        let bad_override = QuotaConfig::default().with_endpoint("x", 0, Duration::from_secs(1));
        assert!(bad_override.validate().is_err());
    }

    #[test]
    fn test_smoothing_builders() {
        let config = SmoothingConfig::per_second(100);
        assert_eq!(config.max_burst, 200);
        assert_eq!(config.effective_rate_per_second(), 100.0);

        let config = SmoothingConfig::per_minute(120);
        assert_eq!(config.refill_interval_ms, 60_000);
        assert_eq!(config.effective_rate_per_second(), 2.0);

        let config = SmoothingConfig::per_second(10).with_burst_multiplier(5);
        assert_eq!(config.max_burst, 50);
    }

    #[test]
    fn test_smoothing_validation() {
        assert!(SmoothingConfig::default().validate().is_ok());
        assert!(SmoothingConfig::new(0, 1, 1000).validate().is_err());
        assert!(SmoothingConfig::new(10, 1, 0).validate().is_err());
        assert!(SmoothingConfig::new(10, 20, 1000).validate().is_err());
    }

    #[test]
    fn test_pacing_defaults_and_validation() {
        let pacing = PacingConfig::default();
        assert!(pacing.enabled);
        assert_eq!(pacing.base_delay(), Duration::from_millis(800));
        assert!(pacing.validate().is_ok());

        let disabled = PacingConfig::disabled();
        assert!(!disabled.enabled);
        assert!(!disabled.jitter);

        let bad = PacingConfig {
            adaptive_factor: 0.5,
            ..PacingConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_limiter_config_roundtrips_through_toml() {
        let config = LimiterConfig::new(QuotaConfig::per_minute(2))
            .with_smoothing(SmoothingConfig::new(4, 1, 500))
            .with_admission_timeout(Duration::from_secs(5));

        let text = toml::to_string(&config).unwrap();
        let parsed: LimiterConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.admission_timeout(), Duration::from_secs(5));
    }
}
