//! Error kinds shared by the limiter, dispatcher, ingestor and coordinator.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Classification of every failure the pipeline can surface.
///
/// ```text
///     QuotaExceeded ─────► local window full, retry later      (recoverable)
///     RateLimitExceeded ─► server throttled or admission timed out
///     TransportError ────► network / timeout                    (retryable)
///     RetriesExhausted ──► attempts used up
///     ClientError ───────► non-429 4xx, never retried
///     MalformedPayload ──► response body unparsable, never retried
///     Cancelled ─────────► caller asked us to stop
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The local quota window is full.
    QuotaExceeded,
    /// The server signalled throttling, or admission would wait past the timeout.
    RateLimitExceeded,
    /// Non-retryable 4xx response (bad request, auth).
    ClientError,
    /// Network or timeout failure.
    TransportError,
    /// The retry budget ran out.
    RetriesExhausted,
    /// The response could not be parsed at all.
    MalformedPayload,
    /// The caller cancelled the operation.
    Cancelled,
}

impl ErrorKind {
    /// Short stable name, used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota_exceeded",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ClientError => "client_error",
            Self::TransportError => "transport_error",
            Self::RetriesExhausted => "retries_exhausted",
            Self::MalformedPayload => "malformed_payload",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether a later attempt could succeed without caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded | Self::RateLimitExceeded | Self::TransportError
        )
    }

    /// Whether results gathered before this failure are worth returning.
    pub fn is_partial_result(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded | Self::RetriesExhausted | Self::Cancelled
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by any suspension point that observed cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Failures while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The config file is not valid TOML for [`crate::PipelineConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failures while loading or saving persisted quota state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("quota store io error: {0}")]
    Io(#[from] io::Error),
    /// The stored file is not valid JSON.
    #[error("quota store format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Network-level failure: no HTTP status was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request did not complete within the client timeout.
    #[error("request timed out")]
    Timeout,
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The HTTP client could not be built.
    #[error("http client setup failed: {0}")]
    Setup(String),
    /// Any other failure while sending or reading the body.
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Always [`ErrorKind::TransportError`].
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransportError
    }
}

/// Failures while wiring a pipeline from configuration.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The HTTP transport could not be created.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Whole-payload ingestion failure. Per-entry problems are counted, not raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// The payload is not a JSON object of the expected shape.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl IngestError {
    /// Always [`ErrorKind::MalformedPayload`].
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedPayload
    }
}

/// Failures while delivering records to a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Writer error.
    #[error("sink io error: {0}")]
    Io(#[from] io::Error),
    /// Record could not be serialised.
    #[error("sink serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error reported by the coordinator next to whatever records it gathered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct PipelineError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// HTTP status when the failure came from a response.
    pub status: Option<u16>,
}

impl PipelineError {
    /// Creates an error without an HTTP status.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Attaches the HTTP status that caused the failure.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Shorthand for a cancellation error.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "fetch cancelled by caller")
    }
}

impl From<IngestError> for PipelineError {
    fn from(err: IngestError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<Cancelled> for PipelineError {
    fn from(_: Cancelled) -> Self {
        Self::cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::TransportError.is_retryable());
        assert!(ErrorKind::QuotaExceeded.is_retryable());
        assert!(!ErrorKind::ClientError.is_retryable());
        assert!(!ErrorKind::MalformedPayload.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_pipeline_error_display() {
        let err = PipelineError::new(ErrorKind::ClientError, "HTTP 401").with_status(401);
        assert_eq!(err.to_string(), "client_error: HTTP 401");
        assert_eq!(err.status, Some(401));

        let from_ingest: PipelineError = IngestError::MalformedPayload("eof".into()).into();
        assert_eq!(from_ingest.kind, ErrorKind::MalformedPayload);
        assert_eq!(TransportError::Timeout.kind(), ErrorKind::TransportError);
    }
}
