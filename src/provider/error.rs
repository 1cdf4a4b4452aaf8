//! Transport-level error types for provider adapters.

use std::time::Duration;
use thiserror::Error;

/// Additional context from provider failures for debugging.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// HTTP status code from the provider.
    pub http_status: Option<u16>,
    /// Provider-specific error code (e.g. "rate_limit_exceeded").
    pub provider_code: Option<String>,
    /// Request ID from provider (x-request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Expected failure modes of one provider call.
///
/// Every variant carries the provider identity and the attempt count at
/// which the adapter gave up; the adapter stamps the final count after its
/// retry loop.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The call did not complete within the per-call timeout - retryable.
    #[error("{provider}: timeout after {after:?} (attempt {attempts})")]
    Timeout {
        provider: String,
        attempts: u32,
        after: Duration,
    },

    /// Connection-level failure (refused, reset, DNS) - retryable.
    #[error("{provider}: connection failed: {message} (attempt {attempts})")]
    Connect {
        provider: String,
        attempts: u32,
        message: String,
    },

    /// Non-2xx HTTP status. Retryable for 429 and 5xx only.
    #[error("{provider}: HTTP {status}: {message} (attempt {attempts})")]
    Status {
        provider: String,
        attempts: u32,
        status: u16,
        message: String,
        context: ErrorContext,
    },

    /// Response body could not be used (oversized, not JSON) - permanent.
    #[error("{provider}: invalid response body: {message}")]
    InvalidBody { provider: String, message: String },

    /// Endpoint construction problem (bad endpoint URL, bad header value).
    #[error("configuration error: {0}")]
    Config(String),
}

impl TransportError {
    pub fn timeout(provider: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            provider: provider.into(),
            attempts: 1,
            after,
        }
    }

    pub fn connect(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            provider: provider.into(),
            attempts: 1,
            message: message.into(),
        }
    }

    pub fn status(
        provider: impl Into<String>,
        status: u16,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Self::Status {
            provider: provider.into(),
            attempts: 1,
            status,
            message: message.into(),
            context,
        }
    }

    pub fn invalid_body(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidBody {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the adapter may retry this failure.
    ///
    /// 4xx statuses are permanent per-item failures; timeouts, connection
    /// resets and 5xx are idempotent-safe to retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Connect { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidBody { .. } => false,
            Self::Config(_) => false,
        }
    }

    /// Short error code for logging and per-item failure records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Connect { .. } => "connect_error",
            Self::Status { status, .. } if *status == 429 => "rate_limited",
            Self::Status { status, .. } if *status >= 500 => "server_error",
            Self::Status { .. } => "client_error",
            Self::InvalidBody { .. } => "invalid_body",
            Self::Config(_) => "config_error",
        }
    }

    /// Provider identity the failure belongs to.
    pub fn provider(&self) -> &str {
        match self {
            Self::Timeout { provider, .. }
            | Self::Connect { provider, .. }
            | Self::Status { provider, .. }
            | Self::InvalidBody { provider, .. } => provider,
            Self::Config(_) => "",
        }
    }

    /// Record how many attempts were made before giving up.
    pub fn with_attempts(mut self, count: u32) -> Self {
        match &mut self {
            Self::Timeout { attempts, .. }
            | Self::Connect { attempts, .. }
            | Self::Status { attempts, .. } => *attempts = count,
            Self::InvalidBody { .. } | Self::Config(_) => {}
        }
        self
    }

    /// Get the error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Status { context, .. } => Some(context),
            _ => None,
        }
    }
}
