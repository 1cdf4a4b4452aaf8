//! Provider adapters: one configured endpoint behind the canonical contract.
//!
//! An adapter owns the transport concerns for a single `ApiConfig` -
//! timeout, bounded retry with exponential backoff, auth injection - and
//! translates payloads through the mapping engine in both directions.

pub mod error;
pub mod http;
pub mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::config::{ApiConfig, ResolvedMappings};
use crate::mapping::{translate_request, translate_response, MappingError};

pub use error::{ErrorContext, TransportError};
pub use http::{HttpEndpoint, ModelEndpoint};
pub use types::{mask_key, AuthConfig, CanonicalRequest, CanonicalResponse, RequestDefaults};

// =============================================================================
// Retry policy
// =============================================================================

/// Transport knobs shared by both adapters of a task.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt, for retryable failures only.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Per-call timeout.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            call_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failure of one adapter invocation. Absorbed by the dispatch engine as a
/// per-item failure; never fails the task by itself.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AdapterError {
    /// Short error code for per-item failure records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Mapping(e) => e.code(),
            Self::Transport(e) => e.code(),
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// One configured endpoint (cloud or edge) behind the canonical contract.
///
/// Mapping resolution is deferred to `invoke` time: a config saved with a
/// missing mapping constructs fine and fails per item, matching the lazy
/// validation contract.
pub struct ProviderAdapter {
    provider: String,
    endpoint: Arc<dyn ModelEndpoint>,
    mappings: Result<ResolvedMappings, MappingError>,
    required_fields: Vec<String>,
    defaults: RequestDefaults,
    retry: RetryPolicy,
}

impl ProviderAdapter {
    /// Build the real HTTP-backed adapter for a config.
    ///
    /// `required_fields` lists the canonical response paths the requested
    /// metric set depends on (usually just `output`).
    pub fn from_config(
        config: &ApiConfig,
        required_fields: Vec<String>,
        retry: RetryPolicy,
    ) -> Result<Self, TransportError> {
        let endpoint = HttpEndpoint::new(&config.provider, &config.endpoint, &config.auth)?;
        Ok(Self::with_endpoint(
            Arc::new(endpoint),
            config.resolve_mappings(),
            required_fields,
            retry,
        )
        .with_defaults(RequestDefaults::from_value(config.default_params.as_ref())))
    }

    /// Build over any endpoint implementation. Used by tests with fakes.
    pub fn with_endpoint(
        endpoint: Arc<dyn ModelEndpoint>,
        mappings: Result<ResolvedMappings, MappingError>,
        required_fields: Vec<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider: endpoint.provider().to_string(),
            endpoint,
            mappings,
            required_fields,
            defaults: RequestDefaults::default(),
            retry,
        }
    }

    pub fn with_defaults(mut self, defaults: RequestDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Translate, call, translate back. Retries retryable transport
    /// failures up to the policy bound with exponential backoff; mapping
    /// failures and 4xx are permanent for this item.
    pub async fn invoke(
        &self,
        request: &CanonicalRequest,
    ) -> Result<CanonicalResponse, AdapterError> {
        let mappings = self
            .mappings
            .as_ref()
            .map_err(|e| AdapterError::Mapping(e.clone()))?;
        let request = self.defaults.apply(request.clone());
        let payload = translate_request(&request.to_value(), &mappings.request)?;
        let required: Vec<&str> = self.required_fields.iter().map(String::as_str).collect();

        for attempt in 0..=self.retry.max_retries {
            let start = Instant::now();
            match self.endpoint.call(&payload, self.retry.call_timeout).await {
                Ok(reply) => {
                    let canonical = translate_response(&reply, &mappings.response, &required)?;
                    return Ok(CanonicalResponse::from_value(canonical, start.elapsed()));
                }
                Err(err) => {
                    if !err.is_retryable() || attempt == self.retry.max_retries {
                        return Err(AdapterError::Transport(err.with_attempts(attempt + 1)));
                    }
                    warn!(
                        provider = %self.provider,
                        attempt = attempt + 1,
                        error = %err,
                        "provider call failed; retrying"
                    );
                    sleep(backoff_delay(self.retry.base_delay, attempt)).await;
                }
            }
        }

        unreachable!("retry loop returns on the final attempt");
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, ApiType, ProtocolType};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyEndpoint {
        calls: AtomicUsize,
        failures_before_success: usize,
        failure: fn() -> TransportError,
    }

    #[async_trait]
    impl ModelEndpoint for FlakyEndpoint {
        fn provider(&self) -> &str {
            "fake"
        }

        async fn call(&self, _payload: &Value, _timeout: Duration) -> Result<Value, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err((self.failure)())
            } else {
                Ok(json!({"result": "ok"}))
            }
        }
    }

    fn restful_config() -> ApiConfig {
        ApiConfig::new(
            "edge",
            ApiType::Edge,
            "fake",
            "http://127.0.0.1:9/generate",
            ProtocolType::Restful,
        )
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn retries_retryable_failures_then_succeeds() {
        let endpoint = Arc::new(FlakyEndpoint {
            calls: AtomicUsize::new(0),
            failures_before_success: 2,
            failure: || TransportError::timeout("fake", Duration::from_secs(1)),
        });
        let adapter = ProviderAdapter::with_endpoint(
            endpoint.clone(),
            restful_config().resolve_mappings(),
            vec!["output".to_string()],
            quick_retry(),
        );

        let resp = adapter.invoke(&CanonicalRequest::new("hi")).await.unwrap();
        assert_eq!(resp.output.as_deref(), Some("ok"));
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let endpoint = Arc::new(FlakyEndpoint {
            calls: AtomicUsize::new(0),
            failures_before_success: usize::MAX,
            failure: || {
                TransportError::status("fake", 400, "bad request", ErrorContext::new())
            },
        });
        let adapter = ProviderAdapter::with_endpoint(
            endpoint.clone(),
            restful_config().resolve_mappings(),
            vec![],
            quick_retry(),
        );

        let err = adapter.invoke(&CanonicalRequest::new("hi")).await.unwrap_err();
        assert_eq!(err.code(), "client_error");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempt_count() {
        let endpoint = Arc::new(FlakyEndpoint {
            calls: AtomicUsize::new(0),
            failures_before_success: usize::MAX,
            failure: || TransportError::connect("fake", "refused"),
        });
        let adapter = ProviderAdapter::with_endpoint(
            endpoint,
            restful_config().resolve_mappings(),
            vec![],
            quick_retry(),
        );

        let err = adapter.invoke(&CanonicalRequest::new("hi")).await.unwrap_err();
        match err {
            AdapterError::Transport(TransportError::Connect { attempts, .. }) => {
                assert_eq!(attempts, 3)
            }
            other => panic!("expected Connect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresolved_mapping_fails_without_calling_endpoint() {
        let endpoint = Arc::new(FlakyEndpoint {
            calls: AtomicUsize::new(0),
            failures_before_success: 0,
            failure: || TransportError::connect("fake", "unused"),
        });
        let adapter = ProviderAdapter::with_endpoint(
            endpoint.clone(),
            Err(MappingError::no_mapping("custom")),
            vec![],
            quick_retry(),
        );

        let err = adapter.invoke(&CanonicalRequest::new("hi")).await.unwrap_err();
        assert_eq!(err.code(), "no_mapping_defined");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }
}
