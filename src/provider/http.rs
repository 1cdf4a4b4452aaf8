//! HTTP transport for configured provider endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;

use super::error::{ErrorContext, TransportError};
use super::types::AuthConfig;

/// Maximum allowed response body size (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

// =============================================================================
// TRAIT
// =============================================================================

/// One wire call to a provider. Implemented by `HttpEndpoint` for real
/// configs and by in-memory fakes in tests.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    /// Provider identity carried into errors and logs.
    fn provider(&self) -> &str;

    /// Send the translated payload and return the decoded JSON reply.
    async fn call(&self, payload: &Value, timeout: Duration) -> Result<Value, TransportError>;
}

// =============================================================================
// HTTP ENDPOINT
// =============================================================================

/// Reqwest-backed endpoint for one `ApiConfig`.
///
/// Credentials are read once at construction and baked into default
/// headers; the core never touches them again.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    provider: String,
    client: reqwest::Client,
    url: String,
}

impl HttpEndpoint {
    pub fn new(
        provider: impl Into<String>,
        url: impl Into<String>,
        auth: &AuthConfig,
    ) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(key) = auth.api_key() {
            match auth.auth_header() {
                Some(name) => {
                    let name = HeaderName::from_bytes(name.as_bytes())
                        .map_err(|_| TransportError::config(format!("invalid auth header name: {name}")))?;
                    let value = HeaderValue::from_str(key)
                        .map_err(|_| TransportError::config("invalid credential value"))?;
                    headers.insert(name, value);
                }
                None => {
                    let value = HeaderValue::from_str(&format!("Bearer {key}"))
                        .map_err(|_| TransportError::config("invalid credential value"))?;
                    headers.insert(AUTHORIZATION, value);
                }
            }
        }

        for (name, value) in auth.headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::config(format!("invalid header name: {name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::config(format!("invalid header value for {name:?}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| TransportError::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            provider: provider.into(),
            client,
            url: url.into(),
        })
    }

    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

/// Error body shapes providers commonly return.
#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<ApiErrorDetail>,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[async_trait]
impl ModelEndpoint for HttpEndpoint {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn call(&self, payload: &Value, timeout: Duration) -> Result<Value, TransportError> {
        let result = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(payload)
            .send()
            .await;

        let mut response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(TransportError::timeout(&self.provider, timeout));
            }
            Err(e) => {
                return Err(TransportError::connect(&self.provider, e.to_string()));
            }
        };

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());

        // Stream the body to enforce the size limit.
        let mut bytes = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if bytes.len() + chunk.len() > MAX_RESPONSE_LEN {
                        return Err(TransportError::invalid_body(
                            &self.provider,
                            format!("response exceeds {MAX_RESPONSE_LEN} bytes"),
                        ));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) if e.is_timeout() => {
                    return Err(TransportError::timeout(&self.provider, timeout));
                }
                Err(e) => {
                    return Err(TransportError::connect(&self.provider, e.to_string()));
                }
            }
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        if !status.is_success() {
            let mut ctx = ErrorContext::new().with_status(status.as_u16());
            if let Some(id) = request_id {
                ctx = ctx.with_request_id(id);
            }

            let mut message = format!("HTTP {}", status.as_u16());
            if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(&body) {
                if let Some(error) = parsed.error {
                    if let Some(m) = error.message {
                        message = m;
                    }
                    if let Some(code) = error.code {
                        ctx = ctx.with_code(code);
                    }
                } else if let Some(detail) = parsed.detail {
                    message = detail;
                }
            }

            return Err(TransportError::status(
                &self.provider,
                status.as_u16(),
                message,
                ctx,
            ));
        }

        serde_json::from_str(&body)
            .map_err(|e| TransportError::invalid_body(&self.provider, format!("invalid JSON: {e}")))
    }
}
