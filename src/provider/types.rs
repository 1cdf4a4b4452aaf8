//! Canonical request/response structures and the credential bag.

use std::fmt;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

// =============================================================================
// CANONICAL REQUEST / RESPONSE
// =============================================================================

/// Provider-agnostic request for one dataset item.
///
/// Ephemeral: lives only for the duration of one adapter invocation and is
/// translated to the provider wire format by the mapping engine. Optional
/// fields that are `None` are absent from the canonical JSON, so mappings
/// skip them instead of sending nulls.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalRequest {
    pub prompt: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl CanonicalRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            role: "user".to_string(),
            model: None,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    /// Canonical JSON form fed to the mapping engine.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("canonical request is valid JSON")
    }
}

/// Provider-agnostic reply for one dataset item.
#[derive(Debug, Clone)]
pub struct CanonicalResponse {
    /// Extracted model output, if the provider produced one.
    pub output: Option<String>,
    /// Full canonical value (output plus token counts, finish reason, ...).
    pub raw: Value,
    /// Wall-clock duration of the successful call.
    pub latency: Duration,
}

impl CanonicalResponse {
    /// Build from the canonical value the mapping engine produced.
    ///
    /// Scalar outputs (numbers, booleans) are stringified the way callers
    /// expect text, matching lenient provider payloads.
    pub fn from_value(raw: Value, latency: Duration) -> Self {
        let output = match raw.get("output") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        Self {
            output,
            raw,
            latency,
        }
    }
}

/// Per-config generation defaults merged into every canonical request,
/// parsed leniently from `ApiConfig::default_params`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestDefaults {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl RequestDefaults {
    /// Unknown keys are ignored; a non-object bag yields empty defaults.
    pub fn from_value(value: Option<&Value>) -> Self {
        value
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Fill fields the caller left unset.
    pub fn apply(&self, mut request: CanonicalRequest) -> CanonicalRequest {
        if request.model.is_none() {
            request.model = self.model.clone();
        }
        if request.max_tokens.is_none() {
            request.max_tokens = self.max_tokens;
        }
        if request.temperature.is_none() {
            request.temperature = self.temperature;
        }
        request
    }
}

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Keys whose values are masked in every serialized or logged form.
const SENSITIVE_KEYS: &[&str] = &["api_key", "token", "authorization", "password", "secret"];

/// Opaque credential bag attached to an `ApiConfig`.
///
/// The bag is free-form JSON from the configuration layer. Display, Debug
/// and Serialize all redact sensitive values; only `as_value()` exposes the
/// plaintext, for the persistence collaborator and adapter construction.
#[derive(Clone, Default, PartialEq, Deserialize)]
#[serde(from = "Value")]
pub struct AuthConfig {
    fields: Map<String, Value>,
}

impl AuthConfig {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Bearer/API key, from `api_key` or `token`.
    pub fn api_key(&self) -> Option<&str> {
        self.fields
            .get("api_key")
            .or_else(|| self.fields.get("token"))
            .and_then(Value::as_str)
    }

    /// Header name to carry the key, when the provider does not use
    /// `Authorization: Bearer`.
    pub fn auth_header(&self) -> Option<&str> {
        self.fields.get("auth_header").and_then(Value::as_str)
    }

    /// Extra static headers to send with every call.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .get("headers")
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v)))
            })
    }

    /// Plaintext form. For adapter construction and persistence only;
    /// everything user-facing goes through `redacted()`.
    pub fn as_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Redacted form safe for listings and logs.
    pub fn redacted(&self) -> Value {
        Value::Object(redact_map(&self.fields))
    }
}

impl From<Value> for AuthConfig {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }
}

impl Serialize for AuthConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let redacted = redact_map(&self.fields);
        let mut map = serializer.serialize_map(Some(redacted.len()))?;
        for (k, v) in &redacted {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("fields", &self.redacted())
            .finish()
    }
}

/// Mask a key for display: `sk-abc123xyz` becomes `sk-***xyz`.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        return "*".repeat(key.len());
    }
    format!("{}***{}", &key[..3], &key[key.len() - 3..])
}

fn redact_map(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| {
            let redacted = if SENSITIVE_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                match v.as_str() {
                    Some(s) => Value::String(mask_key(s)),
                    None => Value::String("***".to_string()),
                }
            } else if let Value::Object(inner) = v {
                Value::Object(redact_map(inner))
            } else {
                v.clone()
            };
            (k.clone(), redacted)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_request_omits_unset_fields() {
        let value = CanonicalRequest::new("hello").to_value();
        assert_eq!(value, json!({"prompt": "hello", "role": "user"}));

        let value = CanonicalRequest::new("hello")
            .model("m1")
            .max_tokens(64)
            .to_value();
        assert_eq!(value["model"], json!("m1"));
        assert_eq!(value["max_tokens"], json!(64));
    }

    #[test]
    fn canonical_response_stringifies_scalar_outputs() {
        let resp = CanonicalResponse::from_value(json!({"output": 42}), Duration::from_millis(5));
        assert_eq!(resp.output.as_deref(), Some("42"));

        let resp = CanonicalResponse::from_value(json!({"output": null}), Duration::from_millis(5));
        assert!(resp.output.is_none());
    }

    #[test]
    fn mask_key_keeps_only_edges() {
        assert_eq!(mask_key("sk-abcdef123456"), "sk-***456");
        assert_eq!(mask_key("short"), "*****");
    }

    #[test]
    fn auth_config_serializes_redacted() {
        let auth = AuthConfig::from(json!({
            "api_key": "sk-abcdef123456",
            "headers": {"X-Team": "eval"}
        }));
        let serialized = serde_json::to_value(&auth).unwrap();
        assert_eq!(serialized["api_key"], json!("sk-***456"));
        assert_eq!(serialized["headers"]["X-Team"], json!("eval"));

        let debugged = format!("{auth:?}");
        assert!(!debugged.contains("abcdef"));
    }

    #[test]
    fn auth_config_exposes_key_and_headers() {
        let auth = AuthConfig::from(json!({
            "token": "tk-0123456789",
            "auth_header": "X-Api-Key",
            "headers": {"X-Trace": "on"}
        }));
        assert_eq!(auth.api_key(), Some("tk-0123456789"));
        assert_eq!(auth.auth_header(), Some("X-Api-Key"));
        assert_eq!(auth.headers().collect::<Vec<_>>(), vec![("X-Trace", "on")]);
    }
}
