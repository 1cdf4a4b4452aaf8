//! API endpoint configuration records.
//!
//! `ApiConfig` is owned by the persistence collaborator; the core reads it
//! when validating a task and when constructing adapters, and never mutates
//! it mid-dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::mapping::{
    openai_request_mapping, openai_response_mapping, restful_request_mapping,
    restful_response_mapping, MappingError, ProtocolMapping,
};
use crate::provider::types::AuthConfig;

// =============================================================================
// Enums
// =============================================================================

/// Where the endpoint runs: a hosted third-party API or an edge deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Cloud,
    Edge,
}

impl ApiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::Cloud => "cloud",
            ApiType::Edge => "edge",
        }
    }
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire protocol family spoken by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    OpenAi,
    Restful,
    JsonRpc,
    Custom,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::OpenAi => "openai",
            ProtocolType::Restful => "restful",
            ProtocolType::JsonRpc => "jsonrpc",
            ProtocolType::Custom => "custom",
        }
    }
}

// =============================================================================
// Protocol config
// =============================================================================

/// User-declared dot-path mappings for protocols without a built-in default.
///
/// Paths are validated for well-formedness when the config is parsed;
/// whether a mapping is *present* is only checked at use time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_mapping: Option<ProtocolMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mapping: Option<ProtocolMapping>,
}

/// Request/response mappings an adapter will actually use.
#[derive(Debug, Clone)]
pub struct ResolvedMappings {
    pub request: ProtocolMapping,
    pub response: ProtocolMapping,
}

// =============================================================================
// ApiConfig
// =============================================================================

/// One configured model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub api_type: ApiType,
    pub provider: String,
    pub endpoint: String,
    /// Credential bag. Serializes redacted; see `AuthConfig`.
    #[serde(rename = "auth_config", default)]
    pub auth: AuthConfig,
    pub protocol_type: ProtocolType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_config: Option<ProtocolConfig>,
    /// Generation knobs merged into every canonical request built for this
    /// endpoint (`model`, `max_tokens`, `temperature`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_params: Option<serde_json::Value>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl ApiConfig {
    pub fn new(
        name: impl Into<String>,
        api_type: ApiType,
        provider: impl Into<String>,
        endpoint: impl Into<String>,
        protocol_type: ProtocolType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            api_type,
            provider: provider.into(),
            endpoint: endpoint.into(),
            auth: AuthConfig::empty(),
            protocol_type,
            protocol_config: None,
            default_params: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_protocol_config(mut self, protocol_config: ProtocolConfig) -> Self {
        self.protocol_config = Some(protocol_config);
        self
    }

    /// Structural validation applied when a config is saved or updated.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigValidationError::MissingField { field: "name" });
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConfigValidationError::MissingField { field: "endpoint" });
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(ConfigValidationError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
            });
        }
        Ok(())
    }

    /// The mappings this config translates through.
    ///
    /// `openai` and `restful` fall back to built-in defaults; `jsonrpc` and
    /// `custom` must declare both directions explicitly. This is the lazy
    /// half of mapping validation: a config can be saved with missing
    /// mappings and only fails here, at use time.
    pub fn resolve_mappings(&self) -> Result<ResolvedMappings, MappingError> {
        let declared_request = self
            .protocol_config
            .as_ref()
            .and_then(|pc| pc.request_mapping.clone());
        let declared_response = self
            .protocol_config
            .as_ref()
            .and_then(|pc| pc.response_mapping.clone());

        match self.protocol_type {
            ProtocolType::OpenAi => Ok(ResolvedMappings {
                request: declared_request.unwrap_or_else(openai_request_mapping),
                response: declared_response.unwrap_or_else(openai_response_mapping),
            }),
            ProtocolType::Restful => Ok(ResolvedMappings {
                request: declared_request.unwrap_or_else(restful_request_mapping),
                response: declared_response.unwrap_or_else(restful_response_mapping),
            }),
            ProtocolType::JsonRpc | ProtocolType::Custom => {
                match (declared_request, declared_response) {
                    (Some(request), Some(response)) => Ok(ResolvedMappings { request, response }),
                    _ => Err(MappingError::no_mapping(self.protocol_type.as_str())),
                }
            }
        }
    }
}

/// Body of `POST /api/configs`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfigCreate {
    pub name: String,
    #[serde(rename = "type")]
    pub api_type: ApiType,
    pub provider: String,
    pub endpoint: String,
    #[serde(rename = "auth_config", default)]
    pub auth: AuthConfig,
    pub protocol_type: ProtocolType,
    #[serde(default)]
    pub protocol_config: Option<ProtocolConfig>,
    #[serde(default)]
    pub default_params: Option<serde_json::Value>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl ApiConfigCreate {
    pub fn into_config(self) -> ApiConfig {
        let now = Utc::now();
        ApiConfig {
            id: Uuid::new_v4(),
            name: self.name,
            api_type: self.api_type,
            provider: self.provider,
            endpoint: self.endpoint,
            auth: self.auth,
            protocol_type: self.protocol_type,
            protocol_config: self.protocol_config,
            default_params: self.default_params,
            is_active: self.is_active,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Update payload
// =============================================================================

/// Partial update body for `PUT /api/configs/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfigUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub api_type: Option<ApiType>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(rename = "auth_config", default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub protocol_type: Option<ProtocolType>,
    #[serde(default)]
    pub protocol_config: Option<ProtocolConfig>,
    #[serde(default)]
    pub default_params: Option<serde_json::Value>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl ApiConfigUpdate {
    /// Apply set fields onto `config`, re-validating the result.
    pub fn apply(self, config: &mut ApiConfig) -> Result<(), ConfigValidationError> {
        let mut updated = config.clone();
        if let Some(name) = self.name {
            updated.name = name;
        }
        if let Some(api_type) = self.api_type {
            updated.api_type = api_type;
        }
        if let Some(provider) = self.provider {
            updated.provider = provider;
        }
        if let Some(endpoint) = self.endpoint {
            updated.endpoint = endpoint;
        }
        if let Some(auth) = self.auth {
            updated.auth = auth;
        }
        if let Some(protocol_type) = self.protocol_type {
            updated.protocol_type = protocol_type;
        }
        if let Some(protocol_config) = self.protocol_config {
            updated.protocol_config = Some(protocol_config);
        }
        if let Some(default_params) = self.default_params {
            updated.default_params = Some(default_params);
        }
        if let Some(is_active) = self.is_active {
            updated.is_active = is_active;
        }
        updated.validate()?;
        updated.updated_at = Utc::now();
        *config = updated;
        Ok(())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Why a config reference (or the config itself) was rejected.
///
/// Fatal to task creation; never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("config {id} not found")]
    NotFound { id: Uuid },

    #[error("config '{name}' ({id}) is inactive")]
    Inactive { id: Uuid, name: String },

    #[error("config '{name}' ({id}) has type {actual}, expected {expected}")]
    TypeMismatch {
        id: Uuid,
        name: String,
        expected: ApiType,
        actual: ApiType,
    },

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("endpoint is not an http(s) URL: {endpoint}")]
    InvalidEndpoint { endpoint: String },
}

impl ConfigValidationError {
    pub fn type_mismatch(config: &ApiConfig, expected: ApiType) -> Self {
        Self::TypeMismatch {
            id: config.id,
            name: config.name.clone(),
            expected,
            actual: config.api_type,
        }
    }
}

/// Check that a referenced config exists, is active, and has the expected
/// type. The reference step of task creation.
pub fn check_reference(
    config: Option<&ApiConfig>,
    id: Uuid,
    expected: ApiType,
) -> Result<ApiConfig, ConfigValidationError> {
    let config = config.ok_or(ConfigValidationError::NotFound { id })?;
    if !config.is_active {
        return Err(ConfigValidationError::Inactive {
            id: config.id,
            name: config.name.clone(),
        });
    }
    if config.api_type != expected {
        return Err(ConfigValidationError::type_mismatch(config, expected));
    }
    Ok(config.clone())
}
