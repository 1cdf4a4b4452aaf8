//! Declarative dot-path translation between canonical and provider payloads.
//!
//! A mapping is a list of `(canonical_path, provider_path)` pairs. Request
//! translation walks the canonical structure and writes into a fresh provider
//! payload; response translation goes the other way. Each path addresses
//! exactly one scalar or sub-object; there are no wildcards.

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Errors from parsing or applying a protocol mapping.
///
/// Cloneable on purpose: a resolution failure is replayed for every item
/// that tries to use the broken mapping.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    /// Protocol requires an explicit mapping and none was configured.
    #[error("no mapping defined for protocol '{protocol}'")]
    NoMappingDefined { protocol: String },

    /// Path failed validation at parse time.
    #[error("malformed path '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    /// Mapping object value was not a string path.
    #[error("mapping target for '{canonical}' must be a dot-path string")]
    NonStringTarget { canonical: String },

    /// A response field the requested metrics depend on was absent.
    #[error("required response field '{path}' missing from provider payload")]
    MissingField { path: String },

    /// Writing along a path would overwrite a non-container value.
    #[error("path '{path}' conflicts with an existing scalar")]
    PathConflict { path: String },
}

impl MappingError {
    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn no_mapping(protocol: impl Into<String>) -> Self {
        Self::NoMappingDefined {
            protocol: protocol.into(),
        }
    }

    /// Short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoMappingDefined { .. } => "no_mapping_defined",
            Self::MalformedPath { .. } => "malformed_path",
            Self::NonStringTarget { .. } => "non_string_target",
            Self::MissingField { .. } => "missing_field",
            Self::PathConflict { .. } => "path_conflict",
        }
    }
}

// =============================================================================
// Field paths
// =============================================================================

/// One step of a dot-path: an object field or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// A validated dot-path, e.g. `choices.0.message.content`.
///
/// Numeric segments address array indices. Validation happens once at parse
/// time so translation never sees an ill-formed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, MappingError> {
        if raw.is_empty() {
            return Err(MappingError::malformed(raw, "empty path"));
        }

        let mut segments = Vec::new();
        for part in raw.split('.') {
            if part.is_empty() {
                return Err(MappingError::malformed(raw, "empty segment"));
            }
            if part.chars().all(|c| c.is_ascii_digit()) {
                let index: usize = part
                    .parse()
                    .map_err(|_| MappingError::malformed(raw, "index out of range"))?;
                segments.push(PathSegment::Index(index));
            } else {
                segments.push(PathSegment::Field(part.to_string()));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Walk the path through `root`, depth-first left-to-right.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match segment {
                PathSegment::Field(name) => current.as_object()?.get(name)?,
                PathSegment::Index(idx) => current.as_array()?.get(*idx)?,
            };
        }
        Some(current)
    }

    /// Write `value` at this path in `root`, creating intermediate objects
    /// and arrays as needed. Arrays are padded with nulls up to the index.
    pub fn set(&self, root: &mut Value, value: Value) -> Result<(), MappingError> {
        let mut current = root;
        let last = self.segments.len() - 1;

        for (depth, segment) in self.segments.iter().enumerate() {
            let is_last = depth == last;
            match segment {
                PathSegment::Field(name) => {
                    if current.is_null() {
                        *current = Value::Object(Map::new());
                    }
                    let obj = current
                        .as_object_mut()
                        .ok_or_else(|| MappingError::PathConflict {
                            path: self.raw.clone(),
                        })?;
                    if is_last {
                        obj.insert(name.clone(), value);
                        return Ok(());
                    }
                    current = obj.entry(name.clone()).or_insert(Value::Null);
                }
                PathSegment::Index(idx) => {
                    if current.is_null() {
                        *current = Value::Array(Vec::new());
                    }
                    let arr = current
                        .as_array_mut()
                        .ok_or_else(|| MappingError::PathConflict {
                            path: self.raw.clone(),
                        })?;
                    while arr.len() <= *idx {
                        arr.push(Value::Null);
                    }
                    if is_last {
                        arr[*idx] = value;
                        return Ok(());
                    }
                    current = &mut arr[*idx];
                }
            }
        }

        unreachable!("paths have at least one segment");
    }
}

// =============================================================================
// Protocol mappings
// =============================================================================

/// One canonical-to-provider path correspondence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingPair {
    pub canonical: FieldPath,
    pub provider: FieldPath,
}

/// An ordered list of path correspondences for one direction of translation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolMapping {
    pairs: Vec<MappingPair>,
}

impl ProtocolMapping {
    pub fn new(pairs: Vec<MappingPair>) -> Self {
        Self { pairs }
    }

    /// Parse the wire form: an object whose keys are canonical dot-paths and
    /// whose values are provider dot-paths, e.g. `{"prompt": "input.text"}`.
    pub fn from_object(object: &Map<String, Value>) -> Result<Self, MappingError> {
        let mut pairs = Vec::with_capacity(object.len());
        for (canonical, provider) in object {
            let provider = provider
                .as_str()
                .ok_or_else(|| MappingError::NonStringTarget {
                    canonical: canonical.clone(),
                })?;
            pairs.push(MappingPair {
                canonical: FieldPath::parse(canonical)?,
                provider: FieldPath::parse(provider)?,
            });
        }
        Ok(Self { pairs })
    }

    /// Build from `(canonical, provider)` string pairs. Panics only on
    /// ill-formed literals, so reserved for the built-in defaults below.
    fn from_static(pairs: &[(&str, &str)]) -> Self {
        Self {
            pairs: pairs
                .iter()
                .map(|(canonical, provider)| MappingPair {
                    canonical: FieldPath::parse(canonical).expect("builtin canonical path"),
                    provider: FieldPath::parse(provider).expect("builtin provider path"),
                })
                .collect(),
        }
    }

    /// Swap canonical and provider sides.
    pub fn inverse(&self) -> Self {
        Self {
            pairs: self
                .pairs
                .iter()
                .map(|p| MappingPair {
                    canonical: p.provider.clone(),
                    provider: p.canonical.clone(),
                })
                .collect(),
        }
    }

    pub fn pairs(&self) -> &[MappingPair] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl Serialize for ProtocolMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.pairs.len()))?;
        for pair in &self.pairs {
            map.serialize_entry(pair.canonical.as_str(), pair.provider.as_str())?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ProtocolMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = Map::deserialize(deserializer)?;
        Self::from_object(&object).map_err(D::Error::custom)
    }
}

// =============================================================================
// Translation
// =============================================================================

/// Translate a canonical request into a provider payload.
///
/// Absent canonical fields are skipped, not errors: optional knobs like
/// `max_tokens` may be intentionally unset.
pub fn translate_request(
    canonical: &Value,
    mapping: &ProtocolMapping,
) -> Result<Value, MappingError> {
    let mut payload = Value::Object(Map::new());
    for pair in mapping.pairs() {
        if let Some(value) = pair.canonical.get(canonical) {
            pair.provider.set(&mut payload, value.clone())?;
        }
    }
    Ok(payload)
}

/// Translate a provider payload back into canonical form.
///
/// A provider field that is absent becomes `null` on the canonical side,
/// unless its canonical path is listed in `required` (fields the requested
/// metric set depends on), in which case translation fails.
pub fn translate_response(
    payload: &Value,
    mapping: &ProtocolMapping,
    required: &[&str],
) -> Result<Value, MappingError> {
    let mut canonical = Value::Object(Map::new());
    for pair in mapping.pairs() {
        match pair.provider.get(payload) {
            Some(value) => pair.canonical.set(&mut canonical, value.clone())?,
            None => {
                if required.contains(&pair.canonical.as_str()) {
                    return Err(MappingError::MissingField {
                        path: pair.canonical.as_str().to_string(),
                    });
                }
                pair.canonical.set(&mut canonical, Value::Null)?;
            }
        }
    }
    Ok(canonical)
}

// =============================================================================
// Built-in defaults
// =============================================================================

/// Default request mapping for OpenAI-compatible chat endpoints.
pub fn openai_request_mapping() -> ProtocolMapping {
    ProtocolMapping::from_static(&[
        ("prompt", "messages.0.content"),
        ("role", "messages.0.role"),
        ("model", "model"),
        ("max_tokens", "max_tokens"),
        ("temperature", "temperature"),
    ])
}

/// Default response mapping for OpenAI-compatible chat endpoints.
pub fn openai_response_mapping() -> ProtocolMapping {
    ProtocolMapping::from_static(&[
        ("output", "choices.0.message.content"),
        ("input_tokens", "usage.prompt_tokens"),
        ("output_tokens", "usage.completion_tokens"),
        ("finish_reason", "choices.0.finish_reason"),
    ])
}

/// Default request mapping for plain RESTful generation endpoints.
pub fn restful_request_mapping() -> ProtocolMapping {
    ProtocolMapping::from_static(&[
        ("prompt", "prompt"),
        ("max_tokens", "max_tokens"),
        ("temperature", "temperature"),
    ])
}

/// Default response mapping for plain RESTful generation endpoints.
pub fn restful_response_mapping() -> ProtocolMapping {
    ProtocolMapping::from_static(&[("output", "result")])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping_of(pairs: &[(&str, &str)]) -> ProtocolMapping {
        ProtocolMapping::from_static(pairs)
    }

    #[test]
    fn parse_rejects_empty_and_dangling_segments() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse(".a").is_err());
        assert!(FieldPath::parse("a.").is_err());
    }

    #[test]
    fn parse_distinguishes_indices_from_fields() {
        let path = FieldPath::parse("choices.0.message").unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Field("choices".into()),
                PathSegment::Index(0),
                PathSegment::Field("message".into()),
            ]
        );
    }

    #[test]
    fn set_creates_intermediate_objects_and_arrays() {
        let mut root = Value::Object(Map::new());
        FieldPath::parse("messages.1.content")
            .unwrap()
            .set(&mut root, json!("hi"))
            .unwrap();
        assert_eq!(root, json!({"messages": [null, {"content": "hi"}]}));
    }

    #[test]
    fn set_rejects_scalar_in_the_way() {
        let mut root = json!({"a": 3});
        let err = FieldPath::parse("a.b")
            .unwrap()
            .set(&mut root, json!(1))
            .unwrap_err();
        assert!(matches!(err, MappingError::PathConflict { .. }));
    }

    #[test]
    fn translate_request_skips_absent_optional_fields() {
        let mapping = mapping_of(&[("prompt", "input.text"), ("max_tokens", "params.max")]);
        let canonical = json!({"prompt": "2+2?"});
        let payload = translate_request(&canonical, &mapping).unwrap();
        assert_eq!(payload, json!({"input": {"text": "2+2?"}}));
    }

    #[test]
    fn translate_response_nulls_absent_optional_fields() {
        let mapping = mapping_of(&[("output", "data.result"), ("finish_reason", "data.reason")]);
        let payload = json!({"data": {"result": "4"}});
        let canonical = translate_response(&payload, &mapping, &[]).unwrap();
        assert_eq!(canonical, json!({"output": "4", "finish_reason": null}));
    }

    #[test]
    fn translate_response_errors_on_missing_required_field() {
        let mapping = mapping_of(&[("output", "data.result")]);
        let payload = json!({"data": {}});
        let err = translate_response(&payload, &mapping, &["output"]).unwrap_err();
        assert_eq!(
            err,
            MappingError::MissingField {
                path: "output".into()
            }
        );
    }

    #[test]
    fn scalar_mapping_round_trips() {
        let mapping = mapping_of(&[
            ("prompt", "input.text"),
            ("max_tokens", "params.max_new_tokens"),
            ("temperature", "params.temp"),
        ]);
        let canonical = json!({"prompt": "hello", "max_tokens": 64, "temperature": 0.2});

        let payload = translate_request(&canonical, &mapping).unwrap();
        let back = translate_response(&payload, &mapping, &[]).unwrap();
        assert_eq!(back, canonical);

        // translate_request with the inverse walks the same pairs backwards.
        let back_via_inverse = translate_request(&payload, &mapping.inverse()).unwrap();
        assert_eq!(back_via_inverse, canonical);
    }

    #[test]
    fn from_object_rejects_non_string_targets() {
        let mut object = Map::new();
        object.insert("prompt".to_string(), json!(42));
        let err = ProtocolMapping::from_object(&object).unwrap_err();
        assert!(matches!(err, MappingError::NonStringTarget { .. }));
    }

    #[test]
    fn openai_defaults_build_chat_wire_shape() {
        let canonical = json!({
            "prompt": "2+2?",
            "role": "user",
            "model": "gpt-4o-mini",
            "max_tokens": 32
        });
        let payload = translate_request(&canonical, &openai_request_mapping()).unwrap();
        assert_eq!(
            payload,
            json!({
                "model": "gpt-4o-mini",
                "max_tokens": 32,
                "messages": [{"role": "user", "content": "2+2?"}]
            })
        );

        let reply = json!({
            "choices": [{"message": {"content": "4"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 1}
        });
        let canonical = translate_response(&reply, &openai_response_mapping(), &["output"]).unwrap();
        assert_eq!(canonical["output"], json!("4"));
        assert_eq!(canonical["input_tokens"], json!(9));
    }
}
