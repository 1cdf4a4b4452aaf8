#![forbid(unsafe_code)]

//! # parity-harness
//!
//! Orchestration core for a cloud-vs-edge model evaluation platform.
//!
//! Heterogeneous model-serving APIs ("cloud" and "edge" providers, each with
//! its own wire protocol) are normalized behind one canonical
//! request/response contract using declarative dot-path mappings. An
//! evaluation task then drives a dataset through both providers
//! concurrently, aggregates per-metric cloud/edge/diff triples, and walks a
//! five-state lifecycle machine whose terminal states absorb.
//!
//! The dashboard, HTTP layer, and persistence engine are external
//! collaborators; they talk to this core through `TaskOrchestrator` and the
//! `ConfigStore` / `TaskStore` / `DatasetSource` / `Scorer` seams.

pub mod config;
pub mod dispatch;
pub mod mapping;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod store;
pub mod task;

pub use config::{
    ApiConfig, ApiConfigCreate, ApiConfigUpdate, ApiType, ConfigValidationError, ProtocolConfig,
    ProtocolType,
};
pub use dispatch::{
    DatasetItem, DispatchEngine, DispatchOptions, DispatchReport, DispatchStopReason, ItemOutcome,
    OutcomeSink, SideOutcome,
};
pub use mapping::{
    translate_request, translate_response, FieldPath, MappingError, ProtocolMapping,
};
pub use metrics::{ExactMatchScorer, MetricsAggregator, Scorer};
pub use orchestrator::{
    DatasetError, DatasetSource, OrchestratorError, OrchestratorOptions, TaskOrchestrator,
};
pub use provider::{
    AdapterError, AuthConfig, CanonicalRequest, CanonicalResponse, HttpEndpoint, ModelEndpoint,
    ProviderAdapter, RetryPolicy, TransportError,
};
pub use store::{ConfigStore, MemoryStore, SqliteStore, StoreError, TaskStore};
pub use task::{
    EvaluationTask, InvalidTransition, MetricKind, MetricsResult, TaskCreateBody, TaskDetail,
    TaskLogEntry, TaskStatus, TaskUpdateBody,
};
