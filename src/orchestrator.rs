//! Task lifecycle orchestration.
//!
//! The orchestrator owns the task state machine. While a task runs it holds
//! an exclusive in-memory lease on the task's mutable state (one in-flight
//! orchestration per task id); all other components see configs read-only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{
    check_reference, ApiConfig, ApiConfigCreate, ApiConfigUpdate, ApiType, ConfigValidationError,
};
use crate::dispatch::{
    DatasetItem, DispatchEngine, DispatchOptions, DispatchStopReason,
};
use crate::metrics::{MetricsAggregator, Scorer};
use crate::provider::{ProviderAdapter, RetryPolicy};
use crate::store::{ConfigStore, StoreError, TaskStore};
use crate::task::{
    required_response_fields, EvaluationTask, InvalidTransition, MetricsResult, TaskCreateBody,
    TaskDetail, TaskLogEntry, TaskStatus, TaskUpdateBody,
};

// =============================================================================
// Collaborators
// =============================================================================

/// Resolves a dataset identifier to its items, in fixed iteration order.
/// Which items a dataset contains is not this core's decision.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn items(&self, dataset: &str) -> Result<Vec<DatasetItem>, DatasetError>;
}

#[derive(Debug, Clone, Error)]
#[error("dataset '{dataset}' unavailable: {message}")]
pub struct DatasetError {
    pub dataset: String,
    pub message: String,
}

impl DatasetError {
    pub fn new(dataset: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors the external API layer maps to HTTP responses. `detail()` is the
/// human-readable string carried in 4xx bodies.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ConfigValidationError),

    #[error("metrics list must not be empty")]
    EmptyMetrics,

    #[error("task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("config {id} not found")]
    ConfigNotFound { id: Uuid },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("task {id} is already being orchestrated")]
    AlreadyRunning { id: Uuid },

    #[error("unsupported status transition request: {status}")]
    UnsupportedUpdate { status: TaskStatus },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Client-side (4xx) errors, as opposed to unexpected internal failure.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Store(_))
    }

    /// The `detail` string for error responses.
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Knobs shared by every task this orchestrator runs.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    pub dispatch: DispatchOptions,
    pub retry: RetryPolicy,
}

/// Coordinates config validation, dispatch, metric aggregation and the task
/// state machine over the external store collaborators.
pub struct TaskOrchestrator {
    configs: Arc<dyn ConfigStore>,
    tasks: Arc<dyn TaskStore>,
    datasets: Arc<dyn DatasetSource>,
    scorer: Arc<dyn Scorer>,
    options: OrchestratorOptions,
    /// Cancel flags for in-flight runs; presence of a key is the lease.
    leases: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl TaskOrchestrator {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        tasks: Arc<dyn TaskStore>,
        datasets: Arc<dyn DatasetSource>,
        scorer: Arc<dyn Scorer>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            configs,
            tasks,
            datasets,
            scorer,
            options,
            leases: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Config operations
    // -------------------------------------------------------------------------

    pub async fn create_config(
        &self,
        body: ApiConfigCreate,
    ) -> Result<ApiConfig, OrchestratorError> {
        let config = body.into_config();
        config.validate()?;
        self.configs.upsert_config(&config).await?;
        Ok(config)
    }

    pub async fn update_config(
        &self,
        id: Uuid,
        update: ApiConfigUpdate,
    ) -> Result<ApiConfig, OrchestratorError> {
        let mut config = self
            .configs
            .get_config(id)
            .await?
            .ok_or(OrchestratorError::ConfigNotFound { id })?;
        update.apply(&mut config)?;
        self.configs.upsert_config(&config).await?;
        Ok(config)
    }

    pub async fn get_config(&self, id: Uuid) -> Result<ApiConfig, OrchestratorError> {
        self.configs
            .get_config(id)
            .await?
            .ok_or(OrchestratorError::ConfigNotFound { id })
    }

    pub async fn list_configs(&self) -> Result<Vec<ApiConfig>, OrchestratorError> {
        Ok(self.configs.list_configs().await?)
    }

    pub async fn delete_config(&self, id: Uuid) -> Result<(), OrchestratorError> {
        if !self.configs.delete_config(id).await? {
            return Err(OrchestratorError::ConfigNotFound { id });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Task operations
    // -------------------------------------------------------------------------

    /// Validate both config references and persist a new pending task.
    /// On any validation failure the task is never persisted.
    pub async fn create_task(
        &self,
        body: TaskCreateBody,
    ) -> Result<EvaluationTask, OrchestratorError> {
        if body.metrics_config.metrics.is_empty() {
            return Err(OrchestratorError::EmptyMetrics);
        }

        let cloud = self.configs.get_config(body.cloud_config_id).await?;
        check_reference(cloud.as_ref(), body.cloud_config_id, ApiType::Cloud)?;
        let edge = self.configs.get_config(body.edge_config_id).await?;
        check_reference(edge.as_ref(), body.edge_config_id, ApiType::Edge)?;

        let task = EvaluationTask::new(body);
        self.tasks.upsert_task(&task).await?;
        self.append_log(task.id, TaskLogEntry::info("task created"))
            .await?;
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<EvaluationTask, OrchestratorError> {
        self.tasks
            .get_task(id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound { id })
    }

    /// Task with its nested log entries, for the detail endpoint.
    pub async fn task_detail(&self, id: Uuid) -> Result<TaskDetail, OrchestratorError> {
        let task = self.get_task(id).await?;
        let logs = self.tasks.logs(id).await?;
        Ok(TaskDetail { task, logs })
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
    ) -> Result<Vec<EvaluationTask>, OrchestratorError> {
        Ok(self.tasks.list_tasks(status).await?)
    }

    pub async fn task_metrics(&self, id: Uuid) -> Result<Vec<MetricsResult>, OrchestratorError> {
        Ok(self.tasks.metrics(id).await?)
    }

    /// Route a `PUT /api/tasks/{id}` status request to start or cancel.
    pub async fn update_task(
        &self,
        id: Uuid,
        body: TaskUpdateBody,
    ) -> Result<EvaluationTask, OrchestratorError> {
        match body.status {
            TaskStatus::Running => self.start_task(id).await,
            TaskStatus::Cancelled => self.cancel_task(id).await,
            status => Err(OrchestratorError::UnsupportedUpdate { status }),
        }
    }

    /// Start a pending task and drive its dispatch to a terminal state.
    ///
    /// Resolves once the run is over; callers wanting fire-and-forget
    /// semantics spawn it. Rejected unless the task is `pending`.
    pub async fn start_task(&self, id: Uuid) -> Result<EvaluationTask, OrchestratorError> {
        // Fetch under the lease lock: transitions are serialized, and a
        // stale read can never resurrect a task another run just finished.
        let (mut task, cancel) = {
            let mut leases = self.leases.lock().await;
            if leases.contains_key(&id) {
                return Err(OrchestratorError::AlreadyRunning { id });
            }
            let mut task = self.get_task(id).await?;
            task.transition(TaskStatus::Running)?;
            let flag = Arc::new(AtomicBool::new(false));
            leases.insert(id, flag.clone());
            (task, flag)
        };

        self.tasks.upsert_task(&task).await?;
        info!(task = %id, name = %task.name, "task started");
        self.append_log(id, TaskLogEntry::info("task started"))
            .await?;

        let result = self.run_to_completion(&mut task, cancel).await;
        self.leases.lock().await.remove(&id);
        result?;
        Ok(task)
    }

    /// Cancel a pending or running task.
    ///
    /// Pending tasks transition immediately. Running tasks get their cancel
    /// signal flagged; the in-flight run folds already-resolved items into
    /// partial metrics and then applies the terminal transition itself.
    /// Rejected if the task is already terminal.
    pub async fn cancel_task(&self, id: Uuid) -> Result<EvaluationTask, OrchestratorError> {
        let leases = self.leases.lock().await;
        let mut task = self.get_task(id).await?;

        match task.status {
            TaskStatus::Pending => {
                task.transition(TaskStatus::Cancelled)?;
                self.tasks.upsert_task(&task).await?;
                drop(leases);
                self.append_log(id, TaskLogEntry::info("task cancelled before start"))
                    .await?;
                Ok(task)
            }
            TaskStatus::Running => match leases.get(&id).cloned() {
                Some(flag) => {
                    flag.store(true, Ordering::Relaxed);
                    drop(leases);
                    self.append_log(id, TaskLogEntry::info("cancellation requested"))
                        .await?;
                    Ok(task)
                }
                None => {
                    // Running in the store without a live lease: the
                    // orchestration is gone, transition directly.
                    task.transition(TaskStatus::Cancelled)?;
                    self.tasks.upsert_task(&task).await?;
                    Ok(task)
                }
            },
            from => Err(OrchestratorError::InvalidTransition(InvalidTransition {
                from,
                to: TaskStatus::Cancelled,
            })),
        }
    }

    // -------------------------------------------------------------------------
    // Run internals
    // -------------------------------------------------------------------------

    async fn run_to_completion(
        &self,
        task: &mut EvaluationTask,
        cancel: Arc<AtomicBool>,
    ) -> Result<(), OrchestratorError> {
        let (cloud, edge, items) = match self.build_run(task).await {
            Ok(setup) => setup,
            Err(message) => {
                // Setup failure is systemic: the task itself fails, it is
                // not surfaced as an API error.
                warn!(task = %task.id, error = %message, "task setup failed");
                self.append_log(task.id, TaskLogEntry::error(format!("setup failed: {message}")))
                    .await?;
                task.error_message = Some(message);
                task.transition(TaskStatus::Failed)?;
                self.tasks.upsert_task(task).await?;
                return Ok(());
            }
        };

        let mut aggregator = MetricsAggregator::new(
            task.id,
            task.metrics_config.metrics.clone(),
            self.scorer.clone(),
        );
        let engine = DispatchEngine::new(self.options.dispatch.clone());
        let report = engine.run(cloud, edge, items, cancel, &mut aggregator).await;

        aggregator.set_run_span(report.wall_clock);
        let results = aggregator.finalize();
        self.tasks.insert_metrics(&results).await?;

        match report.stop_reason {
            DispatchStopReason::Cancelled => {
                info!(task = %task.id, observed = report.items_observed, "task cancelled");
                self.append_log(
                    task.id,
                    TaskLogEntry::warning(format!(
                        "cancelled after {} of {} items",
                        report.items_observed, report.items_total
                    )),
                )
                .await?;
                task.transition(TaskStatus::Cancelled)?;
            }
            DispatchStopReason::Completed if report.is_systemic_failure() => {
                let message = format!(
                    "all {} items failed on both providers",
                    report.items_observed
                );
                warn!(task = %task.id, "task failed: {message}");
                self.append_log(task.id, TaskLogEntry::error(message.clone()))
                    .await?;
                task.error_message = Some(message);
                task.transition(TaskStatus::Failed)?;
            }
            DispatchStopReason::Completed => {
                info!(
                    task = %task.id,
                    items = report.items_observed,
                    cloud_successes = report.cloud_successes,
                    edge_successes = report.edge_successes,
                    "task completed"
                );
                self.append_log(
                    task.id,
                    TaskLogEntry::info(format!(
                        "completed {} items (cloud {} ok, edge {} ok)",
                        report.items_observed, report.cloud_successes, report.edge_successes
                    )),
                )
                .await?;
                task.transition(TaskStatus::Completed)?;
            }
        }

        self.tasks.upsert_task(task).await?;
        Ok(())
    }

    /// Re-validate config references, construct both adapters, and resolve
    /// the dataset. Errors here fail the task as systemic setup failures.
    async fn build_run(
        &self,
        task: &EvaluationTask,
    ) -> Result<(Arc<ProviderAdapter>, Arc<ProviderAdapter>, Vec<DatasetItem>), String> {
        let required = required_response_fields(&task.metrics_config.metrics);

        let cloud_config = self
            .configs
            .get_config(task.cloud_config_id)
            .await
            .map_err(|e| e.to_string())?;
        let cloud_config = check_reference(cloud_config.as_ref(), task.cloud_config_id, ApiType::Cloud)
            .map_err(|e| e.to_string())?;

        let edge_config = self
            .configs
            .get_config(task.edge_config_id)
            .await
            .map_err(|e| e.to_string())?;
        let edge_config = check_reference(edge_config.as_ref(), task.edge_config_id, ApiType::Edge)
            .map_err(|e| e.to_string())?;

        let cloud =
            ProviderAdapter::from_config(&cloud_config, required.clone(), self.options.retry.clone())
                .map_err(|e| e.to_string())?;
        let edge =
            ProviderAdapter::from_config(&edge_config, required, self.options.retry.clone())
                .map_err(|e| e.to_string())?;

        let items = self
            .datasets
            .items(&task.dataset_info.dataset)
            .await
            .map_err(|e| e.to_string())?;

        Ok((Arc::new(cloud), Arc::new(edge), items))
    }

    async fn append_log(&self, task_id: Uuid, entry: TaskLogEntry) -> Result<(), StoreError> {
        self.tasks.append_logs(task_id, &[entry]).await
    }
}
