//! Evaluation task records, the lifecycle state machine, and result rows.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// Status
// =============================================================================

/// Task lifecycle state. `Completed`, `Failed` and `Cancelled` are terminal:
/// nothing transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// The transition table. Everything not listed is rejected.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state-machine transition. Carries the human-readable detail the
/// external API layer returns with a 4xx.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid task transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

// =============================================================================
// Metrics
// =============================================================================

/// Metric kinds a task can request. Parameterless identifiers; dataset
/// specific scoring arrives through the `Scorer` seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Accuracy,
    Latency,
    Throughput,
    Stability,
    Consistency,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::Accuracy,
        MetricKind::Latency,
        MetricKind::Throughput,
        MetricKind::Stability,
        MetricKind::Consistency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Accuracy => "accuracy",
            MetricKind::Latency => "latency",
            MetricKind::Throughput => "throughput",
            MetricKind::Stability => "stability",
            MetricKind::Consistency => "consistency",
        }
    }

    /// Whether this metric needs the textual model output, making the
    /// canonical `output` field required during response translation.
    pub fn requires_output(&self) -> bool {
        matches!(self, MetricKind::Accuracy | MetricKind::Consistency)
    }
}

/// Canonical response fields the requested metric set depends on.
pub fn required_response_fields(metrics: &[MetricKind]) -> Vec<String> {
    if metrics.iter().any(MetricKind::requires_output) {
        vec!["output".to_string()]
    } else {
        Vec::new()
    }
}

/// One per-metric comparison row produced at task completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub metric_type: MetricKind,
    pub cloud_value: Option<f64>,
    pub edge_value: Option<f64>,
    /// `cloud_value - edge_value`; null as soon as either side is null.
    pub diff_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl MetricsResult {
    pub fn new(
        task_id: Uuid,
        metric_type: MetricKind,
        cloud_value: Option<f64>,
        edge_value: Option<f64>,
        details: Option<Value>,
    ) -> Self {
        let diff_value = match (cloud_value, edge_value) {
            (Some(cloud), Some(edge)) => Some(cloud - edge),
            _ => None,
        };
        Self {
            id: Uuid::new_v4(),
            task_id,
            metric_type,
            cloud_value,
            edge_value,
            diff_value,
            details,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Logs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Append-only lifecycle log line, owned by the orchestrator while the task
/// runs and handed to the persistence collaborator afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl TaskLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

// =============================================================================
// Task record
// =============================================================================

/// Which dataset to iterate. Iteration order itself comes from the external
/// `DatasetSource`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub dataset: String,
}

/// Requested metric kinds. Must be non-empty at task creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub metrics: Vec<MetricKind>,
}

/// One evaluation task comparing a cloud config against an edge config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationTask {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub cloud_config_id: Uuid,
    pub edge_config_id: Uuid,
    pub dataset_info: DatasetInfo,
    pub metrics_config: MetricsConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl EvaluationTask {
    pub fn new(body: TaskCreateBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: body.name,
            description: body.description,
            status: TaskStatus::Pending,
            cloud_config_id: body.cloud_config_id,
            edge_config_id: body.edge_config_id,
            dataset_info: body.dataset_info,
            metrics_config: body.metrics_config,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Apply one state-machine transition, stamping `started_at` /
    /// `completed_at` as the transition dictates. Timestamps stay monotone
    /// because each is stamped at transition time.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        if to == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = to;
        Ok(())
    }
}

// =============================================================================
// API bodies
// =============================================================================

/// Body of `POST /api/tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskCreateBody {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub cloud_config_id: Uuid,
    pub edge_config_id: Uuid,
    pub dataset_info: DatasetInfo,
    pub metrics_config: MetricsConfig,
}

/// Body of `PUT /api/tasks/{id}`: a requested status transition.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskUpdateBody {
    pub status: TaskStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// Task detail with nested log entries, for `GET /api/tasks/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: EvaluationTask,
    pub logs: Vec<TaskLogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> EvaluationTask {
        EvaluationTask::new(TaskCreateBody {
            name: "gsm8k cloud vs edge".into(),
            description: None,
            cloud_config_id: Uuid::new_v4(),
            edge_config_id: Uuid::new_v4(),
            dataset_info: DatasetInfo {
                dataset: "gsm8k".into(),
            },
            metrics_config: MetricsConfig {
                metrics: vec![MetricKind::Accuracy],
            },
        })
    }

    #[test]
    fn happy_path_stamps_timestamps_in_order() {
        let mut t = task();
        assert_eq!(t.status, TaskStatus::Pending);

        t.transition(TaskStatus::Running).unwrap();
        let started = t.started_at.unwrap();
        assert!(started >= t.created_at);
        assert!(t.completed_at.is_none());

        t.transition(TaskStatus::Completed).unwrap();
        let completed = t.completed_at.unwrap();
        assert!(completed >= started);
        assert!(t.status.is_terminal());
    }

    #[test]
    fn terminal_states_absorb() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            for next in [
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition(next),
                    "{terminal} -> {next} must be rejected"
                );
            }
        }
    }

    #[test]
    fn start_is_rejected_unless_pending() {
        let mut t = task();
        t.transition(TaskStatus::Running).unwrap();
        let err = t.transition(TaskStatus::Running).unwrap_err();
        assert_eq!(err.from, TaskStatus::Running);

        t.transition(TaskStatus::Completed).unwrap();
        assert!(t.transition(TaskStatus::Running).is_err());
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[test]
    fn pending_can_be_cancelled_directly() {
        let mut t = task();
        t.transition(TaskStatus::Cancelled).unwrap();
        assert!(t.started_at.is_none());
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn diff_value_is_null_iff_either_side_is_null() {
        let id = Uuid::new_v4();
        let both = MetricsResult::new(id, MetricKind::Accuracy, Some(0.9), Some(0.7), None);
        assert_eq!(both.diff_value, Some(0.9 - 0.7));

        for (cloud, edge) in [(Some(0.9), None), (None, Some(0.7)), (None, None)] {
            let r = MetricsResult::new(id, MetricKind::Accuracy, cloud, edge, None);
            assert_eq!(r.diff_value, None);
        }
    }

    #[test]
    fn required_fields_follow_metric_kinds() {
        assert_eq!(
            required_response_fields(&[MetricKind::Accuracy, MetricKind::Latency]),
            vec!["output".to_string()]
        );
        assert!(required_response_fields(&[MetricKind::Latency, MetricKind::Throughput]).is_empty());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let parsed: TaskStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, TaskStatus::Running);
    }
}
