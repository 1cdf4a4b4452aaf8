//! Concurrent dispatch of dataset items to the cloud and edge adapters.
//!
//! For each item, one cloud and one edge invocation run concurrently and are
//! joined before the item counts as resolved. Cross-item concurrency is
//! bounded by a worker-pool limit, and outcomes are released to the sink in
//! dataset iteration order even though execution is concurrent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::provider::{CanonicalRequest, ProviderAdapter};

// =============================================================================
// Items and outcomes
// =============================================================================

/// One dataset item, supplied by the external `DatasetSource` in fixed
/// iteration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetItem {
    pub id: String,
    pub prompt: String,
    /// Gold answer for the correctness predicate, when the dataset has one.
    #[serde(default)]
    pub reference: Option<String>,
}

/// What one provider side produced for one item.
#[derive(Debug, Clone)]
pub enum SideOutcome {
    Success {
        output: Option<String>,
        latency: Duration,
    },
    Failure {
        code: &'static str,
        message: String,
    },
}

impl SideOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SideOutcome::Success { .. })
    }
}

/// Joined cloud/edge outcome for one item, emitted in dataset order.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub index: usize,
    pub item_id: String,
    pub reference: Option<String>,
    pub cloud: SideOutcome,
    pub edge: SideOutcome,
}

/// Receives outcomes in dataset order as items resolve.
pub trait OutcomeSink: Send {
    fn observe(&mut self, outcome: &ItemOutcome);
}

// =============================================================================
// Engine
// =============================================================================

/// Why the dispatch run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStopReason {
    /// All dataset items were resolved.
    Completed,
    /// Cancellation was requested; the sequence terminated early.
    Cancelled,
}

/// Knobs for one dispatch run.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Items in flight at once across the task.
    pub worker_limit: usize,
    /// Bound on one side's invocation, covering its whole retry loop.
    pub item_timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            worker_limit: 4,
            item_timeout: Duration::from_secs(120),
        }
    }
}

/// Summary of a finished (or cancelled) dispatch run.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub stop_reason: DispatchStopReason,
    pub items_total: usize,
    /// Items whose outcomes reached the sink.
    pub items_observed: usize,
    pub cloud_successes: usize,
    pub edge_successes: usize,
    /// Wall-clock span of the run, for throughput.
    pub wall_clock: Duration,
}

impl DispatchReport {
    /// Structural failure: items were dispatched but neither provider ever
    /// produced a single usable response. Escalates the task to `failed`.
    pub fn is_systemic_failure(&self) -> bool {
        self.items_observed > 0 && self.cloud_successes == 0 && self.edge_successes == 0
    }
}

/// Drives one evaluation task's dataset through both adapters.
///
/// Not restartable: retrying the whole task means a fresh run.
pub struct DispatchEngine {
    options: DispatchOptions,
}

impl DispatchEngine {
    pub fn new(options: DispatchOptions) -> Self {
        Self { options }
    }

    /// Run the dataset to completion or cancellation.
    ///
    /// Cancellation is cooperative: once `cancel` is set no new item starts,
    /// but items already in flight finish (or time out) naturally and their
    /// outcomes still reach the sink before the run reports `Cancelled`.
    pub async fn run(
        &self,
        cloud: Arc<ProviderAdapter>,
        edge: Arc<ProviderAdapter>,
        items: Vec<DatasetItem>,
        cancel: Arc<AtomicBool>,
        sink: &mut dyn OutcomeSink,
    ) -> DispatchReport {
        let started = Instant::now();
        let items_total = items.len();
        let item_timeout = self.options.item_timeout;

        let mut resolved = stream::iter(items.into_iter().enumerate().map(|(index, item)| {
            let cloud = cloud.clone();
            let edge = edge.clone();
            let cancel = cancel.clone();
            async move {
                if cancel.load(Ordering::Relaxed) {
                    return None;
                }
                let request = CanonicalRequest::new(&item.prompt);
                let (cloud_outcome, edge_outcome) = tokio::join!(
                    invoke_side(&cloud, &request, item_timeout),
                    invoke_side(&edge, &request, item_timeout),
                );
                Some(ItemOutcome {
                    index,
                    item_id: item.id,
                    reference: item.reference,
                    cloud: cloud_outcome,
                    edge: edge_outcome,
                })
            }
        }))
        .buffered(self.options.worker_limit.max(1));

        let mut items_observed = 0;
        let mut cloud_successes = 0;
        let mut edge_successes = 0;
        let mut cancelled = false;

        // Drain the whole stream even after a cancel marker: in-flight items
        // still resolve and belong in the partial metrics, while not-yet
        // started items short-circuit to None without dispatching.
        while let Some(slot) = resolved.next().await {
            match slot {
                Some(outcome) => {
                    items_observed += 1;
                    if outcome.cloud.is_success() {
                        cloud_successes += 1;
                    }
                    if outcome.edge.is_success() {
                        edge_successes += 1;
                    }
                    sink.observe(&outcome);
                }
                None => cancelled = true,
            }
        }

        DispatchReport {
            stop_reason: if cancelled {
                DispatchStopReason::Cancelled
            } else {
                DispatchStopReason::Completed
            },
            items_total,
            items_observed,
            cloud_successes,
            edge_successes,
            wall_clock: started.elapsed(),
        }
    }
}

/// One side's invocation, bounded by the per-item timeout on top of the
/// adapter's own per-call timeout and retries.
async fn invoke_side(
    adapter: &ProviderAdapter,
    request: &CanonicalRequest,
    item_timeout: Duration,
) -> SideOutcome {
    match tokio::time::timeout(item_timeout, adapter.invoke(request)).await {
        Ok(Ok(response)) => SideOutcome::Success {
            output: response.output,
            latency: response.latency,
        },
        Ok(Err(err)) => SideOutcome::Failure {
            code: err.code(),
            message: err.to_string(),
        },
        Err(_) => SideOutcome::Failure {
            code: "item_timeout",
            message: format!("no outcome within {item_timeout:?}"),
        },
    }
}
