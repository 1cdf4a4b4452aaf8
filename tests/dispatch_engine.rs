use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use parity_harness::{
    ApiConfig, ApiType, DatasetItem, DispatchEngine, DispatchOptions, DispatchStopReason,
    ItemOutcome, ModelEndpoint, OutcomeSink, ProtocolType, ProviderAdapter, RetryPolicy,
    TransportError,
};

/// Endpoint fake speaking the restful wire shape, with per-prompt delays and
/// scripted failures.
struct ScriptedEndpoint {
    name: &'static str,
    delays_ms: HashMap<String, u64>,
    fail_prompts: HashSet<String>,
    fail_all: bool,
    calls: AtomicUsize,
}

impl ScriptedEndpoint {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            delays_ms: HashMap::new(),
            fail_prompts: HashSet::new(),
            fail_all: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn delay(mut self, prompt: &str, ms: u64) -> Self {
        self.delays_ms.insert(prompt.to_string(), ms);
        self
    }

    fn failing_on(mut self, prompt: &str) -> Self {
        self.fail_prompts.insert(prompt.to_string());
        self
    }

    fn failing_always(mut self) -> Self {
        self.fail_all = true;
        self
    }
}

#[async_trait]
impl ModelEndpoint for ScriptedEndpoint {
    fn provider(&self) -> &str {
        self.name
    }

    async fn call(&self, payload: &Value, _timeout: Duration) -> Result<Value, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = payload["prompt"].as_str().unwrap_or_default().to_string();
        if let Some(ms) = self.delays_ms.get(&prompt) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        if self.fail_all || self.fail_prompts.contains(&prompt) {
            return Err(TransportError::connect(self.name, "scripted failure"));
        }
        Ok(json!({"result": format!("echo:{prompt}")}))
    }
}

#[derive(Default)]
struct RecordingSink {
    indexes: Vec<usize>,
    outcomes: Vec<ItemOutcome>,
    cancel_after: Option<(usize, Arc<AtomicBool>)>,
}

impl OutcomeSink for RecordingSink {
    fn observe(&mut self, outcome: &ItemOutcome) {
        self.indexes.push(outcome.index);
        self.outcomes.push(outcome.clone());
        if let Some((count, flag)) = &self.cancel_after {
            if self.indexes.len() >= *count {
                flag.store(true, Ordering::Relaxed);
            }
        }
    }
}

fn adapter_over(endpoint: Arc<ScriptedEndpoint>) -> Arc<ProviderAdapter> {
    let config = ApiConfig::new(
        "scripted",
        ApiType::Edge,
        "scripted",
        "http://127.0.0.1:9/generate",
        ProtocolType::Restful,
    );
    Arc::new(ProviderAdapter::with_endpoint(
        endpoint,
        config.resolve_mappings(),
        vec!["output".to_string()],
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
        },
    ))
}

fn items(prompts: &[&str]) -> Vec<DatasetItem> {
    prompts
        .iter()
        .enumerate()
        .map(|(i, p)| DatasetItem {
            id: format!("item-{i}"),
            prompt: p.to_string(),
            reference: None,
        })
        .collect()
}

fn engine(worker_limit: usize) -> DispatchEngine {
    DispatchEngine::new(DispatchOptions {
        worker_limit,
        item_timeout: Duration::from_secs(5),
    })
}

#[tokio::test]
async fn outcomes_reach_the_sink_in_dataset_order() {
    // First item is the slowest; order must still be dataset order.
    let cloud = Arc::new(
        ScriptedEndpoint::new("cloud")
            .delay("a", 120)
            .delay("c", 60),
    );
    let edge = Arc::new(ScriptedEndpoint::new("edge").delay("b", 40));

    let mut sink = RecordingSink::default();
    let report = engine(4)
        .run(
            adapter_over(cloud),
            adapter_over(edge),
            items(&["a", "b", "c", "d"]),
            Arc::new(AtomicBool::new(false)),
            &mut sink,
        )
        .await;

    assert_eq!(report.stop_reason, DispatchStopReason::Completed);
    assert_eq!(sink.indexes, vec![0, 1, 2, 3]);
    assert_eq!(report.items_observed, 4);
    assert_eq!(report.cloud_successes, 4);
    assert_eq!(report.edge_successes, 4);
}

#[tokio::test]
async fn cancel_keeps_in_flight_items_and_dispatches_nothing_new() {
    let cloud = Arc::new(
        ScriptedEndpoint::new("cloud")
            .delay("a", 50)
            .delay("b", 100),
    );
    let edge = Arc::new(ScriptedEndpoint::new("edge"));
    let cloud_calls = cloud.clone();
    let edge_calls = edge.clone();

    let cancel = Arc::new(AtomicBool::new(false));
    let mut sink = RecordingSink {
        cancel_after: Some((1, cancel.clone())),
        ..Default::default()
    };

    let report = engine(2)
        .run(
            adapter_over(cloud),
            adapter_over(edge),
            items(&["a", "b", "c", "d", "e"]),
            cancel,
            &mut sink,
        )
        .await;

    // Items a and b were in flight when the flag went up after a resolved;
    // both are observed. c, d and e never reach an adapter.
    assert_eq!(report.stop_reason, DispatchStopReason::Cancelled);
    assert_eq!(sink.indexes, vec![0, 1]);
    assert_eq!(report.items_observed, 2);
    assert_eq!(cloud_calls.calls.load(Ordering::SeqCst), 2);
    assert_eq!(edge_calls.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn per_item_failures_are_absorbed_into_outcomes() {
    let cloud = Arc::new(ScriptedEndpoint::new("cloud").failing_on("b"));
    let edge = Arc::new(ScriptedEndpoint::new("edge"));

    let mut sink = RecordingSink::default();
    let report = engine(2)
        .run(
            adapter_over(cloud),
            adapter_over(edge),
            items(&["a", "b"]),
            Arc::new(AtomicBool::new(false)),
            &mut sink,
        )
        .await;

    assert_eq!(report.stop_reason, DispatchStopReason::Completed);
    assert_eq!(report.items_observed, 2);
    assert_eq!(report.cloud_successes, 1);
    assert_eq!(report.edge_successes, 2);
    assert!(!report.is_systemic_failure());

    assert!(sink.outcomes[1].edge.is_success());
    assert!(!sink.outcomes[1].cloud.is_success());
}

#[tokio::test]
async fn total_failure_on_both_sides_is_systemic() {
    let cloud = Arc::new(ScriptedEndpoint::new("cloud").failing_always());
    let edge = Arc::new(ScriptedEndpoint::new("edge").failing_always());

    let mut sink = RecordingSink::default();
    let report = engine(2)
        .run(
            adapter_over(cloud),
            adapter_over(edge),
            items(&["a", "b", "c"]),
            Arc::new(AtomicBool::new(false)),
            &mut sink,
        )
        .await;

    assert_eq!(report.stop_reason, DispatchStopReason::Completed);
    assert_eq!(report.items_observed, 3);
    assert!(report.is_systemic_failure());
}

#[tokio::test]
async fn empty_dataset_completes_without_systemic_failure() {
    let cloud = Arc::new(ScriptedEndpoint::new("cloud"));
    let edge = Arc::new(ScriptedEndpoint::new("edge"));

    let mut sink = RecordingSink::default();
    let report = engine(2)
        .run(
            adapter_over(cloud),
            adapter_over(edge),
            Vec::new(),
            Arc::new(AtomicBool::new(false)),
            &mut sink,
        )
        .await;

    assert_eq!(report.stop_reason, DispatchStopReason::Completed);
    assert_eq!(report.items_observed, 0);
    assert!(!report.is_systemic_failure());
}
