//! Running metric accumulators and the cloud/edge/diff triples they yield.
//!
//! The aggregator never fails: absent data turns into `null` metric values,
//! not errors. A provider side that produced no successful response at all
//! reports `null` for every metric rather than a misleading zero.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::dispatch::{ItemOutcome, OutcomeSink, SideOutcome};
use crate::task::{MetricKind, MetricsResult};

// =============================================================================
// Scoring
// =============================================================================

/// Pluggable per-item correctness predicate.
pub trait Scorer: Send + Sync {
    /// Whether `output` is a correct answer given the item's reference.
    fn score(&self, reference: Option<&str>, output: &str) -> bool;
}

/// Default predicate: trimmed, case-insensitive match against the reference.
/// Items without a reference never score as correct.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatchScorer;

impl Scorer for ExactMatchScorer {
    fn score(&self, reference: Option<&str>, output: &str) -> bool {
        match reference {
            Some(reference) => reference.trim().eq_ignore_ascii_case(output.trim()),
            None => false,
        }
    }
}

// =============================================================================
// Accumulators
// =============================================================================

#[derive(Debug, Default, Clone)]
struct SideStats {
    successes: usize,
    failures: usize,
    correct: usize,
    latencies_ms: Vec<f64>,
}

impl SideStats {
    fn observe(&mut self, outcome: &SideOutcome, reference: Option<&str>, scorer: &dyn Scorer) -> bool {
        match outcome {
            SideOutcome::Success { output, latency } => {
                self.successes += 1;
                self.latencies_ms.push(latency.as_secs_f64() * 1_000.0);
                let correct = output
                    .as_deref()
                    .map(|o| scorer.score(reference, o))
                    .unwrap_or(false);
                if correct {
                    self.correct += 1;
                }
                correct
            }
            SideOutcome::Failure { .. } => {
                self.failures += 1;
                false
            }
        }
    }

    fn mean_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        Some(self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64)
    }

    fn latency_stddev_ms(&self) -> Option<f64> {
        let mean = self.mean_latency_ms()?;
        let n = self.latencies_ms.len() as f64;
        let variance = self
            .latencies_ms
            .iter()
            .map(|l| (l - mean).powi(2))
            .sum::<f64>()
            / n;
        Some(variance.sqrt())
    }
}

/// Accumulates per-item outcomes for one task and produces the final
/// `MetricsResult` rows.
pub struct MetricsAggregator {
    task_id: Uuid,
    metrics: Vec<MetricKind>,
    scorer: Arc<dyn Scorer>,
    items_observed: usize,
    cloud: SideStats,
    edge: SideStats,
    /// Items where both sides succeeded, and how often their correctness
    /// verdicts agreed.
    both_succeeded: usize,
    agreements: usize,
    run_span: Option<Duration>,
}

impl MetricsAggregator {
    pub fn new(task_id: Uuid, metrics: Vec<MetricKind>, scorer: Arc<dyn Scorer>) -> Self {
        Self {
            task_id,
            metrics,
            scorer,
            items_observed: 0,
            cloud: SideStats::default(),
            edge: SideStats::default(),
            both_succeeded: 0,
            agreements: 0,
            run_span: None,
        }
    }

    pub fn items_observed(&self) -> usize {
        self.items_observed
    }

    /// Record the dispatch run's wall-clock span, for throughput.
    pub fn set_run_span(&mut self, span: Duration) {
        self.run_span = Some(span);
    }

    /// Fold one resolved item into the running accumulators.
    pub fn observe(&mut self, outcome: &ItemOutcome) {
        self.items_observed += 1;
        let reference = outcome.reference.as_deref();
        let cloud_correct = self
            .cloud
            .observe(&outcome.cloud, reference, self.scorer.as_ref());
        let edge_correct = self
            .edge
            .observe(&outcome.edge, reference, self.scorer.as_ref());

        if outcome.cloud.is_success() && outcome.edge.is_success() {
            self.both_succeeded += 1;
            if cloud_correct == edge_correct {
                self.agreements += 1;
            }
        }
    }

    /// Produce one `MetricsResult` per requested metric, in request order.
    ///
    /// Pure over the accumulated state: calling it again without new
    /// `observe` calls yields identical values.
    pub fn finalize(&self) -> Vec<MetricsResult> {
        let details = json!({
            "items_observed": self.items_observed,
            "cloud": {"successes": self.cloud.successes, "failures": self.cloud.failures},
            "edge": {"successes": self.edge.successes, "failures": self.edge.failures},
        });

        self.metrics
            .iter()
            .map(|&kind| {
                let (cloud_value, edge_value) = match kind {
                    MetricKind::Accuracy => {
                        (self.accuracy(&self.cloud), self.accuracy(&self.edge))
                    }
                    MetricKind::Latency => {
                        (self.cloud.mean_latency_ms(), self.edge.mean_latency_ms())
                    }
                    MetricKind::Throughput => {
                        (self.throughput(&self.cloud), self.throughput(&self.edge))
                    }
                    MetricKind::Stability => {
                        (self.cloud.latency_stddev_ms(), self.edge.latency_stddev_ms())
                    }
                    MetricKind::Consistency => {
                        let value = self.consistency();
                        (value, value)
                    }
                };
                MetricsResult::new(
                    self.task_id,
                    kind,
                    cloud_value,
                    edge_value,
                    Some(details.clone()),
                )
            })
            .collect()
    }

    /// Fraction correct over all observed items; failed items count as
    /// incorrect. A side with no successful response at all has no data and
    /// yields `null`.
    fn accuracy(&self, side: &SideStats) -> Option<f64> {
        if side.successes == 0 || self.items_observed == 0 {
            return None;
        }
        Some(side.correct as f64 / self.items_observed as f64)
    }

    fn throughput(&self, side: &SideStats) -> Option<f64> {
        if side.successes == 0 {
            return None;
        }
        let span = self.run_span?.as_secs_f64();
        if span <= 0.0 {
            return None;
        }
        Some(side.successes as f64 / span)
    }

    /// Fraction of items where both sides' correctness verdicts agree,
    /// over items where both sides succeeded.
    fn consistency(&self) -> Option<f64> {
        if self.both_succeeded == 0 {
            return None;
        }
        Some(self.agreements as f64 / self.both_succeeded as f64)
    }
}

impl OutcomeSink for MetricsAggregator {
    fn observe(&mut self, outcome: &ItemOutcome) {
        MetricsAggregator::observe(self, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(output: &str, latency_ms: u64) -> SideOutcome {
        SideOutcome::Success {
            output: Some(output.to_string()),
            latency: Duration::from_millis(latency_ms),
        }
    }

    fn failure() -> SideOutcome {
        SideOutcome::Failure {
            code: "timeout",
            message: "no outcome".into(),
        }
    }

    fn outcome(index: usize, reference: &str, cloud: SideOutcome, edge: SideOutcome) -> ItemOutcome {
        ItemOutcome {
            index,
            item_id: format!("item-{index}"),
            reference: Some(reference.to_string()),
            cloud,
            edge,
        }
    }

    fn aggregator(metrics: Vec<MetricKind>) -> MetricsAggregator {
        MetricsAggregator::new(Uuid::new_v4(), metrics, Arc::new(ExactMatchScorer))
    }

    #[test]
    fn accuracy_counts_failures_as_incorrect() {
        let mut agg = aggregator(vec![MetricKind::Accuracy]);
        agg.observe(&outcome(0, "4", success("4", 10), success("5", 10)));
        agg.observe(&outcome(1, "6", success("7", 10), failure()));

        let results = agg.finalize();
        let accuracy = &results[0];
        assert_eq!(accuracy.cloud_value, Some(0.5));
        // Edge succeeded once (wrong) and failed once: 0 / 2.
        assert_eq!(accuracy.edge_value, Some(0.0));
        assert_eq!(accuracy.diff_value, Some(0.5));
    }

    #[test]
    fn side_without_any_success_is_null_across_metrics() {
        let mut agg = aggregator(vec![
            MetricKind::Accuracy,
            MetricKind::Latency,
            MetricKind::Throughput,
            MetricKind::Stability,
            MetricKind::Consistency,
        ]);
        agg.set_run_span(Duration::from_secs(2));
        agg.observe(&outcome(0, "4", success("4", 10), failure()));
        agg.observe(&outcome(1, "6", success("6", 30), failure()));

        for result in agg.finalize() {
            assert!(result.cloud_value.is_some() || result.metric_type == MetricKind::Consistency);
            assert_eq!(result.edge_value, None, "{:?}", result.metric_type);
            assert_eq!(result.diff_value, None);
        }
    }

    #[test]
    fn latency_and_stability_are_computed_per_side() {
        let mut agg = aggregator(vec![MetricKind::Latency, MetricKind::Stability]);
        agg.observe(&outcome(0, "4", success("4", 10), success("4", 40)));
        agg.observe(&outcome(1, "6", success("6", 30), success("6", 40)));

        let results = agg.finalize();
        assert_eq!(results[0].cloud_value, Some(20.0));
        assert_eq!(results[0].edge_value, Some(40.0));
        assert_eq!(results[0].diff_value, Some(-20.0));

        assert_eq!(results[1].cloud_value, Some(10.0));
        assert_eq!(results[1].edge_value, Some(0.0));
    }

    #[test]
    fn throughput_uses_run_span() {
        let mut agg = aggregator(vec![MetricKind::Throughput]);
        agg.observe(&outcome(0, "4", success("4", 10), success("4", 10)));
        agg.observe(&outcome(1, "6", success("6", 10), failure()));

        // Without a span there is no throughput.
        assert_eq!(agg.finalize()[0].cloud_value, None);

        agg.set_run_span(Duration::from_secs(4));
        let results = agg.finalize();
        assert_eq!(results[0].cloud_value, Some(0.5));
        assert_eq!(results[0].edge_value, Some(0.25));
    }

    #[test]
    fn consistency_reports_agreement_on_both_sides() {
        let mut agg = aggregator(vec![MetricKind::Consistency]);
        // Agree (both correct), agree (both incorrect), disagree.
        agg.observe(&outcome(0, "4", success("4", 10), success("4", 10)));
        agg.observe(&outcome(1, "6", success("1", 10), success("2", 10)));
        agg.observe(&outcome(2, "8", success("8", 10), success("9", 10)));
        // Edge failure: excluded from the agreement base.
        agg.observe(&outcome(3, "9", success("9", 10), failure()));

        let results = agg.finalize();
        let consistency = &results[0];
        let expected = 2.0 / 3.0;
        assert_eq!(consistency.cloud_value, Some(expected));
        assert_eq!(consistency.edge_value, Some(expected));
        assert_eq!(consistency.diff_value, Some(0.0));
    }

    #[test]
    fn finalize_is_idempotent_over_values() {
        let mut agg = aggregator(vec![MetricKind::Accuracy, MetricKind::Latency]);
        agg.set_run_span(Duration::from_secs(1));
        agg.observe(&outcome(0, "4", success("4", 10), success("5", 20)));

        let first = agg.finalize();
        let second = agg.finalize();
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.metric_type, b.metric_type);
            assert_eq!(a.cloud_value, b.cloud_value);
            assert_eq!(a.edge_value, b.edge_value);
            assert_eq!(a.diff_value, b.diff_value);
        }
    }

    #[test]
    fn empty_aggregator_yields_all_nulls() {
        let agg = aggregator(vec![MetricKind::Accuracy, MetricKind::Throughput]);
        for result in agg.finalize() {
            assert_eq!(result.cloud_value, None);
            assert_eq!(result.edge_value, None);
            assert_eq!(result.diff_value, None);
        }
    }
}
