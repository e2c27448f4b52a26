//! Comparison report between the instrumented and plain runs.

use crate::benchmarks::orchestrator::{CleanupTally, VariantRun};
use crate::benchmarks::stats::{
    EffectSize, FTest, StatOutcome, Summary, TTest, cohens_d, f_test, format_duration,
    welch_t_test,
};
use chrono::{DateTime, Utc};
use fnbench_common::{CaseResult, DeploymentOutcome, Scenario, Variant};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

const RULE_WIDTH: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub variant: Variant,
    pub functions: usize,
    pub deployed: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub cleanup: CleanupTally,
}

impl VariantSummary {
    fn of(run: &VariantRun) -> Self {
        let samples = run.results.iter().flat_map(|r| &r.samples);
        let (ok, failed): (Vec<_>, Vec<_>) = samples.partition(|s| s.success);
        Self {
            variant: run.variant,
            functions: run.results.len(),
            deployed: run.successful(),
            successful_requests: ok.len(),
            failed_requests: failed.len(),
            cleanup: run.cleanup,
        }
    }
}

/// One metric compared across the two groups. Values are nanoseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    pub name: String,
    pub instrumented: Summary,
    pub plain: Summary,
    /// Mean difference, instrumented minus plain.
    pub overhead_ns: f64,
    pub overhead_pct: Option<f64>,
    pub t_test: StatOutcome<TTest>,
    pub effect_size: StatOutcome<EffectSize>,
    pub f_test: StatOutcome<FTest>,
}

impl MetricComparison {
    /// `None` when either side is empty or every value is zero.
    pub fn compare(name: &str, instrumented: &[f64], plain: &[f64]) -> Option<Self> {
        if instrumented.iter().chain(plain).all(|v| *v == 0.0) {
            return None;
        }
        let with = Summary::of(instrumented)?;
        let without = Summary::of(plain)?;
        let overhead_ns = with.mean - without.mean;
        Some(Self {
            name: name.to_string(),
            overhead_pct: (without.mean > 0.0).then(|| overhead_ns / without.mean * 100.0),
            instrumented: with,
            plain: without,
            overhead_ns,
            t_test: welch_t_test(instrumented, plain),
            effect_size: cohens_d(instrumented, plain),
            f_test: f_test(instrumented, plain),
        })
    }
}

/// Instrumented functions that had the same number of actions attached.
///
/// Functions with no actions are measured in the warm scenario, all others
/// in the warm-with-action scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCountBucket {
    pub actions: u32,
    pub functions: usize,
    pub latency: Summary,
    pub handler_duration: Option<Summary>,
    /// Mean latency minus the plain variant's warm mean.
    pub overhead_ns: Option<f64>,
}

impl ActionCountBucket {
    fn group(instrumented: &VariantRun, plain: &VariantRun) -> Vec<Self> {
        let baseline = Summary::of(&MetricSource::Latency(Scenario::Warm).gather(plain));
        let mut by_count: BTreeMap<u32, Vec<&CaseResult>> = BTreeMap::new();
        for result in &instrumented.results {
            by_count.entry(result.target.action_count).or_default().push(result);
        }

        by_count
            .into_iter()
            .filter_map(|(actions, results)| {
                let scenario = if actions == 0 {
                    Scenario::Warm
                } else {
                    Scenario::WarmWithAction
                };
                let latencies: Vec<f64> =
                    results.iter().flat_map(|r| r.latencies(scenario)).collect();
                let handler: Vec<f64> = results
                    .iter()
                    .flat_map(|r| r.handler_durations(scenario))
                    .collect();
                let latency = Summary::of(&latencies)?;
                Some(Self {
                    actions,
                    functions: results.len(),
                    overhead_ns: baseline.map(|b| latency.mean - b.mean),
                    latency,
                    handler_duration: Summary::of(&handler),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub generated_at: DateTime<Utc>,
    pub instrumented: VariantSummary,
    pub plain: VariantSummary,
    pub metrics: Vec<MetricComparison>,
    #[serde(default)]
    pub action_buckets: Vec<ActionCountBucket>,
}

/// Where a compared metric's values come from.
#[derive(Debug, Clone, Copy)]
enum MetricSource {
    DeploymentDuration,
    TimeToCold,
    Latency(Scenario),
    HandlerDuration(Scenario),
}

impl MetricSource {
    const ALL: [MetricSource; 8] = [
        Self::DeploymentDuration,
        Self::TimeToCold,
        Self::Latency(Scenario::ColdStart),
        Self::Latency(Scenario::Warm),
        Self::Latency(Scenario::WarmWithAction),
        Self::HandlerDuration(Scenario::ColdStart),
        Self::HandlerDuration(Scenario::Warm),
        Self::HandlerDuration(Scenario::WarmWithAction),
    ];

    fn name(self) -> String {
        match self {
            Self::DeploymentDuration => "deployment_duration".to_string(),
            Self::TimeToCold => "time_to_cold".to_string(),
            Self::Latency(scenario) => format!("request_latency.{scenario}"),
            Self::HandlerDuration(scenario) => format!("handler_duration.{scenario}"),
        }
    }

    fn values(self, result: &CaseResult) -> Vec<f64> {
        match self {
            Self::DeploymentDuration => match &result.deployment_outcome {
                DeploymentOutcome::Success { duration_ns, .. } => vec![*duration_ns as f64],
                DeploymentOutcome::Failure { .. } => Vec::new(),
            },
            Self::TimeToCold => result.time_to_cold_secs().map(|s| s * 1e9).into_iter().collect(),
            Self::Latency(scenario) => result.latencies(scenario).collect(),
            Self::HandlerDuration(scenario) => result.handler_durations(scenario).collect(),
        }
    }

    fn gather(self, run: &VariantRun) -> Vec<f64> {
        run.results.iter().flat_map(|r| self.values(r)).collect()
    }
}

impl ComparisonReport {
    pub fn build(instrumented: &VariantRun, plain: &VariantRun) -> Self {
        let metrics = MetricSource::ALL
            .into_iter()
            .filter_map(|source| {
                MetricComparison::compare(
                    &source.name(),
                    &source.gather(instrumented),
                    &source.gather(plain),
                )
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            instrumented: VariantSummary::of(instrumented),
            plain: VariantSummary::of(plain),
            metrics,
            action_buckets: ActionCountBucket::group(instrumented, plain),
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(RULE_WIDTH);
        let thin = "-".repeat(RULE_WIDTH);

        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "Serverless Debugging Agent Overhead - Comparative Analysis");
        let _ = writeln!(out, "Generated: {}", self.generated_at.to_rfc3339());
        let _ = writeln!(out, "{rule}\n");

        let _ = writeln!(out, "TEST SUMMARY");
        let _ = writeln!(out, "{thin}");
        for summary in [&self.instrumented, &self.plain] {
            let _ = writeln!(out, "{}:", title(summary.variant));
            let _ = writeln!(out, "  Functions Deployed: {}/{}", summary.deployed, summary.functions);
            let _ = writeln!(out, "  Successful Requests: {}", summary.successful_requests);
            let _ = writeln!(out, "  Failed Requests: {}", summary.failed_requests);
            let _ = writeln!(
                out,
                "  Cleanup: {} deleted, {} failed\n",
                summary.cleanup.deleted, summary.cleanup.failed
            );
        }

        let _ = writeln!(out, "METRICS COMPARISON");
        let _ = writeln!(out, "{thin}");
        if self.metrics.is_empty() {
            let _ = writeln!(out, "No metric has data for both variants.");
        }
        for metric in &self.metrics {
            render_metric(&mut out, metric);
        }

        if !self.action_buckets.is_empty() {
            let _ = writeln!(out, "\nLATENCY BY ATTACHED ACTIONS");
            let _ = writeln!(out, "{thin}");
            for bucket in &self.action_buckets {
                render_bucket(&mut out, bucket);
            }
        }
        out
    }
}

fn title(variant: Variant) -> &'static str {
    match variant {
        Variant::Instrumented => "With Agent",
        Variant::Plain => "Without Agent",
    }
}

fn render_summary(out: &mut String, label: &str, s: &Summary) {
    let _ = writeln!(out, "  {label}:");
    let _ = writeln!(out, "    Mean:   {}", format_duration(s.mean));
    let _ = writeln!(out, "    Median: {}", format_duration(s.median));
    let _ = writeln!(out, "    StdDev: {}", format_duration(s.stdev));
    let _ = writeln!(out, "    Min:    {}", format_duration(s.min));
    let _ = writeln!(out, "    Max:    {}", format_duration(s.max));
    let _ = writeln!(out, "    Count:  {}", s.count);
}

fn verdict(significant: bool) -> &'static str {
    if significant {
        "significantly different"
    } else {
        "not significantly different"
    }
}

fn render_metric(out: &mut String, m: &MetricComparison) {
    let _ = writeln!(out, "\n{}:", m.name);
    render_summary(out, title(Variant::Instrumented), &m.instrumented);
    render_summary(out, title(Variant::Plain), &m.plain);
    match m.overhead_pct {
        Some(pct) => {
            let _ = writeln!(out, "  Overhead: {} ({pct:+.1}%)", format_duration(m.overhead_ns));
        }
        None => {
            let _ = writeln!(out, "  Overhead: {}", format_duration(m.overhead_ns));
        }
    }

    match &m.t_test {
        StatOutcome::Computed(t) => {
            let _ = writeln!(out, "  T-Test (mean comparison):");
            let _ = writeln!(out, "    T-statistic: {:.4}", t.t);
            let _ = writeln!(out, "    P-value: {:.4}", t.p_value);
            let _ = writeln!(out, "    Degrees of freedom: {:.2}", t.df);
            let _ = writeln!(out, "    Means are {} (p={:.4}, α=0.05)", verdict(t.significant), t.p_value);
        }
        StatOutcome::InsufficientData => {
            let _ = writeln!(out, "  T-Test: insufficient data");
        }
        StatOutcome::CannotCompute => {
            let _ = writeln!(out, "  T-Test: cannot compute (zero variance)");
        }
    }

    if let StatOutcome::Computed(e) = &m.effect_size {
        let direction = if e.d > 0.0 { "positive" } else { "negative" };
        let _ = writeln!(out, "  Effect Size (Cohen's d):");
        let _ = writeln!(out, "    Cohen's d: {:.4}", e.d);
        let _ = writeln!(
            out,
            "    {} effect ({direction}, |d|={:.3})",
            capitalize(&e.magnitude.to_string()),
            e.d.abs()
        );
    }

    if let StatOutcome::Computed(f) = &m.f_test {
        let _ = writeln!(out, "  F-Test (variance comparison):");
        let _ = writeln!(out, "    F-statistic: {:.4}", f.f);
        let _ = writeln!(out, "    P-value: {:.4}", f.p_value);
        let _ = writeln!(out, "    Variances are {} (p={:.4}, α=0.05)", verdict(f.significant), f.p_value);
    }
}

fn render_bucket(out: &mut String, b: &ActionCountBucket) {
    let _ = writeln!(out, "\n{} action(s), {} function(s):", b.actions, b.functions);
    render_summary(out, "Request latency", &b.latency);
    if let Some(handler) = &b.handler_duration {
        render_summary(out, "Handler duration", handler);
    }
    if let Some(overhead) = b.overhead_ns {
        let _ = writeln!(out, "  Overhead vs. without agent: {}", format_duration(overhead));
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::sample_target;
    use fnbench_common::MeasurementSample;

    fn sample(scenario: Scenario, duration_ns: u64) -> MeasurementSample {
        MeasurementSample {
            scenario,
            request_number: 1,
            duration_ns,
            handler_duration_ns: Some(duration_ns / 2),
            success: true,
            error: None,
            status_code: Some(200),
            is_cold_start: None,
        }
    }

    fn result(variant: Variant, index: usize, latencies: &[u64]) -> CaseResult {
        CaseResult {
            target: sample_target(variant, index, "r"),
            deployment_outcome: DeploymentOutcome::Success {
                url: "https://f".into(),
                duration_ns: 60_000_000_000 + index as u64,
                deploy_time: Utc::now(),
                assets: vec![],
            },
            preparation_metric: None,
            samples: latencies.iter().map(|l| sample(Scenario::Warm, *l)).collect(),
            errors: vec![],
            cleanup: None,
            finished_at: Utc::now(),
        }
    }

    fn run(variant: Variant, results: Vec<CaseResult>) -> VariantRun {
        VariantRun {
            variant,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cleanup: CleanupTally::default(),
            results,
        }
    }

    #[test]
    fn test_build_compares_populated_metrics_only() {
        let with = run(
            Variant::Instrumented,
            vec![
                result(Variant::Instrumented, 0, &[2_000_000, 2_100_000]),
                result(Variant::Instrumented, 1, &[2_050_000, 1_950_000]),
            ],
        );
        let without = run(
            Variant::Plain,
            vec![
                result(Variant::Plain, 0, &[1_000_000, 1_100_000]),
                result(Variant::Plain, 1, &[1_050_000, 950_000]),
            ],
        );
        let report = ComparisonReport::build(&with, &without);

        let names: Vec<_> = report.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["deployment_duration", "request_latency.warm", "handler_duration.warm"]
        );
        let warm = &report.metrics[1];
        assert!(warm.overhead_ns > 0.0);
        assert!(warm.t_test.computed().unwrap().significant);
        assert_eq!(report.instrumented.successful_requests, 4);
        assert_eq!(report.plain.deployed, 2);
    }

    fn with_actions(index: usize, actions: u32, latencies: &[u64]) -> CaseResult {
        let mut r = result(Variant::Instrumented, index, &[]);
        r.target.action_count = actions;
        let scenario = if actions == 0 {
            Scenario::Warm
        } else {
            Scenario::WarmWithAction
        };
        r.samples = latencies.iter().map(|l| sample(scenario, *l)).collect();
        r
    }

    #[test]
    fn test_buckets_per_action_count() {
        let with = run(
            Variant::Instrumented,
            vec![
                with_actions(0, 0, &[1_000_000, 1_200_000]),
                with_actions(1, 1, &[1_500_000]),
                with_actions(2, 2, &[2_000_000]),
                with_actions(3, 0, &[1_100_000]),
                with_actions(4, 2, &[]),
            ],
        );
        let without = run(Variant::Plain, vec![result(Variant::Plain, 0, &[1_000_000])]);
        let report = ComparisonReport::build(&with, &without);

        let counts: Vec<_> = report
            .action_buckets
            .iter()
            .map(|b| (b.actions, b.functions, b.latency.count))
            .collect();
        assert_eq!(counts, vec![(0, 2, 3), (1, 1, 1), (2, 2, 1)]);
        assert_eq!(report.action_buckets[1].overhead_ns, Some(500_000.0));
        assert_eq!(report.action_buckets[2].handler_duration.unwrap().mean, 1_000_000.0);

        let text = report.render_text();
        assert!(text.contains("LATENCY BY ATTACHED ACTIONS"));
        assert!(text.contains("2 action(s), 2 function(s):"));
        assert!(text.contains("Overhead vs. without agent: 1ms"));
    }

    #[test]
    fn test_compare_skips_all_zero_and_empty() {
        assert!(MetricComparison::compare("x", &[0.0, 0.0], &[0.0]).is_none());
        assert!(MetricComparison::compare("x", &[1.0], &[]).is_none());
    }

    #[test]
    fn test_render_text_sections() {
        let with = run(Variant::Instrumented, vec![result(Variant::Instrumented, 0, &[2_000_000])]);
        let without = run(Variant::Plain, vec![result(Variant::Plain, 0, &[1_000_000])]);
        let text = ComparisonReport::build(&with, &without).render_text();

        assert!(text.contains("TEST SUMMARY"));
        assert!(text.contains("Functions Deployed: 1/1"));
        assert!(text.contains("request_latency.warm:"));
        assert!(text.contains("Overhead: 1ms (+100.0%)"));
        assert!(text.contains("T-Test: insufficient data"));
    }
}
