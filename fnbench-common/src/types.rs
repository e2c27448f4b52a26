//! Common types used across fnbench components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Longest function name the deployment backend accepts.
pub const MAX_FUNCTION_NAME_LEN: usize = 63;

/// Which side of the comparison a target belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Function deployed with the debugging agent loaded.
    Instrumented,
    /// Function deployed without the agent.
    Plain,
}

impl Variant {
    /// Both variants, instrumented first.
    pub const ALL: [Variant; 2] = [Variant::Instrumented, Variant::Plain];

    /// Short slug used in function names and file names.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Instrumented => "agent",
            Self::Plain => "plain",
        }
    }

    pub fn has_agent(self) -> bool {
        matches!(self, Self::Instrumented)
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instrumented => write!(f, "instrumented"),
            Self::Plain => write!(f, "plain"),
        }
    }
}

/// Resource sizing requested for each deployed function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSizing {
    pub memory: String,
    pub cpu: String,
    pub concurrency: u32,
    pub min_instances: u32,
    pub max_instances: u32,
    pub timeout_secs: u32,
}

impl Default for ResourceSizing {
    fn default() -> Self {
        Self {
            memory: "512Mi".to_string(),
            cpu: "2".to_string(),
            concurrency: 80,
            min_instances: 0,
            max_instances: 5,
            timeout_secs: 540,
        }
    }
}

/// Identity and settings of one function to deploy.
///
/// Built once by the orchestrator's create phase and then owned by exactly one
/// benchmark case, which only ever reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    /// Backend function name (sanitized, length-limited).
    pub name: String,
    /// Name the agent registers under; used to look the agent up.
    pub display_name: String,
    /// Position of the target within its variant run.
    pub index: usize,
    pub region: String,
    pub runtime: String,
    pub entry_point: String,
    pub source_dir: PathBuf,
    pub project: String,
    pub variant: Variant,
    pub sizing: ResourceSizing,
    /// Environment variables passed to the function. May hold secrets.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Debugging actions attached while measuring. Zero for plain targets.
    #[serde(default)]
    pub action_count: u32,
}

impl DeploymentTarget {
    /// Build the backend-compatible name for a target.
    ///
    /// Only the base is shortened to fit, so the `-{variant}-{index}` suffix
    /// always survives and names stay unique within a run.
    pub fn function_name(base_name: &str, variant: Variant, index: usize) -> String {
        let suffix = format!("-{}-{:03}", variant.slug(), index);
        let mut base = sanitize_function_name(base_name);
        base.truncate(MAX_FUNCTION_NAME_LEN.saturating_sub(suffix.len()).max(1));
        while base.len() > 1 && base.ends_with('-') {
            base.pop();
        }
        base + &suffix
    }

    /// Short label for logs: `name@region`.
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.region)
    }

    /// Handle for the function itself, for cleanup.
    pub fn function_asset(&self) -> CloudAsset {
        CloudAsset::Function {
            name: self.name.clone(),
            region: self.region.clone(),
            project: self.project.clone(),
        }
    }
}

/// Lowercase, replace unsupported characters with `-`, force a leading letter
/// and cut to [`MAX_FUNCTION_NAME_LEN`].
pub fn sanitize_function_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        name.insert(0, 'f');
    }
    name.truncate(MAX_FUNCTION_NAME_LEN);
    while name.ends_with('-') {
        name.pop();
    }
    name
}

/// A cloud resource that must be removed after the run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CloudAsset {
    /// The deployed function.
    Function {
        name: String,
        region: String,
        project: String,
    },
    /// Staged source archive, e.g. `gs://bucket/object.zip`.
    SourceArchive { uri: String },
    /// Container image built from the source.
    ContainerImage { uri: String },
}

impl std::fmt::Display for CloudAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function { name, region, .. } => write!(f, "function {}@{}", name, region),
            Self::SourceArchive { uri } => write!(f, "source archive {}", uri),
            Self::ContainerImage { uri } => write!(f, "container image {}", uri),
        }
    }
}

/// Terminal result of deploying one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeploymentOutcome {
    Success {
        url: String,
        /// Duration of the successful attempt, in nanoseconds.
        duration_ns: u64,
        deploy_time: DateTime<Utc>,
        assets: Vec<CloudAsset>,
    },
    Failure {
        error: String,
        partial_assets: Vec<CloudAsset>,
    },
}

impl DeploymentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Success { url, .. } => Some(url),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    /// Assets known for this deployment, successful or partial.
    pub fn assets(&self) -> &[CloudAsset] {
        match self {
            Self::Success { assets, .. } => assets,
            Self::Failure { partial_assets, .. } => partial_assets,
        }
    }

    /// Cleanup is owed for every success and for failures that left assets behind.
    pub fn requires_cleanup(&self) -> bool {
        match self {
            Self::Success { .. } => true,
            Self::Failure { partial_assets, .. } => !partial_assets.is_empty(),
        }
    }
}

/// What the monitoring backend reported for one instance-count query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstanceObservation {
    /// No data, a failed query or a malformed response. Not proof of zero.
    Ambiguous,
    /// Explicit recent data points.
    Observed { count: u64, state: String },
}

impl InstanceObservation {
    /// Explicit evidence of at least one running instance.
    pub fn is_warm(&self) -> bool {
        matches!(self, Self::Observed { count, .. } if *count > 0)
    }
}

/// One monitoring sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdStateReading {
    pub observation: InstanceObservation,
    pub observed_at: DateTime<Utc>,
}

impl ColdStateReading {
    pub fn now(observation: InstanceObservation) -> Self {
        Self {
            observation,
            observed_at: Utc::now(),
        }
    }
}

/// Lifecycle state a latency sample was taken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// First request after the function was confirmed cold.
    ColdStart,
    /// Request to a warm instance with no debugging action attached.
    Warm,
    /// Request to a warm instance after a debugging action was attached.
    WarmWithAction,
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ColdStart => write!(f, "cold_start"),
            Self::Warm => write!(f, "warm"),
            Self::WarmWithAction => write!(f, "warm_with_action"),
        }
    }
}

/// One request/response timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    pub scenario: Scenario,
    /// 1-based position within the case's request sequence.
    pub request_number: u32,
    /// Client-observed round trip, in nanoseconds.
    pub duration_ns: u64,
    /// Duration reported by the function handler itself, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_duration_ns: Option<u64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_cold_start: Option<bool>,
}

/// Metric produced by the preparation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreparationMetric {
    /// Seconds from the deploy phase start until cold was confirmed.
    TimeToCold { seconds: f64, readings: u32 },
    /// Number of warm-up requests sent instead of waiting for cold.
    WarmUp { requests: u32 },
}

/// Result of removing one case's cloud resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOutcome {
    /// `None` when the function itself was not a cleanup target.
    pub function_deleted: Option<bool>,
    pub assets_deleted: u32,
    pub assets_failed: u32,
    pub errors: Vec<String>,
}

impl CleanupOutcome {
    pub fn is_success(&self) -> bool {
        self.function_deleted != Some(false) && self.assets_failed == 0
    }
}

/// Terminal record of one benchmark case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub target: DeploymentTarget,
    pub deployment_outcome: DeploymentOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preparation_metric: Option<PreparationMetric>,
    pub samples: Vec<MeasurementSample>,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupOutcome>,
    pub finished_at: DateTime<Utc>,
}

impl CaseResult {
    /// Successful samples of one scenario, as client latency in nanoseconds.
    pub fn latencies(&self, scenario: Scenario) -> impl Iterator<Item = f64> + '_ {
        self.samples
            .iter()
            .filter(move |s| s.success && s.scenario == scenario)
            .map(|s| s.duration_ns as f64)
    }

    /// Successful samples of one scenario, as handler-reported duration.
    pub fn handler_durations(&self, scenario: Scenario) -> impl Iterator<Item = f64> + '_ {
        self.samples
            .iter()
            .filter(move |s| s.success && s.scenario == scenario)
            .filter_map(|s| s.handler_duration_ns.map(|d| d as f64))
    }

    pub fn time_to_cold_secs(&self) -> Option<f64> {
        match self.preparation_metric {
            Some(PreparationMetric::TimeToCold { seconds, .. }) => Some(seconds),
            _ => None,
        }
    }
}
