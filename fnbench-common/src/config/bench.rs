//! Benchmark run configuration.
//!
//! Built once at startup from layers (defaults, TOML file, `FNBENCH_*`
//! environment, command line) and shared read-only afterwards.

use super::env::{EnvError, EnvParser};
use super::source::{ConfigSource, SourceMap, Sourced};
use crate::types::{ResourceSizing, Variant};
use crate::util::mask_secret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. All of them map to the "bad configuration" exit code.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration value '{key}' ({hint})")]
    Missing { key: &'static str, hint: &'static str },

    #[error("invalid configuration value '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid environment overrides: {}", join_env_errors(.0))]
    Env(Vec<EnvError>),
}

fn join_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Which variants a run deploys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantSelection {
    #[default]
    Both,
    Instrumented,
    Plain,
}

impl VariantSelection {
    pub fn variants(self) -> Vec<Variant> {
        match self {
            Self::Both => Variant::ALL.to_vec(),
            Self::Instrumented => vec![Variant::Instrumented],
            Self::Plain => vec![Variant::Plain],
        }
    }

    pub fn includes(self, variant: Variant) -> bool {
        self.variants().contains(&variant)
    }
}

impl std::str::FromStr for VariantSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "both" => Ok(Self::Both),
            "instrumented" | "agent" => Ok(Self::Instrumented),
            "plain" => Ok(Self::Plain),
            other => Err(format!(
                "unknown variant selection '{other}' (expected both, instrumented or plain)"
            )),
        }
    }
}

/// Kind of debugging action attached during the warm-with-action scenario.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    Snapshot,
    Log,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Snapshot => write!(f, "snapshot"),
            Self::Log => write!(f, "log"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub project: String,
    pub runtime: String,
    pub entry_point: String,
    pub source_dir: Option<PathBuf>,
    pub base_name: String,
    pub sizing: ResourceSizing,
    pub allow_unauthenticated: bool,
    #[serde(with = "duration_str")]
    pub deploy_timeout: Duration,
    /// Timeout for describe/delete/token commands.
    #[serde(with = "duration_str")]
    pub command_timeout: Duration,
    /// Delay per target index before the first deploy attempt.
    #[serde(with = "duration_str")]
    pub stagger_per_index: Duration,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            runtime: "nodejs20".to_string(),
            entry_point: "handler".to_string(),
            source_dir: None,
            base_name: "fnbench".to_string(),
            sizing: ResourceSizing::default(),
            allow_unauthenticated: true,
            deploy_timeout: Duration::from_secs(300),
            command_timeout: Duration::from_secs(120),
            stagger_per_index: Duration::from_millis(500),
        }
    }
}

/// Regions in the order used when no carbon-intensity figures are configured.
pub const DEFAULT_REGIONS: &[&str] = &[
    "europe-north1",
    "europe-west9",
    "europe-west6",
    "northamerica-northeast1",
    "southamerica-east1",
    "europe-west1",
    "us-west1",
    "europe-west2",
    "europe-west3",
    "europe-west4",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub functions_per_variant: usize,
    /// Pool size per variant run. Unset means one worker per function.
    pub workers: Option<usize>,
    pub variants: VariantSelection,
    pub regions: Vec<String>,
    /// Grid carbon intensity per region (gCO2eq/kWh). Regions listed here are
    /// used cleanest first; unlisted regions follow in configured order.
    pub carbon_intensity: BTreeMap<String, f64>,
    pub max_per_region: usize,
    pub output_dir: PathBuf,
    /// Delete every deployed function after the run.
    pub clean_after_run: bool,
    /// Confirm the cold state before the first measured request.
    pub require_cold: bool,
}

impl RunConfig {
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or(self.functions_per_variant).max(1)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            functions_per_variant: 10,
            workers: None,
            variants: VariantSelection::Both,
            regions: DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect(),
            carbon_intensity: BTreeMap::new(),
            max_per_region: 20,
            output_dir: PathBuf::from("fnbench-results"),
            clean_after_run: true,
            require_cold: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_list")]
    pub backoff_means: Vec<Duration>,
    #[serde(with = "duration_str")]
    pub backoff_stddev: Duration,
    #[serde(with = "duration_str")]
    pub min_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_means: vec![
                Duration::from_secs(30),
                Duration::from_secs(90),
                Duration::from_secs(120),
            ],
            backoff_stddev: Duration::from_secs(60),
            min_wait: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdConfig {
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    /// Sustained ambiguity needed before cold is accepted.
    #[serde(with = "duration_str")]
    pub required_window: Duration,
    #[serde(with = "duration_str")]
    pub max_poll_duration: Duration,
    #[serde(with = "duration_str")]
    pub initial_wait: Duration,
    /// How far back each monitoring query looks.
    #[serde(with = "duration_str")]
    pub lookback: Duration,
    /// Data points older than this are not evidence of a running instance.
    #[serde(with = "duration_str")]
    pub staleness: Duration,
}

impl Default for ColdConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            required_window: Duration::from_secs(240),
            max_poll_duration: Duration::from_secs(30 * 60),
            initial_wait: Duration::ZERO,
            lookback: Duration::from_secs(6 * 60),
            staleness: Duration::from_secs(6 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    /// Requests sent per case, including the first (cold) one.
    pub requests_per_case: u32,
    #[serde(with = "duration_str")]
    pub delay_between_requests: Duration,
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
    /// Warm-up requests sent when the cold baseline is not required.
    pub warm_up_requests: u32,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            requests_per_case: 10,
            delay_between_requests: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            warm_up_requests: 1,
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Secret baked into instrumented functions.
    pub secret: Option<String>,
    /// Agent server hostname, without scheme.
    pub server_host: String,
    pub api_key: Option<String>,
    pub company_id: Option<String>,
    pub action_kind: ActionKind,
    /// Source file and first line actions are attached to.
    pub action_file: String,
    pub action_line: u32,
    /// Line offset between consecutive actions of one case.
    pub action_line_step: u32,
    pub action_max_hits: u32,
    /// Actions attached to each instrumented function.
    pub actions_per_case: u32,
    /// Spread instrumented targets over 0..=actions_per_case actions instead
    /// of giving every target the full count.
    pub sweep_action_counts: bool,
    /// How often the agent's bound actions are checked after attaching.
    #[serde(with = "duration_str")]
    pub bind_poll_interval: Duration,
    /// Longest wait for the agent to pick up its actions: the agent's action
    /// refresh interval plus a grace period.
    #[serde(with = "duration_str")]
    pub bind_timeout: Duration,
    pub lookup_attempts: u32,
    #[serde(with = "duration_str")]
    pub lookup_interval: Duration,
    #[serde(with = "duration_str")]
    pub api_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            secret: None,
            server_host: String::new(),
            api_key: None,
            company_id: None,
            action_kind: ActionKind::Snapshot,
            action_file: "index.js".to_string(),
            action_line: 10,
            action_line_step: 1,
            action_max_hits: 1000,
            actions_per_case: 1,
            sweep_action_counts: false,
            bind_poll_interval: Duration::from_secs(2),
            bind_timeout: Duration::from_secs(70),
            lookup_attempts: 10,
            lookup_interval: Duration::from_secs(1),
            api_timeout: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Number of actions attached to the instrumented target at `index`.
    ///
    /// With sweeping enabled, consecutive targets cycle through every count
    /// from zero up to `actions_per_case`.
    pub fn action_count_for(&self, index: usize) -> u32 {
        if self.sweep_action_counts {
            (index % (self.actions_per_case as usize + 1)) as u32
        } else {
            self.actions_per_case
        }
    }

    /// Source line of the `n`th action of a case.
    pub fn action_line_for(&self, n: u32) -> u32 {
        self.action_line
            .saturating_add(n.saturating_mul(self.action_line_step))
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("secret", &self.secret.as_deref().map(mask_secret))
            .field("server_host", &self.server_host)
            .field("api_key", &self.api_key.as_deref().map(mask_secret))
            .field("company_id", &self.company_id)
            .field("action_kind", &self.action_kind)
            .field("action_file", &self.action_file)
            .field("action_line", &self.action_line)
            .field("actions_per_case", &self.actions_per_case)
            .field("sweep_action_counts", &self.sweep_action_counts)
            .finish_non_exhaustive()
    }
}

/// Full benchmark configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub deployment: DeploymentConfig,
    pub run: RunConfig,
    pub retry: RetryConfig,
    pub cold: ColdConfig,
    pub measurement: MeasurementConfig,
    pub agent: AgentConfig,
}

/// A configuration together with the layer each value came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: BenchConfig,
    pub sources: SourceMap,
}

impl BenchConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load defaults, then the optional file, then `FNBENCH_*` overrides.
    ///
    /// Command-line overrides are applied by the caller afterwards.
    pub fn load(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        let mut sources = SourceMap::default();
        let mut config = match path {
            Some(path) => {
                let expanded = expand_path(path);
                let content =
                    std::fs::read_to_string(&expanded).map_err(|source| ConfigError::Io {
                        path: expanded.clone(),
                        source,
                    })?;
                let config = Self::from_toml_str(&content, &expanded)?;
                record_file_keys(&content, &expanded, &mut sources);
                config
            }
            None => Self::default(),
        };

        let mut parser = EnvParser::new();
        config.apply_env(&mut parser, &mut sources);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }

        tracing::debug!(?path, "configuration loaded");
        Ok(LoadedConfig { config, sources })
    }

    /// Apply `FNBENCH_*` overrides on top of the current values.
    pub fn apply_env(&mut self, parser: &mut EnvParser, sources: &mut SourceMap) {
        fn take<T>(sourced: Sourced<T>, slot: &mut T, key: &str, sources: &mut SourceMap) {
            if sourced.is_from_env() {
                *slot = sourced.value;
                sources.record(key, ConfigSource::Environment);
            }
        }

        let d = &mut self.deployment;
        take(parser.get_string("PROJECT", &d.project), &mut d.project, "deployment.project", sources);
        take(parser.get_string("RUNTIME", &d.runtime), &mut d.runtime, "deployment.runtime", sources);
        take(
            parser.get_string("ENTRY_POINT", &d.entry_point),
            &mut d.entry_point,
            "deployment.entry_point",
            sources,
        );
        take(parser.get_string("BASE_NAME", &d.base_name), &mut d.base_name, "deployment.base_name", sources);
        let source_dir = parser.get_path("SOURCE_DIR", Path::new(""));
        if source_dir.is_from_env() {
            d.source_dir = Some(source_dir.value);
            sources.record("deployment.source_dir", ConfigSource::Environment);
        }
        take(
            parser.get_duration("DEPLOY_TIMEOUT", d.deploy_timeout),
            &mut d.deploy_timeout,
            "deployment.deploy_timeout",
            sources,
        );

        let r = &mut self.run;
        take(
            parser.get_range("FUNCTIONS", r.functions_per_variant, 1, 10_000),
            &mut r.functions_per_variant,
            "run.functions_per_variant",
            sources,
        );
        let workers = parser.get_range("WORKERS", r.effective_workers(), 1, 1_000);
        if workers.is_from_env() {
            r.workers = Some(workers.value);
            sources.record("run.workers", ConfigSource::Environment);
        }
        take(parser.get_string_list("REGIONS", &r.regions), &mut r.regions, "run.regions", sources);
        take(
            parser.get_range("MAX_PER_REGION", r.max_per_region, 1, 10_000),
            &mut r.max_per_region,
            "run.max_per_region",
            sources,
        );
        take(
            parser.get_path("OUTPUT_DIR", &r.output_dir),
            &mut r.output_dir,
            "run.output_dir",
            sources,
        );
        take(parser.get_bool("REQUIRE_COLD", r.require_cold), &mut r.require_cold, "run.require_cold", sources);
        take(
            parser.get_bool("CLEAN_AFTER_RUN", r.clean_after_run),
            &mut r.clean_after_run,
            "run.clean_after_run",
            sources,
        );

        let c = &mut self.cold;
        take(
            parser.get_duration("COLD_POLL_INTERVAL", c.poll_interval),
            &mut c.poll_interval,
            "cold.poll_interval",
            sources,
        );
        take(
            parser.get_duration("COLD_WINDOW", c.required_window),
            &mut c.required_window,
            "cold.required_window",
            sources,
        );
        take(
            parser.get_duration("COLD_MAX_POLL", c.max_poll_duration),
            &mut c.max_poll_duration,
            "cold.max_poll_duration",
            sources,
        );

        let m = &mut self.measurement;
        take(
            parser.get_range("REQUESTS", m.requests_per_case, 1, 10_000),
            &mut m.requests_per_case,
            "measurement.requests_per_case",
            sources,
        );
        take(
            parser.get_duration("REQUEST_DELAY", m.delay_between_requests),
            &mut m.delay_between_requests,
            "measurement.delay_between_requests",
            sources,
        );

        let a = &mut self.agent;
        for (name, slot, key) in [
            ("AGENT_SECRET", &mut a.secret, "agent.secret"),
            ("AGENT_API_KEY", &mut a.api_key, "agent.api_key"),
            ("AGENT_COMPANY_ID", &mut a.company_id, "agent.company_id"),
        ] {
            let value = parser.get_optional_string(name);
            if value.is_from_env() {
                *slot = value.value;
                sources.record(key, ConfigSource::Environment);
            }
        }
        take(
            parser.get_string("AGENT_SERVER", &a.server_host),
            &mut a.server_host,
            "agent.server_host",
            sources,
        );
        take(
            parser.get_range("ACTIONS_PER_CASE", a.actions_per_case, 0, 1_000),
            &mut a.actions_per_case,
            "agent.actions_per_case",
            sources,
        );
        take(
            parser.get_bool("SWEEP_ACTIONS", a.sweep_action_counts),
            &mut a.sweep_action_counts,
            "agent.sweep_action_counts",
            sources,
        );
        take(
            parser.get_duration("BIND_TIMEOUT", a.bind_timeout),
            &mut a.bind_timeout,
            "agent.bind_timeout",
            sources,
        );
    }

    /// Check required and mutually consistent values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deployment.project.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "deployment.project",
                hint: "set it in the config file, FNBENCH_PROJECT or --project",
            });
        }
        if self.deployment.source_dir.is_none() {
            return Err(ConfigError::Missing {
                key: "deployment.source_dir",
                hint: "set it in the config file or FNBENCH_SOURCE_DIR",
            });
        }
        if self.run.variants.includes(Variant::Instrumented) {
            if self.agent.secret.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::Missing {
                    key: "agent.secret",
                    hint: "required by the instrumented variant; set FNBENCH_AGENT_SECRET",
                });
            }
            if self.agent.api_key.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::Missing {
                    key: "agent.api_key",
                    hint: "required to attach actions; set FNBENCH_AGENT_API_KEY",
                });
            }
            if self.agent.company_id.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::Missing {
                    key: "agent.company_id",
                    hint: "required to attach actions; set FNBENCH_AGENT_COMPANY_ID",
                });
            }
            if self.agent.server_host.trim().is_empty() {
                return Err(ConfigError::Missing {
                    key: "agent.server_host",
                    hint: "required by the instrumented variant; set FNBENCH_AGENT_SERVER",
                });
            }
        }

        let invalid = |key, reason: &str| {
            Err(ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            })
        };

        if self.run.functions_per_variant == 0 {
            return invalid("run.functions_per_variant", "must be at least 1");
        }
        if self.run.workers == Some(0) {
            return invalid("run.workers", "must be at least 1");
        }
        if self.run.regions.is_empty() {
            return invalid("run.regions", "at least one region is required");
        }
        if self.run.max_per_region == 0 {
            return invalid("run.max_per_region", "must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts", "must be at least 1");
        }
        if self.retry.backoff_means.is_empty() {
            return invalid("retry.backoff_means", "at least one mean is required");
        }
        if self.cold.poll_interval.is_zero() {
            return invalid("cold.poll_interval", "must be greater than zero");
        }
        if self.cold.required_window < self.cold.poll_interval {
            return invalid(
                "cold.required_window",
                "must be at least one poll interval long",
            );
        }
        if self.cold.max_poll_duration < self.cold.required_window {
            return invalid(
                "cold.max_poll_duration",
                "must not be shorter than the required window",
            );
        }
        if self.measurement.requests_per_case == 0 {
            return invalid("measurement.requests_per_case", "must be at least 1");
        }
        if self.agent.lookup_attempts == 0 {
            return invalid("agent.lookup_attempts", "must be at least 1");
        }
        if self.agent.bind_poll_interval.is_zero() {
            return invalid("agent.bind_poll_interval", "must be greater than zero");
        }
        if self.agent.actions_per_case > 0 && self.agent.action_line_step == 0 {
            return invalid("agent.action_line_step", "must be at least 1");
        }
        if let Some((region, _)) = self
            .run
            .carbon_intensity
            .iter()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(ConfigError::Invalid {
                key: "run.carbon_intensity",
                reason: format!("intensity for {region} must be a non-negative number"),
            });
        }
        Ok(())
    }

    /// Flattened `(key, value)` pairs for display, secrets masked.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        let dur = |d: Duration| humantime::format_duration(d).to_string();
        let secret = |s: &Option<String>| {
            s.as_deref()
                .map(mask_secret)
                .unwrap_or_else(|| "<unset>".to_string())
        };
        let d = &self.deployment;
        let r = &self.run;
        vec![
            ("deployment.project", d.project.clone()),
            ("deployment.runtime", d.runtime.clone()),
            ("deployment.entry_point", d.entry_point.clone()),
            (
                "deployment.source_dir",
                d.source_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<unset>".to_string()),
            ),
            ("deployment.base_name", d.base_name.clone()),
            ("deployment.deploy_timeout", dur(d.deploy_timeout)),
            ("run.functions_per_variant", r.functions_per_variant.to_string()),
            ("run.workers", r.effective_workers().to_string()),
            ("run.variants", format!("{:?}", r.variants).to_lowercase()),
            ("run.regions", r.regions.join(",")),
            (
                "run.carbon_intensity",
                if r.carbon_intensity.is_empty() {
                    "<unset>".to_string()
                } else {
                    r.carbon_intensity
                        .iter()
                        .map(|(region, v)| format!("{region}={v}"))
                        .collect::<Vec<_>>()
                        .join(",")
                },
            ),
            ("run.max_per_region", r.max_per_region.to_string()),
            ("run.output_dir", r.output_dir.display().to_string()),
            ("run.require_cold", r.require_cold.to_string()),
            ("run.clean_after_run", r.clean_after_run.to_string()),
            ("retry.max_attempts", self.retry.max_attempts.to_string()),
            ("cold.poll_interval", dur(self.cold.poll_interval)),
            ("cold.required_window", dur(self.cold.required_window)),
            ("cold.max_poll_duration", dur(self.cold.max_poll_duration)),
            (
                "measurement.requests_per_case",
                self.measurement.requests_per_case.to_string(),
            ),
            (
                "measurement.delay_between_requests",
                dur(self.measurement.delay_between_requests),
            ),
            ("agent.secret", secret(&self.agent.secret)),
            ("agent.api_key", secret(&self.agent.api_key)),
            (
                "agent.company_id",
                self.agent.company_id.clone().unwrap_or_else(|| "<unset>".to_string()),
            ),
            ("agent.server_host", self.agent.server_host.clone()),
            ("agent.action_kind", self.agent.action_kind.to_string()),
            ("agent.actions_per_case", self.agent.actions_per_case.to_string()),
            (
                "agent.sweep_action_counts",
                self.agent.sweep_action_counts.to_string(),
            ),
            ("agent.bind_timeout", dur(self.agent.bind_timeout)),
        ]
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

/// Record a `File` source for every leaf key present in the document.
fn record_file_keys(content: &str, path: &Path, sources: &mut SourceMap) {
    let Ok(table) = content.parse::<toml::Table>() else {
        return;
    };
    for (section, value) in &table {
        match value {
            toml::Value::Table(inner) => {
                for key in inner.keys() {
                    sources.record(
                        &format!("{section}.{key}"),
                        ConfigSource::File {
                            path: path.to_path_buf(),
                        },
                    );
                }
            }
            _ => sources.record(
                section,
                ConfigSource::File {
                    path: path.to_path_buf(),
                },
            ),
        }
    }
}

/// Durations as humantime strings (`"15s"`, `"4m"`) or integer seconds.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum Raw {
        Secs(u64),
        Text(String),
    }

    impl Raw {
        pub(super) fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
            match self {
                Raw::Secs(s) => Ok(Duration::from_secs(s)),
                Raw::Text(t) => humantime::parse_duration(t.trim()).map_err(E::custom),
            }
        }
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Raw::deserialize(d)?.into_duration()
    }
}

mod duration_list {
    use super::duration_str::Raw;
    use serde::{Deserialize, Deserializer, Serializer, ser::SerializeSeq};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(v.len()))?;
        for d in v {
            seq.serialize_element(&humantime::format_duration(*d).to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Vec::<Raw>::deserialize(d)?
            .into_iter()
            .map(Raw::into_duration)
            .collect()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use std::io::Write;

    fn valid() -> BenchConfig {
        let mut config = BenchConfig::default();
        config.deployment.project = "bench-project".to_string();
        config.deployment.source_dir = Some(PathBuf::from("/tmp/src"));
        config.agent.secret = Some("secret-value".to_string());
        config.agent.api_key = Some("api-key-value".to_string());
        config.agent.company_id = Some("company".to_string());
        config.agent.server_host = "agents.example.com".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = BenchConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.min_wait, Duration::from_secs(20));
        assert_eq!(config.cold.poll_interval, Duration::from_secs(15));
        assert_eq!(config.cold.required_window, Duration::from_secs(240));
        assert_eq!(config.cold.max_poll_duration, Duration::from_secs(1800));
        assert_eq!(config.run.max_per_region, 20);
        assert_eq!(config.deployment.stagger_per_index, Duration::from_millis(500));
        assert_eq!(config.agent.lookup_attempts, 10);
    }

    #[test]
    fn test_validate_missing_project() {
        let mut config = valid();
        config.deployment.project.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing {
                key: "deployment.project",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_secret_only_needed_for_instrumented() {
        let mut config = valid();
        config.agent.secret = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing {
                key: "agent.secret",
                ..
            })
        ));
        config.run.variants = VariantSelection::Plain;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_window_shorter_than_interval() {
        let mut config = valid();
        config.cold.required_window = Duration::from_secs(5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "cold.required_window",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = valid();
        config.run.workers = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "run.workers", .. })
        ));
    }

    #[test]
    fn test_effective_workers_defaults_to_function_count() {
        let mut run = RunConfig::default();
        run.functions_per_variant = 7;
        assert_eq!(run.effective_workers(), 7);
        run.workers = Some(3);
        assert_eq!(run.effective_workers(), 3);
    }

    #[test]
    fn test_toml_parsing_with_durations() {
        let content = r#"
            [deployment]
            project = "p"
            source_dir = "/src"

            [cold]
            poll_interval = "10s"
            required_window = 120

            [retry]
            backoff_means = ["30s", "1m"]
        "#;
        let config = BenchConfig::from_toml_str(content, Path::new("x.toml")).unwrap();
        assert_eq!(config.deployment.project, "p");
        assert_eq!(config.cold.poll_interval, Duration::from_secs(10));
        assert_eq!(config.cold.required_window, Duration::from_secs(120));
        assert_eq!(
            config.retry.backoff_means,
            vec![Duration::from_secs(30), Duration::from_secs(60)]
        );
        // untouched sections keep defaults
        assert_eq!(config.measurement.requests_per_case, 10);
    }

    #[test]
    fn test_action_counts_fixed_and_swept() {
        let mut agent = AgentConfig {
            actions_per_case: 3,
            action_line: 20,
            action_line_step: 2,
            ..AgentConfig::default()
        };
        assert!((0..6).all(|i| agent.action_count_for(i) == 3));

        agent.sweep_action_counts = true;
        let counts: Vec<u32> = (0..6).map(|i| agent.action_count_for(i)).collect();
        assert_eq!(counts, vec![0, 1, 2, 3, 0, 1]);
        assert_eq!(agent.action_line_for(0), 20);
        assert_eq!(agent.action_line_for(2), 24);
    }

    #[test]
    fn test_carbon_intensity_table_from_toml() {
        let content = r#"
            [run]
            regions = ["us-east1", "europe-north1"]

            [run.carbon_intensity]
            us-east1 = 576.0
            europe-north1 = 39
        "#;
        let config = BenchConfig::from_toml_str(content, Path::new("x.toml")).unwrap();
        assert_eq!(config.run.carbon_intensity.get("europe-north1"), Some(&39.0));
        assert_eq!(config.run.carbon_intensity.len(), 2);

        let mut config = valid();
        config.run.carbon_intensity.insert("us-east1".into(), -1.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "run.carbon_intensity",
                ..
            })
        ));
    }

    #[test]
    fn test_toml_parse_error() {
        let err = BenchConfig::from_toml_str("[cold]\npoll_interval = \"soon\"", Path::new("bad.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_file_then_env_precedence() {
        let _guard = env_test_lock();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[deployment]\nproject = \"from-file\"\nruntime = \"nodejs18\"\n[run]\nworkers = 4"
        )
        .unwrap();

        // SAFETY: env access is serialized by env_test_lock
        unsafe { std::env::set_var("FNBENCH_PROJECT", "from-env") };
        let loaded = BenchConfig::load(Some(file.path()));
        unsafe { std::env::remove_var("FNBENCH_PROJECT") };

        let loaded = loaded.unwrap();
        assert_eq!(loaded.config.deployment.project, "from-env");
        assert_eq!(loaded.config.deployment.runtime, "nodejs18");
        assert_eq!(loaded.config.run.workers, Some(4));
        assert_eq!(
            loaded.sources.source_of("deployment.project"),
            ConfigSource::Environment
        );
        assert!(matches!(
            loaded.sources.source_of("deployment.runtime"),
            ConfigSource::File { .. }
        ));
        assert_eq!(
            loaded.sources.source_of("cold.poll_interval"),
            ConfigSource::Default
        );
    }

    #[test]
    fn test_load_reports_env_errors_together() {
        let _guard = env_test_lock();
        // SAFETY: env access is serialized by env_test_lock
        unsafe {
            std::env::set_var("FNBENCH_WORKERS", "zero");
            std::env::set_var("FNBENCH_COLD_WINDOW", "forever");
        }
        let result = BenchConfig::load(None);
        unsafe {
            std::env::remove_var("FNBENCH_WORKERS");
            std::env::remove_var("FNBENCH_COLD_WINDOW");
        }
        match result {
            Err(ConfigError::Env(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected env errors, got {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = BenchConfig::load(Some(Path::new("/nonexistent/fnbench.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_debug_and_describe_mask_secrets() {
        let config = valid();
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-value"));
        assert!(!debug.contains("api-key-value"));
        let described = config.describe();
        let secret = described
            .iter()
            .find(|(k, _)| *k == "agent.secret")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(!secret.contains("secret-value"));
    }

    #[test]
    fn test_variant_selection_parse() {
        assert_eq!("both".parse::<VariantSelection>(), Ok(VariantSelection::Both));
        assert_eq!(
            "Plain".parse::<VariantSelection>(),
            Ok(VariantSelection::Plain)
        );
        assert!("neither".parse::<VariantSelection>().is_err());
        assert!(VariantSelection::Both.includes(Variant::Plain));
        assert!(!VariantSelection::Plain.includes(Variant::Instrumented));
    }

    #[test]
    fn test_example_config_is_valid_except_secrets() {
        let content = include_str!("../../../fnbench.example.toml");
        let mut config =
            BenchConfig::from_toml_str(content, Path::new("fnbench.example.toml")).unwrap();
        assert_eq!(config.run.regions.len(), 3);
        assert_eq!(config.retry.backoff_means.len(), 3);
        assert_eq!(config.cold.required_window, Duration::from_secs(240));
        assert_eq!(config.run.carbon_intensity.get("europe-west6"), Some(&29.0));
        assert_eq!(config.agent.bind_timeout, Duration::from_secs(70));

        config.agent.secret = Some("secret-value".to_string());
        config.agent.api_key = Some("api-key-value".to_string());
        config.agent.company_id = Some("company".to_string());
        config.validate().unwrap();
    }
}
