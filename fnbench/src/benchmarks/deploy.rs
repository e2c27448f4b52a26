//! Function deployment with retry, endpoint resolution and asset discovery.

use crate::benchmarks::context::{CancelFlag, cancellable_sleep};
use crate::benchmarks::error::BenchmarkError;
use crate::benchmarks::retry::{RetryPolicy, run_with_retry};
use crate::remote::{CommandOutput, RemoteCommandExecutor};
use chrono::Utc;
use fnbench_common::config::DeploymentConfig;
use fnbench_common::util::truncate_for_log;
use fnbench_common::{CloudAsset, DeploymentOutcome, DeploymentTarget};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest error text kept in a deployment outcome.
const MAX_ERROR_LEN: usize = 500;

pub const CANCELLED_BEFORE_DEPLOYMENT: &str = "cancelled before deployment";

pub struct DeploymentCoordinator {
    executor: Arc<dyn RemoteCommandExecutor>,
    config: DeploymentConfig,
    policy: RetryPolicy,
}

impl DeploymentCoordinator {
    pub fn new(
        executor: Arc<dyn RemoteCommandExecutor>,
        config: DeploymentConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            executor,
            config,
            policy,
        }
    }

    /// Deploy `target`, resolve its URL and discover the assets it created.
    ///
    /// Never returns an error: every failure becomes a `Failure` outcome that
    /// lists whatever was created so cleanup can find it.
    pub async fn deploy(&self, target: &DeploymentTarget, cancel: &CancelFlag) -> DeploymentOutcome {
        let stagger = self.config.stagger_per_index.saturating_mul(target.index as u32);
        if cancel.is_cancelled() || !cancellable_sleep(stagger, cancel).await {
            return DeploymentOutcome::Failure {
                error: CANCELLED_BEFORE_DEPLOYMENT.to_string(),
                partial_assets: Vec::new(),
            };
        }

        info!(function = %target.name, region = %target.region, "Deploying function");
        let mut rng = fastrand::Rng::new();
        let deployed = run_with_retry("deploy", &self.policy, &mut rng, cancel, |attempt| {
            self.deploy_once(target, attempt)
        })
        .await;

        let duration = match deployed {
            Ok(duration) => duration,
            Err(err) => {
                let error = truncate_for_log(&err.to_string(), MAX_ERROR_LEN);
                warn!(function = %target.name, error = %error, "Deployment failed");
                return DeploymentOutcome::Failure {
                    error,
                    partial_assets: self.partial_assets(target).await,
                };
            }
        };
        let deploy_time = Utc::now();

        let url = match self.resolve_url(target).await {
            Ok(url) => url,
            Err(err) => {
                warn!(function = %target.name, error = %err, "Endpoint resolution failed");
                let mut partial_assets = self.partial_assets(target).await;
                if partial_assets.is_empty() {
                    partial_assets.push(target.function_asset());
                }
                return DeploymentOutcome::Failure {
                    error: err.to_string(),
                    partial_assets,
                };
            }
        };

        let mut assets = vec![target.function_asset()];
        assets.extend(self.discover_assets(target).await.unwrap_or_default());

        info!(
            function = %target.name,
            url = %url,
            duration_secs = duration.as_secs_f64(),
            assets = assets.len(),
            "Deployment succeeded"
        );
        DeploymentOutcome::Success {
            url,
            duration_ns: u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
            deploy_time,
            assets,
        }
    }

    /// One deploy attempt; returns how long the successful attempt took.
    async fn deploy_once(
        &self,
        target: &DeploymentTarget,
        attempt: u32,
    ) -> Result<Duration, BenchmarkError> {
        let argv = self.deploy_argv(target);
        debug!(function = %target.name, attempt, "Running deploy command");
        let started = Instant::now();
        let output = self.executor.run(&argv, self.config.deploy_timeout).await?;
        if output.success() {
            Ok(started.elapsed())
        } else {
            Err(BenchmarkError::DeploymentFailed(truncate_for_log(
                &output.error_text(),
                MAX_ERROR_LEN,
            )))
        }
    }

    pub fn deploy_argv(&self, target: &DeploymentTarget) -> Vec<String> {
        let sizing = &target.sizing;
        let mut argv = vec![
            "gcloud".to_string(),
            "functions".to_string(),
            "deploy".to_string(),
            target.name.clone(),
            "--gen2".to_string(),
            format!("--runtime={}", target.runtime),
            format!("--region={}", target.region),
            format!("--source={}", target.source_dir.display()),
            format!("--entry-point={}", target.entry_point),
            format!("--project={}", target.project),
            "--trigger-http".to_string(),
        ];
        if self.config.allow_unauthenticated {
            argv.push("--allow-unauthenticated".to_string());
        }
        argv.extend([
            format!("--min-instances={}", sizing.min_instances),
            format!("--max-instances={}", sizing.max_instances),
            format!("--timeout={}", sizing.timeout_secs),
            format!("--concurrency={}", sizing.concurrency),
            format!("--memory={}", sizing.memory),
            format!("--cpu={}", sizing.cpu),
        ]);
        if !target.env_vars.is_empty() {
            argv.push(format!("--set-env-vars={}", join_pairs(&target.env_vars)));
        }
        if !target.labels.is_empty() {
            argv.push(format!("--update-labels={}", join_pairs(&target.labels)));
        }
        argv.push("--quiet".to_string());
        argv
    }

    fn describe_argv(&self, target: &DeploymentTarget, format: &str) -> Vec<String> {
        vec![
            "gcloud".to_string(),
            "functions".to_string(),
            "describe".to_string(),
            target.name.clone(),
            format!("--region={}", target.region),
            "--gen2".to_string(),
            format!("--project={}", target.project),
            format!("--format={format}"),
        ]
    }

    async fn describe(&self, target: &DeploymentTarget, format: &str) -> Option<CommandOutput> {
        let argv = self.describe_argv(target, format);
        match self.executor.run(&argv, self.config.command_timeout).await {
            Ok(output) if output.success() => Some(output),
            Ok(output) => {
                debug!(function = %target.name, error = %output.error_text(), "Describe failed");
                None
            }
            Err(err) => {
                debug!(function = %target.name, error = %err, "Describe failed");
                None
            }
        }
    }

    pub async fn resolve_url(&self, target: &DeploymentTarget) -> Result<String, BenchmarkError> {
        let argv = self.describe_argv(target, "value(serviceConfig.uri)");
        let output = self.executor.run(&argv, self.config.command_timeout).await?;
        if !output.success() {
            return Err(BenchmarkError::EndpointResolution {
                function: target.name.clone(),
                reason: truncate_for_log(&output.error_text(), MAX_ERROR_LEN),
            });
        }
        let url = output.stdout.trim();
        if url.is_empty() {
            return Err(BenchmarkError::EndpointResolution {
                function: target.name.clone(),
                reason: "empty URL".to_string(),
            });
        }
        Ok(url.to_string())
    }

    /// Storage and image assets created by the build.
    ///
    /// `None` when the function cannot be described at all.
    pub async fn discover_assets(&self, target: &DeploymentTarget) -> Option<Vec<CloudAsset>> {
        let output = self.describe(target, "json").await?;
        match serde_json::from_str::<Value>(&output.stdout) {
            Ok(description) => Some(parse_build_assets(&description)),
            Err(err) => {
                warn!(function = %target.name, error = %err, "Unparseable function description");
                Some(Vec::new())
            }
        }
    }

    /// Assets left behind by a failed deployment.
    async fn partial_assets(&self, target: &DeploymentTarget) -> Vec<CloudAsset> {
        match self.discover_assets(target).await {
            Some(discovered) => {
                let mut assets = vec![target.function_asset()];
                assets.extend(discovered);
                assets
            }
            None => Vec::new(),
        }
    }
}

fn join_pairs(pairs: &std::collections::BTreeMap<String, String>) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Extract the source archive and container image from a function description.
pub fn parse_build_assets(description: &Value) -> Vec<CloudAsset> {
    let mut assets = Vec::new();
    let build = &description["buildConfig"];

    let storage = &build["source"]["storageSource"];
    if let (Some(bucket), Some(object)) = (storage["bucket"].as_str(), storage["object"].as_str())
        && !bucket.is_empty()
        && !object.is_empty()
    {
        assets.push(CloudAsset::SourceArchive {
            uri: format!("gs://{bucket}/{object}"),
        });
    }

    if let Some(image) = build["imageUri"].as_str()
        && !image.is_empty()
    {
        assets.push(CloudAsset::ContainerImage {
            uri: image.to_string(),
        });
    }
    assets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockExecutor, has_arg, sample_target};
    use crate::remote::RemoteError;
    use fnbench_common::Variant;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coordinator(executor: Arc<MockExecutor>) -> DeploymentCoordinator {
        DeploymentCoordinator::new(executor, DeploymentConfig::default(), RetryPolicy::default())
    }

    fn is_deploy(argv: &[String]) -> bool {
        has_arg(argv, "deploy")
    }

    #[test]
    fn test_deploy_argv_shape() {
        let executor = Arc::new(MockExecutor::new());
        let mut target = sample_target(Variant::Instrumented, 3, "europe-north1");
        target.env_vars.insert("AGENT_SECRET".into(), "s".into());
        target.env_vars.insert("DISPLAY_NAME".into(), "d".into());
        let argv = coordinator(executor).deploy_argv(&target);

        assert_eq!(&argv[..4], ["gcloud", "functions", "deploy", "fnbench-agent-003"]);
        assert!(has_arg(&argv, "--gen2"));
        assert!(has_arg(&argv, "--region=europe-north1"));
        assert!(has_arg(&argv, "--memory=512Mi"));
        assert!(has_arg(&argv, "--set-env-vars=AGENT_SECRET=s,DISPLAY_NAME=d"));
        assert_eq!(argv.last().map(String::as_str), Some("--quiet"));
    }

    #[test]
    fn test_parse_build_assets() {
        let description = serde_json::json!({
            "buildConfig": {
                "source": {"storageSource": {"bucket": "b", "object": "o.zip"}},
                "imageUri": "docker.pkg.dev/p/r/i:latest"
            }
        });
        assert_eq!(
            parse_build_assets(&description),
            vec![
                CloudAsset::SourceArchive { uri: "gs://b/o.zip".into() },
                CloudAsset::ContainerImage { uri: "docker.pkg.dev/p/r/i:latest".into() },
            ]
        );
        assert!(parse_build_assets(&serde_json::json!({})).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_deploy_lists_assets() {
        let executor = Arc::new(MockExecutor::new().with_gcloud_defaults());
        let target = sample_target(Variant::Plain, 0, "us-east1");
        let outcome = coordinator(executor.clone())
            .deploy(&target, &CancelFlag::new())
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.url(), Some("https://fnbench-plain-000.run.app"));
        assert_eq!(outcome.assets().len(), 3);
        assert_eq!(outcome.assets()[0], target.function_asset());
        assert_eq!(executor.commands_with("deploy").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let executor = Arc::new(MockExecutor::new().with_gcloud_defaults());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        executor.on_command(is_deploy, move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(CommandOutput::failed(1, "ERROR: 429 Too Many Requests"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        });

        let start = Instant::now();
        let outcome = coordinator(executor.clone())
            .deploy(&sample_target(Variant::Plain, 0, "r"), &CancelFlag::new())
            .await;

        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let executor = Arc::new(MockExecutor::new());
        executor.on_command(is_deploy, |_| {
            Ok(CommandOutput::failed(1, "ERROR: Permission denied"))
        });
        executor.on_command(|a| has_arg(a, "describe"), |_| {
            Ok(CommandOutput::failed(1, "NOT_FOUND"))
        });

        let outcome = coordinator(executor.clone())
            .deploy(&sample_target(Variant::Plain, 0, "r"), &CancelFlag::new())
            .await;

        assert!(!outcome.is_success());
        assert!(outcome.error().unwrap().contains("Permission denied"));
        assert!(!outcome.requires_cleanup());
        assert_eq!(executor.commands_with("deploy").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_deploy_with_describable_function_has_partial_assets() {
        let executor = Arc::new(MockExecutor::new().with_gcloud_defaults());
        executor.on_command(is_deploy, |_| {
            Ok(CommandOutput::failed(1, "Build failed: npm ERR!"))
        });

        let target = sample_target(Variant::Plain, 0, "r");
        let outcome = coordinator(executor).deploy(&target, &CancelFlag::new()).await;

        assert!(!outcome.is_success());
        assert!(outcome.requires_cleanup());
        assert_eq!(outcome.assets()[0], target.function_asset());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_url_is_failure_with_function_asset() {
        let executor = Arc::new(MockExecutor::new());
        executor.on_command(
            |a| a.iter().any(|x| x.contains("serviceConfig.uri")),
            |_| Ok(CommandOutput::ok("\n")),
        );
        executor.on_command(|a| has_arg(a, "--format=json"), |_| {
            Ok(CommandOutput::failed(1, "boom"))
        });

        let target = sample_target(Variant::Plain, 0, "r");
        let outcome = coordinator(executor).deploy(&target, &CancelFlag::new()).await;

        assert!(outcome.error().unwrap().contains("empty URL"));
        assert_eq!(outcome.assets(), &[target.function_asset()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let executor = Arc::new(MockExecutor::new().with_gcloud_defaults());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        executor.on_command(is_deploy, move |argv| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RemoteError::Timeout {
                    command: argv.join(" "),
                    after: Duration::from_secs(300),
                })
            } else {
                Ok(CommandOutput::ok(""))
            }
        });

        let outcome = coordinator(executor)
            .deploy(&sample_target(Variant::Plain, 0, "r"), &CancelFlag::new())
            .await;
        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stagger_by_index() {
        let executor = Arc::new(MockExecutor::new().with_gcloud_defaults());
        let start = Instant::now();
        coordinator(executor)
            .deploy(&sample_target(Variant::Plain, 4, "r"), &CancelFlag::new())
            .await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_deploy() {
        let executor = Arc::new(MockExecutor::new().with_gcloud_defaults());
        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = coordinator(executor.clone())
            .deploy(&sample_target(Variant::Plain, 0, "r"), &cancel)
            .await;
        assert_eq!(outcome.error(), Some(CANCELLED_BEFORE_DEPLOYMENT));
        assert!(executor.commands().is_empty());
    }
}
