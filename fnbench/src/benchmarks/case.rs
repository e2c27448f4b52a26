//! One benchmark case: deploy, prepare, measure, clean up.
//!
//! Every step catches its own errors and records them on the case. A failed
//! step skips the remaining work steps, never the cleanup. A case always ends
//! as a [`CaseResult`].

use crate::benchmarks::cleanup::Cleaner;
use crate::benchmarks::cold::ColdStateConfirmer;
use crate::benchmarks::context::{CancelFlag, cancellable_sleep};
use crate::benchmarks::deploy::{CANCELLED_BEFORE_DEPLOYMENT, DeploymentCoordinator};
use crate::benchmarks::error::BenchmarkError;
use crate::benchmarks::measure::RequestSender;
use crate::benchmarks::session::DebuggingSession;
use crate::remote::AgentActionClient;
use chrono::Utc;
use fnbench_common::config::AgentConfig;
use fnbench_common::{
    CaseResult, CleanupOutcome, CloudAsset, DeploymentOutcome, DeploymentTarget,
    MeasurementSample, PreparationMetric, Scenario,
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{Span, debug, info, info_span, warn};

/// Collaborators shared by every case of a variant run.
pub struct CaseServices {
    pub coordinator: DeploymentCoordinator,
    pub confirmer: ColdStateConfirmer,
    pub sender: RequestSender,
    pub cleaner: Cleaner,
    /// Present when actions should be attached to instrumented functions.
    pub agent_client: Option<Arc<dyn AgentActionClient>>,
    pub agent_config: AgentConfig,
    pub require_cold: bool,
}

pub struct BenchmarkCase {
    target: DeploymentTarget,
    services: Arc<CaseServices>,
    deploy_started: Option<Instant>,
    outcome: Option<DeploymentOutcome>,
    preparation: Option<PreparationMetric>,
    cold_confirmed: bool,
    samples: Vec<MeasurementSample>,
    errors: Vec<String>,
    cleanup: Option<CleanupOutcome>,
    cleanup_attempted: bool,
}

impl BenchmarkCase {
    pub fn new(target: DeploymentTarget, services: Arc<CaseServices>) -> Self {
        Self {
            target,
            services,
            deploy_started: None,
            outcome: None,
            preparation: None,
            cold_confirmed: false,
            samples: Vec::new(),
            errors: Vec::new(),
            cleanup: None,
            cleanup_attempted: false,
        }
    }

    /// Case rebuilt from a registered deployment after its task was lost.
    pub fn recovered(
        target: DeploymentTarget,
        services: Arc<CaseServices>,
        outcome: Option<DeploymentOutcome>,
        error: BenchmarkError,
    ) -> Self {
        let mut case = Self::new(target, services);
        case.outcome = Some(outcome.unwrap_or_else(|| DeploymentOutcome::Failure {
            error: error.to_string(),
            partial_assets: Vec::new(),
        }));
        case.errors.push(error.to_string());
        case
    }

    pub fn target(&self) -> &DeploymentTarget {
        &self.target
    }

    pub fn outcome(&self) -> Option<&DeploymentOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_deployed(&self) -> bool {
        self.outcome.as_ref().is_some_and(DeploymentOutcome::is_success)
    }

    pub fn cleanup_outcome(&self) -> Option<&CleanupOutcome> {
        self.cleanup.as_ref()
    }

    pub fn requires_cleanup(&self) -> bool {
        self.outcome
            .as_ref()
            .is_some_and(DeploymentOutcome::requires_cleanup)
    }

    /// Span every step of this case runs in.
    pub fn span(&self) -> Span {
        info_span!(
            "case",
            variant = %self.target.variant,
            index = self.target.index,
            region = %self.target.region
        )
    }

    fn record_error(&mut self, err: &BenchmarkError) {
        warn!(function = %self.target.name, error = %err, "Case step failed");
        self.errors.push(err.to_string());
    }

    pub async fn deploy(&mut self, cancel: &CancelFlag) {
        if self.outcome.is_some() {
            return;
        }
        self.deploy_started = Some(Instant::now());
        let outcome = self.services.coordinator.deploy(&self.target, cancel).await;
        if let Some(error) = outcome.error() {
            self.errors.push(error.to_string());
        }
        self.outcome = Some(outcome);
    }

    /// Prepare the function state and run the measurement series.
    pub async fn prepare_and_measure(&mut self, cancel: &CancelFlag) {
        let Some(url) = self.outcome.as_ref().and_then(|o| o.url()).map(str::to_string) else {
            return;
        };
        if let Err(err) = self.prepare(&url, cancel).await {
            self.record_error(&err);
            return;
        }
        if let Err(err) = self.measure(&url, cancel).await {
            self.record_error(&err);
        }
    }

    async fn prepare(&mut self, url: &str, cancel: &CancelFlag) -> Result<(), BenchmarkError> {
        if self.services.require_cold {
            let reference = self.deploy_started.unwrap_or_else(Instant::now);
            let confirmation = self
                .services
                .confirmer
                .confirm(&self.target, reference, cancel)
                .await?;
            self.cold_confirmed = true;
            self.preparation = Some(PreparationMetric::TimeToCold {
                seconds: confirmation.time_to_cold.as_secs_f64(),
                readings: confirmation.readings,
            });
            return Ok(());
        }

        let requests = self.services.sender.config().warm_up_requests;
        for n in 1..=requests {
            if cancel.is_cancelled() {
                return Err(BenchmarkError::Cancelled);
            }
            let sample = self.services.sender.send(url, Scenario::Warm, n).await;
            debug!(function = %self.target.name, request = n, ok = sample.success, "Warm-up request");
        }
        self.preparation = Some(PreparationMetric::WarmUp { requests });
        Ok(())
    }

    async fn measure(&mut self, url: &str, cancel: &CancelFlag) -> Result<(), BenchmarkError> {
        let services = self.services.clone();
        let config = services.sender.config().clone();
        let action_count = self.target.action_count;
        let mut session = match (&services.agent_client, self.target.variant.has_agent()) {
            (Some(client), true) if action_count > 0 => Some(DebuggingSession::new(
                client.clone(),
                services.agent_config.clone(),
                &self.target.display_name,
            )),
            _ => None,
        };
        let mut action_attached = false;

        let result = async {
            for n in 1..=config.requests_per_case {
                if cancel.is_cancelled() {
                    return Err(BenchmarkError::Cancelled);
                }
                let scenario = match n {
                    1 if self.cold_confirmed => Scenario::ColdStart,
                    _ if action_attached => Scenario::WarmWithAction,
                    _ => Scenario::Warm,
                };
                let sample = services.sender.send(url, scenario, n).await;
                self.samples.push(sample);

                if n == 1
                    && let Some(session) = session.as_mut()
                {
                    match attach_and_bind(&services, session, action_count, url, cancel).await {
                        Ok(()) => action_attached = true,
                        Err(BenchmarkError::Cancelled) => return Err(BenchmarkError::Cancelled),
                        Err(err) => self.record_error(&err),
                    }
                }

                if n < config.requests_per_case
                    && !cancellable_sleep(config.delay_between_requests, cancel).await
                {
                    return Err(BenchmarkError::Cancelled);
                }
            }
            Ok(())
        }
        .await;

        if let Some(session) = session.as_mut() {
            if let Some(hits) = session.hit_count().await {
                debug!(function = %self.target.name, hits, "Action hit count");
            }
            let failed = session.remove_all().await;
            if failed > 0 {
                self.errors
                    .push(format!("{failed} debugging action(s) could not be removed"));
            }
        }
        result?;

        let succeeded = self.samples.iter().filter(|s| s.success).count();
        info!(
            function = %self.target.name,
            requests = self.samples.len(),
            succeeded,
            "Measurement finished"
        );
        if succeeded == 0 {
            return Err(BenchmarkError::Measurement("no successful requests".to_string()));
        }
        Ok(())
    }

    /// Delete everything the deployment created. Runs at most once.
    pub async fn cleanup(&mut self) {
        if self.cleanup_attempted || !self.requires_cleanup() {
            return;
        }
        self.cleanup_attempted = true;

        let Some(outcome) = &self.outcome else {
            return;
        };
        let mut assets = outcome.assets().to_vec();
        let has_build_assets = assets
            .iter()
            .any(|a| !matches!(a, CloudAsset::Function { .. }));
        if outcome.is_success() && !has_build_assets {
            debug!(function = %self.target.name, "No build assets recorded, rediscovering");
            if let Some(found) = self.services.coordinator.discover_assets(&self.target).await {
                assets.extend(found);
            }
        }

        let result = self.services.cleaner.cleanup(&assets).await;
        if !result.is_success() {
            warn!(function = %self.target.name, errors = ?result.errors, "Cleanup incomplete");
        }
        self.cleanup = Some(result);
    }

    pub fn into_result(self) -> CaseResult {
        CaseResult {
            deployment_outcome: self.outcome.unwrap_or_else(|| DeploymentOutcome::Failure {
                error: CANCELLED_BEFORE_DEPLOYMENT.to_string(),
                partial_assets: Vec::new(),
            }),
            target: self.target,
            preparation_metric: self.preparation,
            samples: self.samples,
            errors: self.errors,
            cleanup: self.cleanup,
            finished_at: Utc::now(),
        }
    }

    /// Drive every step sequentially.
    pub async fn run(mut self, cancel: &CancelFlag) -> CaseResult {
        self.deploy(cancel).await;
        self.prepare_and_measure(cancel).await;
        self.cleanup().await;
        self.into_result()
    }
}

/// Attach `count` actions and wait until the agent has bound all of them.
/// Wake-up requests sent while waiting are not recorded as samples.
async fn attach_and_bind(
    services: &CaseServices,
    session: &mut DebuggingSession,
    count: u32,
    url: &str,
    cancel: &CancelFlag,
) -> Result<(), BenchmarkError> {
    session.apply_actions(count, cancel).await?;
    let sender = &services.sender;
    session
        .wait_for_bind(cancel, move || sender.send(url, Scenario::Warm, 0))
        .await?;
    Ok(())
}
