//! Phase-by-phase orchestration of one variant run.
//!
//! ```text
//! create ──► deploy ──► prepare + measure ──► cleanup ──► pool shutdown
//!             │ registers deployed assets
//!             ▼
//!          RunState (region counts, cleanup registry)
//! ```
//!
//! Every phase runs on the same bounded [`WorkerPool`] and completes before
//! the next starts. A panicking task takes down only its own case: the case is
//! rebuilt from its target and registered deployment, then cleaned up.

use crate::benchmarks::case::{BenchmarkCase, CaseServices};
use crate::benchmarks::cleanup::Cleaner;
use crate::benchmarks::cold::ColdStateConfirmer;
use crate::benchmarks::context::RunContext;
use crate::benchmarks::deploy::DeploymentCoordinator;
use crate::benchmarks::error::BenchmarkError;
use crate::benchmarks::measure::RequestSender;
use crate::benchmarks::region::RegionAllocator;
use crate::benchmarks::retry::RetryPolicy;
use crate::remote::{AgentActionClient, MonitoringSignal, RemoteCommandExecutor};
use chrono::{DateTime, Utc};
use fnbench_common::{BenchConfig, CaseResult, DeploymentOutcome, DeploymentTarget, Variant};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, error, info, warn};

/// Bounded pool of tasks sharing one semaphore.
pub struct WorkerPool<T> {
    permits: Arc<Semaphore>,
    tasks: JoinSet<T>,
    workers: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            tasks: JoinSet::new(),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue `job`; it starts once a permit is free.
    pub fn submit<F>(&mut self, job: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            job.await
        });
    }

    /// Wait for every queued job, in completion order.
    pub async fn drain(&mut self) -> (Vec<T>, Vec<JoinError>) {
        let mut done = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(value) => done.push(value),
                Err(err) => failed.push(err),
            }
        }
        (done, failed)
    }

    /// Abort anything still queued and close the pool.
    pub async fn shutdown(mut self) {
        self.permits.close();
        self.tasks.shutdown().await;
    }
}

/// Shared mutable state of a run: region counts and the cleanup registry.
pub struct RunState {
    inner: Mutex<RunStateInner>,
}

struct RunStateInner {
    allocator: RegionAllocator,
    registry: BTreeMap<usize, DeploymentOutcome>,
}

impl RunState {
    pub fn new(allocator: RegionAllocator) -> Self {
        Self {
            inner: Mutex::new(RunStateInner {
                allocator,
                registry: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunStateInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn allocate_region(&self) -> Option<String> {
        self.lock().allocator.allocate()
    }

    /// Register a deployment for cleanup when it left anything behind.
    pub fn register(&self, target: &DeploymentTarget, outcome: &DeploymentOutcome) {
        if outcome.requires_cleanup() {
            self.lock().registry.insert(target.index, outcome.clone());
        }
    }

    pub fn registered(&self, index: usize) -> Option<DeploymentOutcome> {
        self.lock().registry.get(&index).cloned()
    }

    pub fn registered_indices(&self) -> BTreeSet<usize> {
        self.lock().registry.keys().copied().collect()
    }
}

/// Deleted/failed counts of the cleanup phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupTally {
    pub deleted: u32,
    pub failed: u32,
}

/// Everything one variant run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRun {
    pub variant: Variant,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cleanup: CleanupTally,
    pub results: Vec<CaseResult>,
}

impl VariantRun {
    pub fn successful(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.deployment_outcome.is_success())
            .count()
    }
}

pub struct BenchmarkOrchestrator {
    variant: Variant,
    config: Arc<BenchConfig>,
    services: Arc<CaseServices>,
    state: Arc<RunState>,
}

impl BenchmarkOrchestrator {
    pub fn new(
        variant: Variant,
        config: Arc<BenchConfig>,
        executor: Arc<dyn RemoteCommandExecutor>,
        signal: Arc<dyn MonitoringSignal>,
        agent_client: Option<Arc<dyn AgentActionClient>>,
    ) -> Self {
        let services = Arc::new(CaseServices {
            coordinator: DeploymentCoordinator::new(
                executor.clone(),
                config.deployment.clone(),
                RetryPolicy::from_config(&config.retry),
            ),
            confirmer: ColdStateConfirmer::new(signal, config.cold.clone()),
            sender: RequestSender::new(executor.clone(), config.measurement.clone()),
            cleaner: Cleaner::new(executor, config.deployment.command_timeout),
            agent_client,
            agent_config: config.agent.clone(),
            require_cold: config.run.require_cold,
        });
        let state = Arc::new(RunState::new(RegionAllocator::ranked(
            config.run.regions.clone(),
            &config.run.carbon_intensity,
            config.run.max_per_region,
        )));
        Self {
            variant,
            config,
            services,
            state,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Build the targets of this variant.
    pub fn create_targets(&self) -> Result<Vec<DeploymentTarget>, BenchmarkError> {
        let deployment = &self.config.deployment;
        let source_dir = deployment.source_dir.clone().unwrap_or_default();
        (0..self.config.run.functions_per_variant)
            .map(|index| {
                let region = self.state.allocate_region().ok_or_else(|| {
                    BenchmarkError::DeploymentFailed("no regions configured".to_string())
                })?;
                let name = DeploymentTarget::function_name(&deployment.base_name, self.variant, index);
                let display_name = format!("{name}-{region}");

                let mut env_vars = BTreeMap::new();
                env_vars.insert("DISPLAY_NAME".to_string(), display_name.clone());
                if self.variant.has_agent() {
                    if let Some(secret) = &self.config.agent.secret {
                        env_vars.insert("AGENT_SECRET".to_string(), secret.clone());
                    }
                    env_vars.insert(
                        "AGENT_SERVER_HOST".to_string(),
                        self.config.agent.server_host.clone(),
                    );
                }
                let labels = BTreeMap::from([
                    ("benchmark".to_string(), deployment.base_name.clone()),
                    ("variant".to_string(), self.variant.slug().to_string()),
                ]);

                Ok(DeploymentTarget {
                    name,
                    display_name,
                    index,
                    region,
                    runtime: deployment.runtime.clone(),
                    entry_point: deployment.entry_point.clone(),
                    source_dir: source_dir.clone(),
                    project: deployment.project.clone(),
                    variant: self.variant,
                    sizing: deployment.sizing.clone(),
                    env_vars,
                    labels,
                    action_count: if self.variant.has_agent() {
                        self.config.agent.action_count_for(index)
                    } else {
                        0
                    },
                })
            })
            .collect()
    }

    /// Run every phase for this variant.
    pub async fn run(&self, ctx: &RunContext) -> Result<VariantRun, BenchmarkError> {
        let started_at = Utc::now();
        let targets = self.create_targets()?;
        let mut pool: WorkerPool<(usize, BenchmarkCase)> =
            WorkerPool::new(self.config.run.effective_workers());
        info!(
            variant = %self.variant,
            targets = targets.len(),
            workers = pool.workers(),
            "Starting variant run"
        );

        // Deploy.
        let mut not_submitted = Vec::new();
        let mut submitted = Vec::new();
        for target in &targets {
            let case = BenchmarkCase::new(target.clone(), self.services.clone());
            if ctx.is_cancelled() {
                not_submitted.push(case);
                continue;
            }
            let state = self.state.clone();
            let cancel = ctx.cancel.clone();
            let span = case.span();
            submitted.push(target.index);
            pool.submit(
                async move {
                    let mut case = case;
                    case.deploy(&cancel).await;
                    if let Some(outcome) = case.outcome() {
                        state.register(case.target(), outcome);
                    }
                    (case.target().index, case)
                }
                .instrument(span),
            );
        }
        let mut cases = self.collect(&mut pool, &submitted, &targets, "deploy").await;
        let deployed = cases.values().filter(|c| c.is_deployed()).count();
        info!(variant = %self.variant, deployed, total = targets.len(), "Deploy phase finished");

        // Prepare and measure.
        let mut idle = Vec::new();
        submitted.clear();
        for (index, case) in std::mem::take(&mut cases) {
            if !case.is_deployed() || ctx.is_cancelled() {
                idle.push(case);
                continue;
            }
            let cancel = ctx.cancel.clone();
            let span = case.span();
            submitted.push(index);
            pool.submit(
                async move {
                    let mut case = case;
                    case.prepare_and_measure(&cancel).await;
                    (case.target().index, case)
                }
                .instrument(span),
            );
        }
        cases = self.collect(&mut pool, &submitted, &targets, "measure").await;
        for case in idle {
            cases.insert(case.target().index, case);
        }
        if ctx.is_cancelled() {
            warn!(variant = %self.variant, "Run cancelled, proceeding to cleanup");
        }

        // Cleanup, regardless of cancellation.
        let registered = self.state.registered_indices();
        let mut tally = CleanupTally::default();
        if self.config.run.clean_after_run {
            let mut kept = Vec::new();
            submitted.clear();
            for (index, case) in std::mem::take(&mut cases) {
                if !registered.contains(&index) {
                    kept.push(case);
                    continue;
                }
                let span = case.span();
                submitted.push(index);
                pool.submit(
                    async move {
                        let mut case = case;
                        case.cleanup().await;
                        (case.target().index, case)
                    }
                    .instrument(span),
                );
            }
            cases = self.collect(&mut pool, &submitted, &targets, "cleanup").await;
            for case in kept {
                cases.insert(case.target().index, case);
            }

            for index in &registered {
                match cases.get(index).and_then(BenchmarkCase::cleanup_outcome) {
                    Some(outcome) if outcome.is_success() => tally.deleted += 1,
                    _ => tally.failed += 1,
                }
            }
            info!(
                variant = %self.variant,
                deleted = tally.deleted,
                failed = tally.failed,
                "Cleanup phase finished"
            );
        } else {
            warn!(
                variant = %self.variant,
                functions = registered.len(),
                "Cleanup disabled, deployed functions left running"
            );
        }

        pool.shutdown().await;

        for case in not_submitted {
            cases.insert(case.target().index, case);
        }
        let results = cases.into_values().map(BenchmarkCase::into_result).collect();
        Ok(VariantRun {
            variant: self.variant,
            started_at,
            finished_at: Utc::now(),
            cleanup: tally,
            results,
        })
    }

    /// Drain one phase. Cases whose task panicked are rebuilt from their
    /// target and registered deployment so they still report and clean up.
    async fn collect(
        &self,
        pool: &mut WorkerPool<(usize, BenchmarkCase)>,
        submitted: &[usize],
        targets: &[DeploymentTarget],
        phase: &str,
    ) -> BTreeMap<usize, BenchmarkCase> {
        let (done, failed) = pool.drain().await;
        let mut cases: BTreeMap<usize, BenchmarkCase> = done.into_iter().collect();
        if failed.is_empty() {
            return cases;
        }

        let reason = failed
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        error!(variant = %self.variant, phase, panics = failed.len(), reason = %reason, "Case tasks failed");

        for index in submitted {
            if cases.contains_key(index) {
                continue;
            }
            let Some(target) = targets.iter().find(|t| t.index == *index) else {
                continue;
            };
            let case = BenchmarkCase::recovered(
                target.clone(),
                self.services.clone(),
                self.state.registered(*index),
                BenchmarkError::TaskPanicked(format!("{phase} step: {reason}")),
            );
            cases.insert(*index, case);
        }
        cases
    }
}
