//! End-to-end variant runs against scripted collaborators.

mod common;

use common::{bench_config, init_test_logging};
use fnbench::benchmarks::deploy::CANCELLED_BEFORE_DEPLOYMENT;
use fnbench::benchmarks::{BenchmarkOrchestrator, ComparisonReport, ResultStore, RunContext};
use fnbench::mock::{MockAgentClient, MockExecutor, ScriptedSignal, function_name_of, has_arg, warm};
use fnbench::remote::{
    AgentActionClient, CommandOutput, HttpRequest, HttpResponse, RemoteError,
};
use fnbench_common::{
    BenchConfig, InstanceObservation, PreparationMetric, Scenario, Variant,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;
use tracing::info;

fn is_deploy_of(argv: &[String], function: &str) -> bool {
    has_arg(argv, "deploy") && function_name_of(argv) == Some(function)
}

fn orchestrator(
    variant: Variant,
    config: BenchConfig,
    executor: Arc<MockExecutor>,
    signal: Arc<ScriptedSignal>,
    agent: Option<Arc<MockAgentClient>>,
) -> BenchmarkOrchestrator {
    BenchmarkOrchestrator::new(
        variant,
        Arc::new(config),
        executor,
        signal,
        agent.map(|a| a as Arc<dyn AgentActionClient>),
    )
}

#[tokio::test(start_paused = true)]
async fn test_three_targets_cold_failure_and_transient_retry() {
    init_test_logging();
    info!("TEST START: test_three_targets_cold_failure_and_transient_retry");

    let executor = Arc::new(MockExecutor::new().with_gcloud_defaults());
    executor.on_command(
        |argv| is_deploy_of(argv, "fnbench-plain-001"),
        |_| Ok(CommandOutput::failed(1, "PERMISSION_DENIED: caller lacks cloudfunctions.create")),
    );
    executor.on_command(
        |argv| has_arg(argv, "describe") && function_name_of(argv) == Some("fnbench-plain-001"),
        |_| Ok(CommandOutput::failed(1, "NOT_FOUND")),
    );
    let flaky_attempts = Arc::new(AtomicU32::new(0));
    {
        let attempts = flaky_attempts.clone();
        executor.on_command(
            |argv| is_deploy_of(argv, "fnbench-plain-002"),
            move |_| {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(CommandOutput::failed(1, "503 Service Unavailable"))
                } else {
                    Ok(CommandOutput::ok(""))
                }
            },
        );
    }
    // One warm reading, then four ambiguous ones: cold after 60s of polling.
    let signal = Arc::new(
        ScriptedSignal::always(InstanceObservation::Ambiguous).with_script(
            "fnbench-plain-000",
            [
                warm(1),
                InstanceObservation::Ambiguous,
                InstanceObservation::Ambiguous,
                InstanceObservation::Ambiguous,
                InstanceObservation::Ambiguous,
            ],
        ),
    );

    let mut config = bench_config(3);
    config.run.workers = Some(3);
    let run = orchestrator(Variant::Plain, config, executor.clone(), signal.clone(), None)
        .run(&RunContext::new())
        .await
        .unwrap();

    assert_eq!(run.results.len(), 3);
    let [cold, denied, flaky] = &run.results[..] else {
        panic!("expected three results");
    };

    assert!(cold.deployment_outcome.is_success());
    match cold.preparation_metric {
        Some(PreparationMetric::TimeToCold { seconds, readings }) => {
            assert_eq!(readings, 5);
            assert!(seconds >= 60.0, "time to cold {seconds}");
        }
        ref other => panic!("unexpected preparation metric {other:?}"),
    }
    assert_eq!(cold.samples.len(), 3);
    assert_eq!(cold.samples[0].scenario, Scenario::ColdStart);
    assert!(cold.samples[1..].iter().all(|s| s.scenario == Scenario::Warm));

    assert!(!denied.deployment_outcome.is_success());
    assert!(denied.samples.is_empty());
    assert!(denied.cleanup.is_none());
    assert_eq!(executor.commands_with("deploy").iter().filter(|a| is_deploy_of(a, "fnbench-plain-001")).count(), 1);

    assert!(flaky.deployment_outcome.is_success());
    assert_eq!(flaky_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(flaky.samples.len(), 3);

    let mut deleted = executor.deleted_functions();
    deleted.sort();
    assert_eq!(deleted, vec!["fnbench-plain-000", "fnbench-plain-002"]);
    assert_eq!(run.cleanup.deleted, 2);
    assert_eq!(run.cleanup.failed, 0);
    assert_eq!(run.successful(), 2);

    // Build assets of both deployed functions go too.
    assert_eq!(executor.commands_with("rm").len(), 2);

    info!("TEST PASS: test_three_targets_cold_failure_and_transient_retry");
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_survives_sibling_error_and_panic() {
    init_test_logging();
    info!("TEST START: test_cleanup_survives_sibling_error_and_panic");

    let executor = Arc::new(MockExecutor::new().with_gcloud_defaults());
    executor.on_http(
        |req| req.url.contains("fnbench-plain-001"),
        |_: &HttpRequest| -> Result<HttpResponse, RemoteError> {
            panic!("function handler crashed")
        },
    );
    executor.on_http(
        |req| req.url.contains("fnbench-plain-002"),
        |_| {
            Ok(HttpResponse {
                status: 503,
                body: "unavailable".to_string(),
            })
        },
    );
    let signal = Arc::new(ScriptedSignal::always(InstanceObservation::Ambiguous));

    let mut config = bench_config(3);
    config.run.require_cold = false;
    let run = orchestrator(Variant::Plain, config, executor.clone(), signal, None)
        .run(&RunContext::new())
        .await
        .unwrap();

    assert_eq!(run.results.len(), 3);
    assert!(run.results[0].errors.is_empty(), "{:?}", run.results[0].errors);
    assert!(run.results[1].errors.iter().any(|e| e.contains("panicked")));
    assert!(!run.results[2].errors.is_empty());

    let mut deleted = executor.deleted_functions();
    deleted.sort();
    assert_eq!(
        deleted,
        vec!["fnbench-plain-000", "fnbench-plain-001", "fnbench-plain-002"]
    );
    for result in &run.results {
        assert!(result.cleanup.as_ref().is_some_and(|c| c.is_success()));
    }
    assert_eq!(run.cleanup.deleted, 3);

    info!("TEST PASS: test_cleanup_survives_sibling_error_and_panic");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start_deploys_nothing() {
    init_test_logging();
    let executor = Arc::new(MockExecutor::new().with_gcloud_defaults());
    let ctx = RunContext::new();
    ctx.cancel.cancel();

    let run = orchestrator(
        Variant::Plain,
        bench_config(2),
        executor.clone(),
        Arc::new(ScriptedSignal::always(InstanceObservation::Ambiguous)),
        None,
    )
    .run(&ctx)
    .await
    .unwrap();

    assert_eq!(run.results.len(), 2);
    for result in &run.results {
        assert_eq!(result.deployment_outcome.error(), Some(CANCELLED_BEFORE_DEPLOYMENT));
    }
    assert!(executor.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_deploy_still_cleans_up() {
    init_test_logging();
    let executor = Arc::new(MockExecutor::new().with_gcloud_defaults());
    let ctx = RunContext::new();
    {
        let cancel = ctx.cancel.clone();
        executor.on_command(
            |argv| has_arg(argv, "deploy"),
            move |_| {
                cancel.cancel();
                Ok(CommandOutput::ok(""))
            },
        );
    }

    let mut config = bench_config(3);
    config.run.workers = Some(1);
    let run = orchestrator(
        Variant::Plain,
        config,
        executor.clone(),
        Arc::new(ScriptedSignal::always(InstanceObservation::Ambiguous)),
        None,
    )
    .run(&ctx)
    .await
    .unwrap();

    let deployed: Vec<_> = run
        .results
        .iter()
        .filter(|r| r.deployment_outcome.is_success())
        .collect();
    assert_eq!(deployed.len(), 1);
    assert!(deployed[0].samples.is_empty());
    assert_eq!(executor.deleted_functions(), vec![deployed[0].target.name.clone()]);
    assert_eq!(
        run.results
            .iter()
            .filter(|r| r.deployment_outcome.error() == Some(CANCELLED_BEFORE_DEPLOYMENT))
            .count(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_both_variants_persist_and_compare() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let store = ResultStore::new(dir.path());

    let mut config = bench_config(2);
    config.run.require_cold = false;
    config.agent.secret = Some("s3cr3t".to_string());

    let executor = Arc::new(MockExecutor::new().with_gcloud_defaults());
    let signal = Arc::new(ScriptedSignal::always(InstanceObservation::Ambiguous));
    let agent = Arc::new(MockAgentClient::new());

    let instrumented = orchestrator(
        Variant::Instrumented,
        config.clone(),
        executor.clone(),
        signal.clone(),
        Some(agent.clone()),
    )
    .run(&RunContext::new())
    .await
    .unwrap();
    let plain = orchestrator(Variant::Plain, config, executor.clone(), signal, None)
        .run(&RunContext::new())
        .await
        .unwrap();

    assert_eq!(agent.added().len(), 2);
    // The action is attached after the first request.
    for result in &instrumented.results {
        let scenarios: Vec<_> = result.samples.iter().map(|s| s.scenario).collect();
        assert_eq!(
            scenarios,
            vec![Scenario::Warm, Scenario::WarmWithAction, Scenario::WarmWithAction]
        );
    }

    let instrumented_path = store.save_run(&instrumented).unwrap();
    let plain_path = store.save_run(&plain).unwrap();
    let reloaded = ComparisonReport::build(
        &ResultStore::load_run(&instrumented_path).unwrap(),
        &ResultStore::load_run(&plain_path).unwrap(),
    );
    assert_eq!(reloaded.instrumented.functions, 2);
    assert_eq!(reloaded.plain.successful_requests, 6);

    let (_, text) = store.save_report(&reloaded).unwrap();
    let rendered = std::fs::read_to_string(text).unwrap();
    assert!(rendered.contains("With Agent"));
    assert!(!std::fs::read_to_string(instrumented_path).unwrap().contains("s3cr3t"));
}
