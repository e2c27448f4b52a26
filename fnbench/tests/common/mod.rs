#![allow(dead_code)]

use fnbench_common::BenchConfig;
use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .json(),
            )
            .with(filter)
            .init();
    });
}

/// Valid single-region configuration with fast cold confirmation (15s/60s).
pub fn bench_config(functions: usize) -> BenchConfig {
    let mut config = BenchConfig::default();
    config.deployment.project = "proj".to_string();
    config.deployment.source_dir = Some(PathBuf::from("/tmp/fnbench-src"));
    config.run.functions_per_variant = functions;
    config.run.regions = vec!["europe-north1".to_string()];
    config.cold.poll_interval = Duration::from_secs(15);
    config.cold.required_window = Duration::from_secs(60);
    config.cold.max_poll_duration = Duration::from_secs(600);
    config.measurement.requests_per_case = 3;
    config.measurement.delay_between_requests = Duration::from_secs(1);
    config
}
