//! Configuration layering as the `run` and `check-config` commands see it.

mod common;

use common::init_test_logging;
use fnbench_common::{BenchConfig, ConfigError, ConfigSource, Variant, VariantSelection};
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const VARS: &[&str] = &[
    "FNBENCH_PROJECT",
    "FNBENCH_WORKERS",
    "FNBENCH_COLD_WINDOW",
    "FNBENCH_AGENT_SECRET",
];

#[allow(unsafe_code)]
fn set_env(key: &str, value: &str) {
    // SAFETY: every test touching the environment is #[serial]
    unsafe { std::env::set_var(key, value) };
}

#[allow(unsafe_code)]
fn clear_env() {
    for key in VARS {
        // SAFETY: every test touching the environment is #[serial]
        unsafe { std::env::remove_var(key) };
    }
}

fn config_file(body: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    init_test_logging();
    clear_env();
    let file = config_file(
        r#"
[deployment]
project = "from-file"
source_dir = "/srv/fn"

[run]
functions_per_variant = 4
regions = ["us-east1"]

[cold]
poll_interval = "10s"
required_window = "40s"
"#,
    );
    set_env("FNBENCH_PROJECT", "from-env");

    let loaded = BenchConfig::load(Some(file.path())).unwrap();
    clear_env();

    assert_eq!(loaded.config.deployment.project, "from-env");
    assert_eq!(
        loaded.sources.source_of("deployment.project"),
        ConfigSource::Environment
    );
    assert_eq!(loaded.config.run.functions_per_variant, 4);
    assert!(matches!(
        loaded.sources.source_of("run.functions_per_variant"),
        ConfigSource::File { .. }
    ));
    assert_eq!(loaded.config.cold.poll_interval, Duration::from_secs(10));
    assert_eq!(loaded.config.cold.required_window, Duration::from_secs(40));
    assert_eq!(loaded.sources.source_of("retry.max_attempts"), ConfigSource::Default);
}

#[test]
#[serial]
fn test_invalid_environment_values_reported_together() {
    init_test_logging();
    clear_env();
    set_env("FNBENCH_WORKERS", "zero");
    set_env("FNBENCH_COLD_WINDOW", "forever");

    let err = BenchConfig::load(None).unwrap_err();
    clear_env();

    match err {
        ConfigError::Env(errors) => assert_eq!(errors.len(), 2),
        other => panic!("expected collected env errors, got {other}"),
    }
}

#[test]
#[serial]
fn test_instrumented_run_requires_agent_secret() {
    init_test_logging();
    clear_env();
    let file = config_file(
        r#"
[deployment]
project = "p"
source_dir = "/srv/fn"
"#,
    );

    let mut loaded = BenchConfig::load(Some(file.path())).unwrap();
    let err = loaded.config.validate().unwrap_err();
    assert!(matches!(err, ConfigError::Missing { key: "agent.secret", .. }));

    loaded.config.run.variants = VariantSelection::Plain;
    assert!(!loaded.config.run.variants.includes(Variant::Instrumented));
    loaded.config.validate().unwrap();
}

#[test]
#[serial]
fn test_describe_masks_secrets() {
    init_test_logging();
    clear_env();
    set_env("FNBENCH_AGENT_SECRET", "supersecretvalue123");

    let loaded = BenchConfig::load(None).unwrap();
    clear_env();

    assert_eq!(
        loaded.sources.source_of("agent.secret"),
        ConfigSource::Environment
    );
    let described = loaded.config.describe();
    let (_, secret) = described
        .iter()
        .find(|(key, _)| *key == "agent.secret")
        .unwrap();
    assert_ne!(secret, "supersecretvalue123");
    assert!(!secret.contains("supersecretvalue123"));
}
