//! Configuration system for fnbench.
//!
//! - Typed `FNBENCH_*` environment parsing with collected errors
//! - TOML file loading
//! - Per-value source tracking for `check-config`
//! - Validation before a run starts

pub mod bench;
pub mod env;
pub mod source;

pub use bench::{
    ActionKind, AgentConfig, BenchConfig, ColdConfig, ConfigError, DeploymentConfig,
    LoadedConfig, MeasurementConfig, RetryConfig, RunConfig, VariantSelection,
};
pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, SourceMap, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
