//! Shared types and utilities for fnbench.
//!
//! This crate holds everything the benchmark engine and its binary agree on:
//! the target/outcome data model, the layered configuration, and logging setup.

pub mod config;
pub mod logging;
pub mod types;
pub mod util;

pub use config::{
    ActionKind, BenchConfig, ConfigError, ConfigSource, EnvError, EnvParser, LoadedConfig,
    SourceMap, Sourced, VariantSelection,
};
pub use logging::{LogConfig, LogFormat, LoggingError, LoggingGuards, init_logging};
pub use types::{
    CaseResult, CleanupOutcome, CloudAsset, ColdStateReading, DeploymentOutcome,
    DeploymentTarget, InstanceObservation, MeasurementSample, PreparationMetric,
    ResourceSizing, Scenario, Variant,
};
