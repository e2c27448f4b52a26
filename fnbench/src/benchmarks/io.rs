//! On-disk results: one JSON file per case, one aggregate per variant run and
//! the comparison report. Files are flat, unversioned and overwritten per run.

use crate::benchmarks::orchestrator::VariantRun;
use crate::benchmarks::report::ComparisonReport;
use chrono::{DateTime, Utc};
use fnbench_common::{
    CaseResult, CleanupOutcome, DeploymentOutcome, DeploymentTarget, MeasurementSample,
    PreparationMetric,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-case file layout.
#[derive(Serialize)]
struct CaseRecord<'a> {
    target: &'a DeploymentTarget,
    deployment_outcome: &'a DeploymentOutcome,
    preparation_metric: &'a Option<PreparationMetric>,
    samples: &'a [MeasurementSample],
    errors: &'a [String],
    cleanup: &'a Option<CleanupOutcome>,
    timestamp: DateTime<Utc>,
}

impl<'a> From<&'a CaseResult> for CaseRecord<'a> {
    fn from(result: &'a CaseResult) -> Self {
        Self {
            target: &result.target,
            deployment_outcome: &result.deployment_outcome,
            preparation_metric: &result.preparation_metric,
            samples: &result.samples,
            errors: &result.errors,
            cleanup: &result.cleanup,
            timestamp: result.finished_at,
        }
    }
}

pub const REPORT_JSON: &str = "comparison_report.json";
pub const REPORT_TEXT: &str = "comparison_report.txt";

pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_dir(path: &Path) -> Result<(), PersistError> {
        fs::create_dir_all(path).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
        let body = serde_json::to_string_pretty(value).map_err(|source| PersistError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, body).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Wrote results file");
        Ok(())
    }

    pub fn case_path(&self, result: &CaseResult) -> PathBuf {
        self.root
            .join(result.target.variant.to_string())
            .join(format!("{}.json", result.target.name))
    }

    pub fn run_path(&self, run: &VariantRun) -> PathBuf {
        self.root.join(format!("{}_results.json", run.variant))
    }

    pub fn save_case(&self, result: &CaseResult) -> Result<PathBuf, PersistError> {
        let path = self.case_path(result);
        if let Some(parent) = path.parent() {
            Self::ensure_dir(parent)?;
        }
        Self::write_json(&path, &CaseRecord::from(result))?;
        Ok(path)
    }

    /// Write every case file and the run aggregate.
    pub fn save_run(&self, run: &VariantRun) -> Result<PathBuf, PersistError> {
        Self::ensure_dir(&self.root)?;
        for result in &run.results {
            self.save_case(result)?;
        }
        let path = self.run_path(run);
        Self::write_json(&path, run)?;
        info!(variant = %run.variant, path = %path.display(), cases = run.results.len(), "Saved run results");
        Ok(path)
    }

    /// Save every run, continuing past failures. Returns the errors.
    pub fn save_runs(&self, runs: &[VariantRun]) -> Vec<PersistError> {
        runs.iter()
            .filter_map(|run| match self.save_run(run) {
                Ok(_) => None,
                Err(e) => {
                    error!(variant = %run.variant, error = %e, "Failed to save run results");
                    Some(e)
                }
            })
            .collect()
    }

    pub fn load_run(path: &Path) -> Result<VariantRun, PersistError> {
        let body = fs::read_to_string(path).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&body).map_err(|source| PersistError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the report as JSON and as text; returns both paths.
    pub fn save_report(&self, report: &ComparisonReport) -> Result<(PathBuf, PathBuf), PersistError> {
        Self::ensure_dir(&self.root)?;
        let json = self.root.join(REPORT_JSON);
        Self::write_json(&json, report)?;
        let text = self.root.join(REPORT_TEXT);
        fs::write(&text, report.render_text()).map_err(|source| PersistError::Io {
            path: text.clone(),
            source,
        })?;
        info!(path = %text.display(), "Saved comparison report");
        Ok((json, text))
    }
}
