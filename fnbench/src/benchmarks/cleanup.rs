//! Deletion of functions and the build assets they leave behind.
//!
//! Cleanup failures are logged, counted and reported; they never fail a case.

use crate::remote::RemoteCommandExecutor;
use fnbench_common::util::truncate_for_log;
use fnbench_common::{CleanupOutcome, CloudAsset};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Error text meaning the asset is already gone.
const NOT_FOUND_MARKERS: &[&str] = &["not_found", "not found", "does not exist", "404"];

fn is_not_found(text: &str) -> bool {
    let lower = text.to_lowercase();
    NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn delete_argv(asset: &CloudAsset) -> Vec<String> {
    match asset {
        CloudAsset::Function {
            name,
            region,
            project,
        } => vec![
            "gcloud".into(),
            "functions".into(),
            "delete".into(),
            name.clone(),
            format!("--region={region}"),
            format!("--project={project}"),
            "--quiet".into(),
            "--gen2".into(),
        ],
        CloudAsset::SourceArchive { uri } => vec![
            "gcloud".into(),
            "storage".into(),
            "rm".into(),
            uri.clone(),
            "--quiet".into(),
        ],
        CloudAsset::ContainerImage { uri } => vec![
            "gcloud".into(),
            "artifacts".into(),
            "docker".into(),
            "images".into(),
            "delete".into(),
            uri.clone(),
            "--delete-tags".into(),
            "--quiet".into(),
        ],
    }
}

pub struct Cleaner {
    executor: Arc<dyn RemoteCommandExecutor>,
    timeout: Duration,
}

impl Cleaner {
    pub fn new(executor: Arc<dyn RemoteCommandExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    /// Delete `assets`, functions first so their images are no longer in use.
    pub async fn cleanup(&self, assets: &[CloudAsset]) -> CleanupOutcome {
        let mut outcome = CleanupOutcome::default();
        let (functions, others): (Vec<&CloudAsset>, Vec<&CloudAsset>) = assets
            .iter()
            .partition(|a| matches!(a, CloudAsset::Function { .. }));

        for asset in functions {
            let deleted = self.delete(asset, &mut outcome.errors).await;
            outcome.function_deleted = Some(outcome.function_deleted.unwrap_or(true) && deleted);
        }
        for asset in others {
            if self.delete(asset, &mut outcome.errors).await {
                outcome.assets_deleted += 1;
            } else {
                outcome.assets_failed += 1;
            }
        }
        outcome
    }

    async fn delete(&self, asset: &CloudAsset, errors: &mut Vec<String>) -> bool {
        let argv = delete_argv(asset);
        match self.executor.run(&argv, self.timeout).await {
            Ok(output) if output.success() => {
                info!(asset = %asset, "Deleted");
                true
            }
            Ok(output) if is_not_found(&output.error_text()) => {
                info!(asset = %asset, "Already deleted");
                true
            }
            Ok(output) => {
                let error = truncate_for_log(&output.error_text(), 200);
                warn!(asset = %asset, error = %error, "Failed to delete");
                errors.push(format!("{asset}: {error}"));
                false
            }
            Err(err) => {
                warn!(asset = %asset, error = %err, "Failed to delete");
                errors.push(format!("{asset}: {err}"));
                false
            }
        }
    }
}
