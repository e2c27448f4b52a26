//! Instance-count queries against the cloud monitoring API.
//!
//! The monitoring backend never reports an explicit zero: a cold function and
//! a function whose metrics have not been ingested yet both come back with no
//! time series. Every answer that is not fresh, positive evidence is therefore
//! [`InstanceObservation::Ambiguous`].

use crate::remote::executor::{HttpRequest, RemoteCommandExecutor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnbench_common::{DeploymentTarget, InstanceObservation};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const INSTANCE_COUNT_METRIC: &str = "run.googleapis.com/container/instance_count";
const MONITORING_API: &str = "https://monitoring.googleapis.com/v3";

/// Source of instance-count observations.
#[async_trait]
pub trait MonitoringSignal: Send + Sync {
    async fn query_instance_count(
        &self,
        target: &DeploymentTarget,
        lookback: Duration,
    ) -> InstanceObservation;
}

/// Queries the monitoring REST API with a CLI-issued access token.
pub struct CloudMonitoringSignal {
    executor: Arc<dyn RemoteCommandExecutor>,
    project: String,
    command_timeout: Duration,
    staleness: Duration,
}

impl CloudMonitoringSignal {
    pub fn new(
        executor: Arc<dyn RemoteCommandExecutor>,
        project: impl Into<String>,
        command_timeout: Duration,
        staleness: Duration,
    ) -> Self {
        Self {
            executor,
            project: project.into(),
            command_timeout,
            staleness,
        }
    }

    async fn access_token(&self) -> Option<String> {
        let argv: Vec<String> = ["gcloud", "auth", "print-access-token"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        match self.executor.run(&argv, self.command_timeout).await {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                Some(output.stdout.trim().to_string())
            }
            Ok(output) => {
                debug!(error = %output.error_text(), "Access token request failed");
                None
            }
            Err(e) => {
                debug!(error = %e, "Access token request failed");
                None
            }
        }
    }
}

/// Filter selecting the instance-count series of one function.
pub fn instance_count_filter(target: &DeploymentTarget) -> String {
    format!(
        "metric.type=\"{INSTANCE_COUNT_METRIC}\" AND resource.labels.service_name=\"{}\" AND resource.labels.location=\"{}\"",
        target.name, target.region
    )
}

#[async_trait]
impl MonitoringSignal for CloudMonitoringSignal {
    async fn query_instance_count(
        &self,
        target: &DeploymentTarget,
        lookback: Duration,
    ) -> InstanceObservation {
        let Some(token) = self.access_token().await else {
            return InstanceObservation::Ambiguous;
        };

        let end = Utc::now();
        let start = end - chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::minutes(6));
        let request = HttpRequest::get(format!(
            "{MONITORING_API}/projects/{}/timeSeries",
            self.project
        ))
        .param("filter", instance_count_filter(target))
        .param("interval.startTime", start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .param("interval.endTime", end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .bearer(&token);

        let response = match self.executor.run_http(request, self.command_timeout).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                debug!(function = %target.name, status = response.status, "Monitoring query rejected");
                return InstanceObservation::Ambiguous;
            }
            Err(e) => {
                debug!(function = %target.name, error = %e, "Monitoring query failed");
                return InstanceObservation::Ambiguous;
            }
        };

        match response.json::<TimeSeriesResponse>() {
            Ok(parsed) => interpret_time_series(&parsed, end, self.staleness),
            Err(e) => {
                debug!(function = %target.name, error = %e, "Malformed monitoring response");
                InstanceObservation::Ambiguous
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesResponse {
    #[serde(default)]
    pub time_series: Vec<TimeSeries>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TimeSeries {
    #[serde(default)]
    pub metric: MetricDescriptor,
    #[serde(default)]
    pub points: Vec<Point>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricDescriptor {
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub interval: PointInterval,
    #[serde(default)]
    pub value: PointValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointInterval {
    pub end_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointValue {
    /// The API encodes 64-bit integers as strings.
    pub int64_value: Option<serde_json::Value>,
}

impl PointValue {
    fn count(&self) -> Option<u64> {
        match self.int64_value.as_ref()? {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }
}

/// Sum the latest fresh point of every series.
///
/// Returns `Observed` only when at least one fresh point reports a positive
/// count; everything else is ambiguous.
pub fn interpret_time_series(
    response: &TimeSeriesResponse,
    now: DateTime<Utc>,
    staleness: Duration,
) -> InstanceObservation {
    let max_age = chrono::Duration::from_std(staleness).unwrap_or(chrono::Duration::minutes(6));
    let mut total = 0u64;
    let mut states = Vec::new();

    for series in &response.time_series {
        let state = series
            .metric
            .labels
            .get("state")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let parsed_time = |p: &Point| {
            p.interval
                .end_time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        let Some(latest) = series.points.iter().max_by_key(|p| parsed_time(p)) else {
            continue;
        };

        // An unparseable timestamp is trusted as recent.
        let fresh = parsed_time(latest).is_none_or(|t| now - t <= max_age);
        if !fresh {
            continue;
        }

        if let Some(count) = latest.value.count() {
            if state != "active" && state != "idle" {
                warn!(state = %state, "Unexpected instance state in monitoring data");
            }
            if count > 0 {
                total += count;
                states.push(state);
            }
        }
    }

    if total > 0 {
        InstanceObservation::Observed {
            count: total,
            state: states.join(","),
        }
    } else {
        InstanceObservation::Ambiguous
    }
}
