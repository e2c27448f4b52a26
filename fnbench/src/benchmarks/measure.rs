//! Timed requests against a deployed function.

use crate::remote::{HttpRequest, RemoteCommandExecutor};
use fnbench_common::config::MeasurementConfig;
use fnbench_common::util::truncate_for_log;
use fnbench_common::{MeasurementSample, Scenario};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// What the function reports about its own execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerReport {
    pub duration_ns: Option<u64>,
    pub is_cold_start: Option<bool>,
}

/// Parse the handler's JSON body.
///
/// The duration is `totalDuration` or `handlerRunTime`, in nanoseconds, as a
/// number or a numeric string.
pub fn parse_handler_report(body: &str) -> HandlerReport {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return HandlerReport::default();
    };
    let duration_ns = ["totalDuration", "handlerRunTime"]
        .iter()
        .find_map(|key| numeric(&value[*key]))
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(|d| d as u64);
    HandlerReport {
        duration_ns,
        is_cold_start: value["isColdStart"].as_bool(),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub struct RequestSender {
    executor: Arc<dyn RemoteCommandExecutor>,
    config: MeasurementConfig,
}

impl RequestSender {
    pub fn new(executor: Arc<dyn RemoteCommandExecutor>, config: MeasurementConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &MeasurementConfig {
        &self.config
    }

    /// Send one GET to `url` and time it. Failures become unsuccessful samples.
    pub async fn send(&self, url: &str, scenario: Scenario, request_number: u32) -> MeasurementSample {
        let started = Instant::now();
        let result = self
            .executor
            .run_http(HttpRequest::get(url), self.config.request_timeout)
            .await;
        let duration_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);

        let mut sample = MeasurementSample {
            scenario,
            request_number,
            duration_ns,
            handler_duration_ns: None,
            success: false,
            error: None,
            status_code: None,
            is_cold_start: None,
        };

        match result {
            Ok(response) if response.is_success() => {
                let report = parse_handler_report(&response.body);
                sample.success = true;
                sample.status_code = Some(response.status);
                sample.handler_duration_ns = report.duration_ns;
                sample.is_cold_start = report.is_cold_start;
                debug!(
                    url,
                    %scenario,
                    request_number,
                    latency_ms = duration_ns / 1_000_000,
                    cold = ?report.is_cold_start,
                    "Request succeeded"
                );
            }
            Ok(response) => {
                warn!(url, request_number, status = response.status, "Request failed");
                sample.status_code = Some(response.status);
                sample.error = Some(truncate_for_log(&response.body, 200));
            }
            Err(err) => {
                warn!(url, request_number, error = %err, "Request failed");
                sample.error = Some(err.to_string());
            }
        }
        sample
    }
}
