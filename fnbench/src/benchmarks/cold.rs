//! Cold-state confirmation.
//!
//! The monitoring backend never reports an explicit zero: a scaled-to-zero
//! function simply has no recent data. A single empty reading therefore proves
//! nothing. A function is accepted as cold only after a sustained window of
//! consecutive ambiguous readings; any warm reading restarts the window.
//!
//! ```text
//! POLLING --(consecutive * interval >= window)--> CONFIRMED
//!    |  ^
//!    |  +-- warm reading resets the counter
//!    +--(elapsed > max_poll_duration)-----------> TIMED_OUT
//! ```

use crate::benchmarks::context::{CancelFlag, cancellable_sleep};
use crate::benchmarks::error::BenchmarkError;
use crate::remote::MonitoringSignal;
use fnbench_common::config::ColdConfig;
use fnbench_common::{ColdStateReading, DeploymentTarget, InstanceObservation};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Progress of one confirmation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationState {
    pub consecutive_ambiguous: u32,
    /// When the current run of ambiguous readings began.
    pub window_start: Option<Instant>,
}

impl ConfirmationState {
    /// Fold one reading into the state.
    ///
    /// Only a positive instance count resets. An `Observed` reading with zero
    /// instances counts as ambiguous.
    pub fn record(&mut self, observation: &InstanceObservation, now: Instant) {
        if observation.is_warm() {
            self.consecutive_ambiguous = 0;
            self.window_start = None;
        } else {
            if self.consecutive_ambiguous == 0 {
                self.window_start = Some(now);
            }
            self.consecutive_ambiguous += 1;
        }
    }

    /// Whether the ambiguous run covers the required window.
    pub fn is_confirmed(&self, poll_interval: Duration, required_window: Duration) -> bool {
        self.consecutive_ambiguous > 0
            && poll_interval.saturating_mul(self.consecutive_ambiguous) >= required_window
    }
}

/// Successful confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct ColdConfirmation {
    /// Time from the caller's reference start until confirmation.
    pub time_to_cold: Duration,
    /// Polls issued.
    pub readings: u32,
    pub last_reading: Option<ColdStateReading>,
}

pub struct ColdStateConfirmer {
    signal: Arc<dyn MonitoringSignal>,
    config: ColdConfig,
}

impl ColdStateConfirmer {
    pub fn new(signal: Arc<dyn MonitoringSignal>, config: ColdConfig) -> Self {
        Self { signal, config }
    }

    /// Poll until `target` is confirmed cold, the poll budget runs out, or the
    /// run is cancelled.
    ///
    /// `reference_start` is the instant time-to-cold is measured from, usually
    /// the start of the deployment.
    pub async fn confirm(
        &self,
        target: &DeploymentTarget,
        reference_start: Instant,
        cancel: &CancelFlag,
    ) -> Result<ColdConfirmation, BenchmarkError> {
        let cfg = &self.config;
        info!(
            target = %target.label(),
            interval_secs = cfg.poll_interval.as_secs(),
            window_secs = cfg.required_window.as_secs(),
            "Waiting for cold state"
        );

        if !cfg.initial_wait.is_zero() && !cancellable_sleep(cfg.initial_wait, cancel).await {
            return Err(BenchmarkError::Cancelled);
        }

        let polling_started = Instant::now();
        let mut state = ConfirmationState::default();
        let mut readings = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(BenchmarkError::Cancelled);
            }

            let observation = self
                .signal
                .query_instance_count(target, cfg.lookback)
                .await;
            readings += 1;
            let now = Instant::now();
            state.record(&observation, now);

            debug!(
                target = %target.label(),
                reading = readings,
                consecutive = state.consecutive_ambiguous,
                warm = observation.is_warm(),
                "Cold-state reading"
            );

            if state.is_confirmed(cfg.poll_interval, cfg.required_window) {
                let time_to_cold = now.saturating_duration_since(reference_start);
                info!(
                    target = %target.label(),
                    time_to_cold_secs = time_to_cold.as_secs(),
                    readings,
                    "Cold state confirmed"
                );
                return Ok(ColdConfirmation {
                    time_to_cold,
                    readings,
                    last_reading: Some(ColdStateReading::now(observation)),
                });
            }

            let elapsed = now.saturating_duration_since(polling_started);
            if elapsed > cfg.max_poll_duration {
                warn!(
                    target = %target.label(),
                    elapsed_secs = elapsed.as_secs(),
                    "Cold state not confirmed in time"
                );
                return Err(BenchmarkError::ColdConfirmationTimeout {
                    target: target.label(),
                    elapsed,
                });
            }

            if !cancellable_sleep(cfg.poll_interval, cancel).await {
                return Err(BenchmarkError::Cancelled);
            }
        }
    }
}
