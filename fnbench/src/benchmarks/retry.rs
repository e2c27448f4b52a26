//! Retry policy for remote deployments.
//!
//! Transient failures (rate limits, 5xx, backend hiccups) are retried after a
//! jittered wait drawn from a normal distribution around a per-attempt mean.
//! Draws below the floor are redrawn rather than clamped, so the waits keep
//! their spread instead of piling up at the floor.

use crate::benchmarks::context::{CancelFlag, cancellable_sleep};
use fnbench_common::config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lowercase substrings that mark an error as transient.
pub const TRANSIENT_MARKERS: &[&str] = &[
    "429",
    "quota exceeded",
    "too many requests",
    "500",
    "502",
    "503",
    "504",
    "operationerror",
    "internal",
    "server error",
    "unavailable",
    "failed to initialize",
];

/// Redraws before giving up on the distribution and using the mean.
const MAX_REDRAWS: u32 = 1000;

/// Errors that can be retried.
pub trait RetryableError {
    /// Whether this error may succeed on another attempt.
    fn is_retryable(&self) -> bool;
}

/// Case-insensitive check against [`TRANSIENT_MARKERS`].
///
/// Numeric markers only count as a standalone status code, so a resource
/// name such as `fnbench-plain-503` does not look like a server error.
pub fn is_transient_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| {
        if m.bytes().all(|b| b.is_ascii_digit()) {
            contains_status_code(&lower, m)
        } else {
            lower.contains(m)
        }
    })
}

fn contains_status_code(text: &str, code: &str) -> bool {
    let bytes = text.as_bytes();
    text.match_indices(code).any(|(start, _)| {
        let end = start + code.len();
        let before_ok = start == 0 || {
            let b = bytes[start - 1];
            !(b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
        };
        let after_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        before_ok && after_ok
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { wait: Duration },
    GiveUp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Mean wait after attempt `i`; the last entry covers later attempts.
    pub backoff_means: Vec<Duration>,
    pub stddev: Duration,
    /// No wait is ever shorter than this.
    pub floor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_means: config.backoff_means.clone(),
            stddev: config.backoff_stddev,
            floor: config.min_wait,
        }
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    fn mean_for(&self, attempt_index: u32) -> Duration {
        let idx = (attempt_index as usize).min(self.backoff_means.len().saturating_sub(1));
        self.backoff_means.get(idx).copied().unwrap_or(self.floor)
    }

    /// Decide what to do after attempt `attempt_index` (0-based) failed with `error_text`.
    pub fn decide(&self, attempt_index: u32, error_text: &str, rng: &mut fastrand::Rng) -> RetryDecision {
        if !is_transient_error(error_text) {
            return RetryDecision::GiveUp;
        }
        self.decide_transient(attempt_index, rng)
    }

    /// Decision for an error already known to be transient.
    pub fn decide_transient(&self, attempt_index: u32, rng: &mut fastrand::Rng) -> RetryDecision {
        if attempt_index + 1 >= self.max_attempts() {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            wait: self.draw_wait(attempt_index, rng),
        }
    }

    /// Draw a wait from N(mean, stddev), redrawing anything below the floor.
    pub fn draw_wait(&self, attempt_index: u32, rng: &mut fastrand::Rng) -> Duration {
        let mean = self.mean_for(attempt_index).as_secs_f64();
        let sd = self.stddev.as_secs_f64();
        let floor = self.floor.as_secs_f64();

        for _ in 0..MAX_REDRAWS {
            let draw = mean + sd * standard_normal(rng);
            if draw.is_finite() && draw >= floor {
                return Duration::from_secs_f64(draw);
            }
        }
        Duration::from_secs_f64(mean.max(floor))
    }
}

/// Box-Muller transform over two uniform draws.
fn standard_normal(rng: &mut fastrand::Rng) -> f64 {
    // f64() is in [0, 1); shift away from zero for the log.
    let u1 = 1.0 - rng.f64();
    let u2 = rng.f64();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Run an async operation, retrying while the policy allows.
///
/// Stops early, returning the last error, when `cancel` is set.
pub async fn run_with_retry<F, Fut, T, E>(
    phase: &str,
    policy: &RetryPolicy,
    rng: &mut fastrand::Rng,
    cancel: &CancelFlag,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempt: u32 = 0;

    loop {
        debug!(phase, attempt, max_attempts, "Starting attempt");

        match op(attempt).await {
            Ok(value) => {
                info!(phase, attempt, "Attempt succeeded");
                return Ok(value);
            }
            Err(err) if err.is_retryable() => match policy.decide_transient(attempt, rng) {
                RetryDecision::Retry { wait } => {
                    warn!(phase, attempt, error = %err, "Attempt failed (retryable)");
                    debug!(
                        phase,
                        attempt,
                        delay_secs = wait.as_secs_f64(),
                        "Retrying after backoff"
                    );
                    if !cancellable_sleep(wait, cancel).await {
                        warn!(phase, attempt, "Cancelled during backoff");
                        return Err(err);
                    }
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    warn!(phase, attempt, error = %err, "Attempts exhausted");
                    return Err(err);
                }
            },
            Err(err) => {
                warn!(phase, attempt, error = %err, "Attempt failed (non-retryable)");
                return Err(err);
            }
        }
    }
}
