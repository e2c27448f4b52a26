//! Run-scoped context shared by every case of a benchmark run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Cooperative cancellation flag.
///
/// Checked between steps and before submissions. Remote calls that already
/// started are allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State owned by one benchmark run. The OS signal handler routes into it.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub cancel: CancelFlag,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Sleep for `duration`, waking early once `cancel` is set.
///
/// Returns `false` when the sleep was cut short.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancelFlag) -> bool {
    const SLICE: Duration = Duration::from_secs(1);
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(SLICE)).await;
    }
}
