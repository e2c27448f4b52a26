//! Benchmark engine: deploy, confirm cold, measure and clean up functions for
//! both variants, then compare the two runs.

pub mod case;
pub mod cleanup;
pub mod cold;
pub mod context;
pub mod deploy;
pub mod error;
pub mod io;
pub mod measure;
pub mod orchestrator;
pub mod region;
pub mod report;
pub mod retry;
pub mod session;
pub mod stats;

pub use case::{BenchmarkCase, CaseServices};
pub use cleanup::Cleaner;
pub use cold::{ColdConfirmation, ColdStateConfirmer};
pub use context::{CancelFlag, RunContext, cancellable_sleep};
pub use deploy::DeploymentCoordinator;
pub use error::BenchmarkError;
pub use io::{PersistError, ResultStore};
pub use measure::RequestSender;
pub use orchestrator::{BenchmarkOrchestrator, CleanupTally, VariantRun, WorkerPool};
pub use report::ComparisonReport;
pub use retry::{RetryDecision, RetryPolicy, run_with_retry};
pub use session::DebuggingSession;
