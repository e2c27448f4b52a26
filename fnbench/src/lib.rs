//! Measures the overhead a debugging agent adds to serverless functions.
//!
//! The engine deploys two groups of otherwise identical functions, one with
//! the agent loaded and one without, measures them under the same protocol and
//! reports the statistical difference.
#![forbid(unsafe_code)]

pub mod benchmarks;
pub mod mock;
pub mod remote;
