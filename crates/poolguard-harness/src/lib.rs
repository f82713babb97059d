//! Verification harness for poolguard.
//!
//! This crate provides:
//! - Scenarios: end-to-end misuse cases with expected verdicts
//! - Stress: seeded allocation churn checking disjointness and bounds
//! - Structured logs: JSONL records, validation, and an artifact index

#![forbid(unsafe_code)]

pub mod scenarios;
pub mod stress;
pub mod structured_log;

pub use scenarios::{ScenarioReport, run_all};
pub use stress::{StressConfig, StressReport, run_stress};

use poolguard_membrane::RuntimeError;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invariant violated: {0}")]
    Invariant(String),
}
