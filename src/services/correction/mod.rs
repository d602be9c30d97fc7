//! Self-Correction
//!
//! Bounded retries after a failing test run, with failure analysis of the
//! runner output and an escalation to a human on exhaustion.

mod analysis;
mod self_correction;

pub use analysis::FailureAnalysis;
pub use self_correction::{run_tests, CorrectionResult, SelfCorrectionLoop, MAX_CORRECTION_ATTEMPTS};
