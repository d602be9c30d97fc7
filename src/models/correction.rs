//! Correction Attempt Models
//!
//! Append-only history of self-correction retries per task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionOutcome {
    Passed,
    Failed,
}

impl CorrectionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionOutcome::Passed => "passed",
            CorrectionOutcome::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "passed" => Some(CorrectionOutcome::Passed),
            "failed" => Some(CorrectionOutcome::Failed),
            _ => None,
        }
    }
}

/// One bounded retry cycle following a test failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionAttempt {
    pub id: i64,
    pub task_id: i64,
    /// 1..=3 within one correction loop
    pub attempt_number: u32,
    pub error_analysis: String,
    pub fix_description: String,
    pub outcome: CorrectionOutcome,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when an attempt is recorded
#[derive(Debug, Clone)]
pub struct NewCorrectionAttempt {
    pub task_id: i64,
    pub attempt_number: u32,
    pub error_analysis: String,
    pub fix_description: String,
    pub outcome: CorrectionOutcome,
}
