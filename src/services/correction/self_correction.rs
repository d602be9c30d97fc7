//! Self-Correction Loop
//!
//! Bounded retry after a failing test run: analyze, ask for a focused fix,
//! apply it, re-run the tests, record the attempt. Exhaustion escalates the
//! task to a human through an ASYNC blocker instead of failing it.

use std::path::Path;
use std::sync::Arc;

use conductor_core::{GenerationRequest, TestReport, TestRunner};
use tokio_util::sync::CancellationToken;

use crate::models::{
    Blocker, CorrectionAttempt, CorrectionOutcome, NewCorrectionAttempt, OrchestratorConfig,
};
use crate::services::blockers::BlockerCoordinator;
use crate::services::sync::{Broadcaster, SyncEventKind};
use crate::services::worker::{apply_changes, GenerationClient};
use crate::storage::Database;
use crate::utils::error::{AppError, AppResult};

use super::analysis::FailureAnalysis;

/// Hard ceiling on attempts per loop
pub const MAX_CORRECTION_ATTEMPTS: u32 = 3;

/// How a correction loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionResult {
    /// An attempt made the tests pass
    Passed {
        attempts: u32,
        modified_files: Vec<String>,
        explanation: String,
    },
    /// Every attempt failed; the task is parked behind `blocker`
    Escalated { attempts: u32, blocker: Blocker },
}

/// Run the test command, giving up early on cancellation
pub async fn run_tests(
    runner: &dyn TestRunner,
    project_root: &Path,
    cancel: &CancellationToken,
) -> AppResult<TestReport> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AppError::Cancelled("test run cancelled".to_string())),
        report = runner.run_tests(project_root) => Ok(report?),
    }
}

pub struct SelfCorrectionLoop {
    db: Database,
    broadcaster: Broadcaster,
    blockers: Arc<BlockerCoordinator>,
    generation: GenerationClient,
    tests: Arc<dyn TestRunner>,
    max_attempts: u32,
}

impl SelfCorrectionLoop {
    pub fn new(
        db: Database,
        broadcaster: Broadcaster,
        blockers: Arc<BlockerCoordinator>,
        generation: GenerationClient,
        tests: Arc<dyn TestRunner>,
        max_attempts: u32,
    ) -> Self {
        Self {
            db,
            broadcaster,
            blockers,
            generation,
            tests,
            max_attempts: max_attempts.clamp(1, MAX_CORRECTION_ATTEMPTS),
        }
    }

    pub fn from_config(
        db: Database,
        broadcaster: Broadcaster,
        blockers: Arc<BlockerCoordinator>,
        generation: GenerationClient,
        tests: Arc<dyn TestRunner>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self::new(
            db,
            broadcaster,
            blockers,
            generation,
            tests,
            config.max_correction_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn history(&self, task_id: i64) -> AppResult<Vec<CorrectionAttempt>> {
        self.db.correction_history(task_id)
    }

    /// Correct a task whose tests just failed with `initial`.
    ///
    /// `base` is the request that produced the failing change. Validation
    /// errors (a disallowed path in a fix) and cancellation end the loop
    /// with an error; provider and test-runner errors count as failed
    /// attempts.
    pub async fn run(
        &self,
        agent_id: &str,
        base: &GenerationRequest,
        initial: TestReport,
        project_root: &Path,
        cancel: &CancellationToken,
    ) -> AppResult<CorrectionResult> {
        let task_id = base.task_id;
        let mut report = initial;
        let mut modified_files: Vec<String> = Vec::new();

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled(format!(
                    "correction of task {} cancelled",
                    task_id
                )));
            }

            let analysis = FailureAnalysis::from_report(&report);
            let request = GenerationRequest {
                failure: Some(analysis.prompt(attempt, self.max_attempts)),
                ..base.clone()
            };
            tracing::info!(task_id, attempt, failing = analysis.failing_tests.len(), "Correction attempt");

            let fix_description = match self.generation.generate(&request, cancel).await {
                Ok(response) => {
                    for path in apply_changes(project_root, &response.files)? {
                        if !modified_files.contains(&path) {
                            modified_files.push(path);
                        }
                    }
                    match run_tests(self.tests.as_ref(), project_root, cancel).await {
                        Ok(next) => report = next,
                        Err(err @ AppError::Cancelled(_)) => return Err(err),
                        Err(err) => {
                            tracing::warn!(task_id, attempt, error = %err, "Test run failed");
                            report = TestReport::failing(report.failed.max(1), err.to_string());
                        }
                    }
                    response.explanation
                }
                Err(err @ AppError::Cancelled(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!(task_id, attempt, error = %err, "Correction generation failed");
                    format!("generation failed: {}", err)
                }
            };

            let outcome = if report.success {
                CorrectionOutcome::Passed
            } else {
                CorrectionOutcome::Failed
            };
            self.record(attempt, task_id, &analysis, &fix_description, outcome)?;

            if outcome == CorrectionOutcome::Passed {
                tracing::info!(task_id, attempt, "Correction succeeded");
                return Ok(CorrectionResult::Passed {
                    attempts: attempt,
                    modified_files,
                    explanation: fix_description,
                });
            }
        }

        let question = escalation_question(
            task_id,
            self.max_attempts,
            &FailureAnalysis::from_report(&report),
            self.blockers.settings().max_question_length,
        );
        let blocker = self.blockers.escalate_task(agent_id, task_id, &question)?;
        tracing::warn!(
            task_id,
            blocker_id = blocker.id,
            attempts = self.max_attempts,
            "Correction attempts exhausted, escalated"
        );
        Ok(CorrectionResult::Escalated {
            attempts: self.max_attempts,
            blocker,
        })
    }

    fn record(
        &self,
        attempt: u32,
        task_id: i64,
        analysis: &FailureAnalysis,
        fix_description: &str,
        outcome: CorrectionOutcome,
    ) -> AppResult<CorrectionAttempt> {
        let recorded = self.db.insert_correction_attempt(&NewCorrectionAttempt {
            task_id,
            attempt_number: attempt,
            error_analysis: analysis.summary(),
            fix_description: fix_description.to_string(),
            outcome,
        })?;
        self.broadcaster.task_at(
            task_id,
            recorded.created_at,
            SyncEventKind::CorrectionAttempt {
                task_id,
                attempt_number: attempt,
                outcome,
            },
        );
        Ok(recorded)
    }
}

fn escalation_question(
    task_id: i64,
    attempts: u32,
    analysis: &FailureAnalysis,
    max_chars: usize,
) -> String {
    let question = format!(
        "Task {} still fails its tests after {} correction attempts ({}). How should it proceed?",
        task_id,
        attempts,
        analysis.summary()
    );
    if question.chars().count() <= max_chars {
        question
    } else {
        question.chars().take(max_chars).collect()
    }
}
