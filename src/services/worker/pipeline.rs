//! Worker Pipeline
//!
//! The per-task execution contract: context, generation, apply, test,
//! correction, persist. The pipeline is stateless between tasks; everything it
//! learns goes to the persisted store or the agent's context store.
//!
//! Cancellation is checked between stages and interrupts the generation
//! call, the test run and blocker waits.

use std::path::PathBuf;
use std::sync::Arc;

use conductor_core::{GenerationRequest, GenerationResponse, TestRunner};
use tokio_util::sync::CancellationToken;

use crate::models::{
    BlockerStatus, BlockerType, Task, TaskExecutionResult, TaskStatus, WAITING_FOR_AGENT,
};
use crate::services::blockers::BlockerCoordinator;
use crate::services::correction::{run_tests, CorrectionResult, SelfCorrectionLoop};
use crate::services::pool::WorkerSlot;
use crate::services::scheduler::Scheduler;
use crate::utils::error::{AppError, AppResult};

use super::apply::apply_changes;
use super::context::{build_context, ContextLimits};
use super::generation::GenerationClient;
use super::specialist::Specialist;

/// Blocking questions a single run may raise before further questions are
/// recorded as ASYNC and the run continues without an answer
const MAX_BLOCKING_QUESTIONS: usize = 3;

/// Progress reported after each stage
mod progress {
    pub const STARTED: u8 = 10;
    pub const CONTEXT: u8 = 25;
    pub const GENERATED: u8 = 50;
    pub const APPLIED: u8 = 70;
    pub const TESTED: u8 = 85;
}

/// Services a worker needs; shared by every execution of a pool
#[derive(Clone)]
pub struct WorkerServices {
    pub scheduler: Arc<Scheduler>,
    pub blockers: Arc<BlockerCoordinator>,
    pub correction: Arc<SelfCorrectionLoop>,
    pub generation: GenerationClient,
    pub tests: Arc<dyn TestRunner>,
    pub project_root: PathBuf,
    pub limits: ContextLimits,
    /// Pool-wide stop; executions it interrupts are requeued, not cancelled
    pub shutdown: CancellationToken,
}

fn check_cancelled(task_id: i64, cancel: &CancellationToken) -> AppResult<()> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled(format!("task {} cancelled", task_id)));
    }
    Ok(())
}

/// Run the pipeline for a claimed task and persist its final status.
///
/// Never returns an error: failures become a `failed` result, blocker waits
/// that end in escalation become `blocked`.
pub async fn run_pipeline<S: Specialist + ?Sized>(
    specialist: &S,
    services: &WorkerServices,
    task: Task,
    slot: &mut WorkerSlot,
    cancel: &CancellationToken,
) -> TaskExecutionResult {
    let task_id = task.id;
    let result = match execute(specialist, services, &task, slot, cancel).await {
        Ok(result) => result,
        Err(err) => result_for_error(services, task_id, err),
    };

    match services.scheduler.finish_task(&result) {
        Ok(_) => {}
        Err(err) => {
            tracing::error!(task_id, error = %err, "Failed to persist task result");
            if result.status == TaskStatus::Completed {
                if let Err(e) = services.scheduler.fail_task(task_id, &err.to_string()) {
                    tracing::error!(task_id, error = %e, "Failed to mark task failed");
                }
                return TaskExecutionResult::stopped(task_id, TaskStatus::Failed, err.to_string());
            }
        }
    }
    result
}

fn result_for_error(services: &WorkerServices, task_id: i64, err: AppError) -> TaskExecutionResult {
    let status = match &err {
        AppError::Cancelled(_) if services.shutdown.is_cancelled() => TaskStatus::Pending,
        AppError::Cancelled(_) => TaskStatus::Cancelled,
        AppError::BlockerExpired { .. } | AppError::Conflict(_) => {
            match services.scheduler.get_task(task_id).map(|t| t.status) {
                Ok(status @ (TaskStatus::Blocked | TaskStatus::Cancelled)) => status,
                _ => TaskStatus::Failed,
            }
        }
        _ => TaskStatus::Failed,
    };
    match status {
        TaskStatus::Failed => tracing::warn!(task_id, error = %err, "Task failed"),
        _ => tracing::info!(task_id, status = %status, reason = %err, "Task stopped"),
    }
    TaskExecutionResult::stopped(task_id, status, err.to_string())
}

async fn execute<S: Specialist + ?Sized>(
    specialist: &S,
    services: &WorkerServices,
    task: &Task,
    slot: &mut WorkerSlot,
    cancel: &CancellationToken,
) -> AppResult<TaskExecutionResult> {
    let task_id = task.id;
    tracing::info!(
        task_id,
        agent_id = slot.agent_id(),
        agent_type = specialist.agent_type().as_str(),
        "Task execution started"
    );
    services.scheduler.record_progress(task_id, progress::STARTED)?;

    // Context
    check_cancelled(task_id, cancel)?;
    let context = {
        let mut seed_files = Vec::new();
        for dependency in &task.dependencies {
            seed_files.extend(services.scheduler.get_task(*dependency)?.modified_files);
        }
        let hints = specialist.context_hints(task, &services.project_root);
        let store = slot.context()?;
        let mut store = store
            .lock()
            .map_err(|_| AppError::internal("context store lock poisoned"))?;
        build_context(
            &mut store,
            &services.project_root,
            task,
            &seed_files,
            &hints,
            services.limits,
        )?
    };
    services.scheduler.record_progress(task_id, progress::CONTEXT)?;

    // Generation, with questions
    check_cancelled(task_id, cancel)?;
    let mut request = GenerationRequest {
        task_id,
        title: task.title.clone(),
        description: task.description.clone(),
        role: specialist.role().to_string(),
        context,
        failure: None,
        answers: earlier_answers(&services.blockers, task_id)?,
    };
    let response = generate_with_questions(services, &mut request, slot, cancel).await?;
    services.scheduler.record_progress(task_id, progress::GENERATED)?;

    // Apply
    check_cancelled(task_id, cancel)?;
    let mut modified_files = apply_changes(&services.project_root, &response.files)?;
    services.scheduler.record_progress(task_id, progress::APPLIED)?;

    // Test
    check_cancelled(task_id, cancel)?;
    let report = run_tests(services.tests.as_ref(), &services.project_root, cancel).await?;
    services.scheduler.record_progress(task_id, progress::TESTED)?;
    tracing::info!(task_id, passed = report.passed, failed = report.failed, "Tests ran");

    let mut explanation = response.explanation;
    if !report.success {
        match services
            .correction
            .run(slot.agent_id(), &request, report, &services.project_root, cancel)
            .await?
        {
            CorrectionResult::Passed {
                modified_files: fixed,
                explanation: fix,
                ..
            } => {
                for path in fixed {
                    if !modified_files.contains(&path) {
                        modified_files.push(path);
                    }
                }
                if !fix.is_empty() {
                    explanation = fix;
                }
            }
            CorrectionResult::Escalated { attempts, blocker } => {
                return Ok(TaskExecutionResult {
                    task_id,
                    status: TaskStatus::Blocked,
                    modified_files,
                    explanation: Some(explanation),
                    error: Some(format!(
                        "tests still failing after {} correction attempts; waiting on blocker {}",
                        attempts, blocker.id
                    )),
                });
            }
        }
    }

    Ok(TaskExecutionResult::completed(task_id, modified_files, explanation))
}

/// Answers to this task's earlier questions, oldest first
fn earlier_answers(blockers: &BlockerCoordinator, task_id: i64) -> AppResult<Vec<String>> {
    Ok(blockers
        .for_task(task_id)?
        .into_iter()
        .filter(|b| b.status == BlockerStatus::Resolved)
        .filter_map(|b| b.answer)
        .collect())
}

/// Call the generator until it returns without a blocking question.
///
/// A blocking question raises a SYNC blocker; the slot is detached for the
/// wait and reattached afterwards, and the call is repeated with the answer.
/// A non-blocking question is recorded as ASYNC and the response is used.
async fn generate_with_questions(
    services: &WorkerServices,
    request: &mut GenerationRequest,
    slot: &mut WorkerSlot,
    cancel: &CancellationToken,
) -> AppResult<GenerationResponse> {
    let task_id = request.task_id;
    let mut asked = 0usize;
    loop {
        let response = services.generation.generate(request, cancel).await?;
        let Some(question) = response.question.clone() else {
            return Ok(response);
        };

        if !question.blocking || asked >= MAX_BLOCKING_QUESTIONS {
            services.blockers.create_blocker(
                slot.agent_id(),
                task_id,
                &question.text,
                BlockerType::Async,
            )?;
            return Ok(response);
        }

        asked += 1;
        let blocker = services.blockers.create_blocker(
            slot.agent_id(),
            task_id,
            &question.text,
            BlockerType::Sync,
        )?;
        slot.detach()?;
        // The released agent may be handed to another task meanwhile
        services.scheduler.reassign(task_id, WAITING_FOR_AGENT)?;
        let answer = services
            .blockers
            .wait_for_resolution(blocker.id, cancel)
            .await?;
        slot.reattach(cancel).await?;
        if !services.scheduler.reassign(task_id, slot.agent_id())? {
            return Err(AppError::conflict(format!(
                "task {} is no longer owned by a worker",
                task_id
            )));
        }
        tracing::info!(task_id, blocker_id = blocker.id, "Resuming with answer");
        request.answers.push(answer);
    }
}
