//! Human-in-the-loop questions across pool runs: expiry policies,
//! escalation and answer handling.

use std::sync::Arc;
use std::time::Duration;

use conductor::models::{
    BlockerFilter, BlockerStatus, BlockerType, SyncExpiryPolicy, TaskSpec, TaskStatus,
};
use conductor::AppError;
use conductor_core::{GeneratedQuestion, GenerationRequest, GenerationResponse, ProviderError};

use crate::support::{config, default_response, within, FakeGenerator, FakeTests, Harness};

fn asks_until_answered(
    request: &GenerationRequest,
) -> Result<GenerationResponse, ProviderError> {
    if request.task_id == 1 && request.answers.is_empty() {
        return Ok(GenerationResponse {
            question: Some(GeneratedQuestion {
                text: "Which OAuth provider should login use?".to_string(),
                blocking: true,
            }),
            ..GenerationResponse::default()
        });
    }
    default_response(request)
}

fn short_ttl(policy: SyncExpiryPolicy) -> conductor::models::OrchestratorConfig {
    conductor::models::OrchestratorConfig {
        blocker_ttl_secs: 1,
        sync_expiry_policy: policy,
        ..config(2)
    }
}

fn plan(h: &Harness) {
    h.state
        .plan(vec![
            TaskSpec::new(1, "OAuth login"),
            TaskSpec::new(2, "Session refresh").with_dependencies([1]),
        ])
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_question_escalates_and_resumes_on_a_later_run() {
    let h = Harness::new(
        short_ttl(SyncExpiryPolicy::Escalate),
        FakeGenerator::new(asks_until_answered),
        FakeTests::passing(),
    );
    plan(&h);

    let summary = within(Duration::from_secs(20), h.state.run()).await.unwrap();

    assert_eq!(summary.blocked, 1);
    let parked = h.task(1);
    assert_eq!(parked.status, TaskStatus::Blocked);
    assert!(parked.assigned_agent.is_none());
    // Dependents are no longer paused by the unanswered question
    let dependent = h.task(2);
    assert_eq!(dependent.status, TaskStatus::Pending);
    assert!(dependent.blocked_by.is_empty());

    let blockers = h.state.blockers().for_task(1).unwrap();
    assert_eq!(blockers.len(), 2);
    assert_eq!(blockers[0].blocker_type, BlockerType::Sync);
    assert_eq!(blockers[0].status, BlockerStatus::Expired);
    let follow_up = &blockers[1];
    assert_eq!(follow_up.blocker_type, BlockerType::Async);
    assert_eq!(follow_up.status, BlockerStatus::Pending);
    assert_eq!(follow_up.question, blockers[0].question);

    h.state.blockers().resolve(follow_up.id, "GitHub").unwrap();
    assert_eq!(h.status(1), TaskStatus::Pending);

    let summary = within(Duration::from_secs(20), h.state.run()).await.unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(h.status(1), TaskStatus::Completed);
    assert_eq!(h.status(2), TaskStatus::Completed);
    let last = h.generator.calls_for(1).pop().unwrap();
    assert_eq!(last.answers, vec!["GitHub".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_question_fails_chain_under_fail_policy() {
    let h = Harness::new(
        short_ttl(SyncExpiryPolicy::FailChain),
        FakeGenerator::new(asks_until_answered),
        FakeTests::passing(),
    );
    plan(&h);

    within(Duration::from_secs(20), h.state.run()).await.unwrap();

    assert_eq!(h.status(1), TaskStatus::Failed);
    assert_eq!(h.status(2), TaskStatus::Failed);
    assert!(h.task(2).error.unwrap().contains("expired"));
    let metrics = h.state.blockers().metrics().unwrap();
    assert_eq!(metrics.expired, 1);
    assert_eq!(metrics.pending, 0);
}

#[tokio::test]
async fn test_answers_are_validated() {
    let h = Harness::new(config(1), FakeGenerator::ok(), FakeTests::passing());
    plan(&h);
    let blockers = Arc::clone(h.state.blockers());
    h.state.scheduler().claim(1, "backend-worker-001").unwrap();

    let blocker = blockers
        .create_blocker("backend-worker-001", 1, "Which provider?", BlockerType::Sync)
        .unwrap();

    assert!(matches!(
        blockers.resolve(blocker.id, "   ").unwrap_err(),
        AppError::Validation(_)
    ));
    let too_long = "x".repeat(h.state.config().max_answer_length + 1);
    assert!(matches!(
        blockers.resolve(blocker.id, &too_long).unwrap_err(),
        AppError::Validation(_)
    ));

    let resolved = blockers.resolve(blocker.id, "  GitHub ").unwrap();
    assert_eq!(resolved.answer.as_deref(), Some("GitHub"));
    assert!(matches!(
        blockers.resolve(blocker.id, "Google").unwrap_err(),
        AppError::Conflict(_)
    ));
    assert!(matches!(
        blockers.resolve(999, "anything").unwrap_err(),
        AppError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_cancelling_a_task_withdraws_its_questions() {
    let h = Harness::new(config(1), FakeGenerator::ok(), FakeTests::passing());
    plan(&h);
    h.state.scheduler().claim(1, "backend-worker-001").unwrap();
    h.state
        .blockers()
        .create_blocker("backend-worker-001", 1, "Which provider?", BlockerType::Sync)
        .unwrap();

    h.state.pool().cancel_task(1).unwrap();

    assert_eq!(h.status(1), TaskStatus::Cancelled);
    assert_eq!(h.status(2), TaskStatus::Pending);
    let pending = h
        .state
        .blockers()
        .list(&BlockerFilter {
            status: Some(BlockerStatus::Pending),
            ..BlockerFilter::default()
        })
        .unwrap();
    assert!(pending.is_empty());
    assert!(matches!(
        h.state
            .blockers()
            .create_blocker("backend-worker-001", 1, "Still there?", BlockerType::Async)
            .unwrap_err(),
        AppError::Conflict(_)
    ));
}

#[tokio::test]
async fn test_expiring_one_of_two_questions_keeps_the_chain_paused() {
    let h = Harness::new(config(1), FakeGenerator::ok(), FakeTests::passing());
    plan(&h);
    let blockers = Arc::clone(h.state.blockers());
    let region = blockers
        .create_blocker("backend-worker-001", 1, "Which region hosts the IdP?", BlockerType::Sync)
        .unwrap();
    let scopes = blockers
        .create_blocker("backend-worker-001", 1, "Which scopes does login request?", BlockerType::Sync)
        .unwrap();
    assert_eq!(h.status(2), TaskStatus::Blocked);

    assert!(blockers.expire(region.id).unwrap());
    assert_eq!(h.status(1), TaskStatus::Blocked);
    let dependent = h.task(2);
    assert_eq!(dependent.status, TaskStatus::Blocked);
    assert!(dependent.blocked_by.contains(&1));

    blockers.resolve(scopes.id, "openid profile").unwrap();
    assert_eq!(h.status(1), TaskStatus::Pending);
    assert_eq!(h.status(2), TaskStatus::Pending);
}
