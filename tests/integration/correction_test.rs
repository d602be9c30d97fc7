//! Self-correction driven by the pool: bounded attempts, recorded history
//! and escalation.

use std::time::Duration;

use conductor::models::{BlockerStatus, BlockerType, CorrectionOutcome, TaskSpec, TaskStatus};
use conductor_core::TestReport;

use crate::support::{config, within, FakeGenerator, FakeTests, Harness};

fn failing(output: &str) -> TestReport {
    TestReport::failing(1, output)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_corrections_escalate_once() {
    let h = Harness::new(config(1), FakeGenerator::ok(), FakeTests::always_failing());
    h.state
        .plan(vec![
            TaskSpec::new(1, "Token issuing"),
            TaskSpec::new(2, "Token refresh").with_dependencies([1]),
        ])
        .unwrap();

    let summary = within(Duration::from_secs(20), h.state.run()).await.unwrap();

    // One initial run plus three correction attempts
    assert_eq!(h.tests.runs(), 4);
    assert_eq!(h.generator.calls_for(1).len(), 4);
    assert_eq!(summary.blocked, 1);

    let history = h.state.correction().history(1).unwrap();
    assert_eq!(history.len(), 3);
    let numbers: Vec<u32> = history.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(history.iter().all(|a| a.outcome == CorrectionOutcome::Failed));

    let task = h.task(1);
    assert_eq!(task.status, TaskStatus::Blocked);
    assert!(task.assigned_agent.is_none());
    assert_eq!(h.status(2), TaskStatus::Pending);

    let blockers = h.state.blockers().for_task(1).unwrap();
    assert_eq!(blockers.len(), 1);
    assert_eq!(blockers[0].blocker_type, BlockerType::Async);
    assert_eq!(blockers[0].status, BlockerStatus::Pending);
    assert!(blockers[0].question.contains("3 correction attempts"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_attempt_fixes_the_task() {
    let tests = FakeTests::scripted(vec![
        failing("test db::migrate ... FAILED\nerror[E0425]: cannot find value `pool`"),
        failing("test db::migrate ... FAILED\nthread 'db::migrate' panicked at src/db.rs:12:5"),
    ]);
    let h = Harness::new(config(1), FakeGenerator::ok(), tests);
    h.state.plan(vec![TaskSpec::new(1, "Database migrations")]).unwrap();

    let summary = within(Duration::from_secs(20), h.state.run()).await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(h.status(1), TaskStatus::Completed);
    assert_eq!(h.tests.runs(), 3);

    let history = h.state.correction().history(1).unwrap();
    let outcomes: Vec<CorrectionOutcome> = history.iter().map(|a| a.outcome).collect();
    assert_eq!(outcomes, vec![CorrectionOutcome::Failed, CorrectionOutcome::Passed]);

    let calls = h.generator.calls_for(1);
    assert_eq!(calls.len(), 3);
    assert!(calls[0].failure.is_none());
    let first_fix = calls[1].failure.as_deref().unwrap();
    assert!(first_fix.contains("db::migrate"));
    assert!(calls[2].failure.is_some());
    assert!(h.state.blockers().for_task(1).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_answering_escalation_gives_the_task_a_fresh_run() {
    let tests = FakeTests::scripted(vec![
        failing("test a ... FAILED"),
        failing("test a ... FAILED"),
        failing("test a ... FAILED"),
        failing("test a ... FAILED"),
    ]);
    let h = Harness::new(config(1), FakeGenerator::ok(), tests);
    h.state.plan(vec![TaskSpec::new(1, "Rate limiter")]).unwrap();

    within(Duration::from_secs(20), h.state.run()).await.unwrap();
    let blocker = h.state.blockers().for_task(1).unwrap().remove(0);

    h.state
        .blockers()
        .resolve(blocker.id, "Use a token bucket with a 1s refill")
        .unwrap();
    assert_eq!(h.status(1), TaskStatus::Pending);

    let summary = within(Duration::from_secs(20), h.state.run()).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(h.status(1), TaskStatus::Completed);
    let last = h.generator.calls_for(1).pop().unwrap();
    assert_eq!(last.answers, vec!["Use a token bucket with a 1s refill".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_lists_failed_task_with_its_attempts() {
    let h = Harness::new(config(1), FakeGenerator::ok(), FakeTests::always_failing());
    h.state.plan(vec![TaskSpec::new(1, "Session store")]).unwrap();
    within(Duration::from_secs(20), h.state.run()).await.unwrap();
    assert!(h.state.status().unwrap().failed.is_empty());

    h.state
        .scheduler()
        .fail_chain(1, "escalation declined")
        .unwrap();

    let report = h.state.status().unwrap();
    assert_eq!(report.failed.len(), 1);
    let failed = &report.failed[0];
    assert_eq!(failed.task_id, 1);
    assert_eq!(failed.title, "Session store");
    assert_eq!(failed.error.as_deref(), Some("escalation declined"));
    let numbers: Vec<u32> = failed.attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(failed
        .attempts
        .iter()
        .all(|a| a.outcome == CorrectionOutcome::Failed));
}
