//! Scheduling order, readiness and chain blocking through `AppState`.

use std::time::Duration;

use conductor::models::{BlockerType, TaskSpec, TaskStatus};
use conductor::AppError;

use crate::support::{config, within, FakeGenerator, FakeTests, Harness};

fn harness(max_agents: usize) -> Harness {
    Harness::new(config(max_agents), FakeGenerator::ok(), FakeTests::passing())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_agent_runs_waves_in_priority_order() {
    let h = harness(1);
    h.state
        .plan(vec![
            TaskSpec::new(1, "Create user schema").with_workflow_step(1),
            TaskSpec::new(2, "Add user repository")
                .with_workflow_step(2)
                .with_dependencies([1]),
            TaskSpec::new(3, "Add audit log table")
                .with_priority(1)
                .with_workflow_step(1),
        ])
        .unwrap();

    let summary = within(Duration::from_secs(20), h.state.run()).await.unwrap();

    assert_eq!(h.generator.start_order(), vec![1, 3, 2]);
    assert_eq!(summary.started, 3);
    assert_eq!(summary.completed, 3);
    for id in 1..=3 {
        assert_eq!(h.status(id), TaskStatus::Completed);
    }
}

#[tokio::test]
async fn test_ready_set_respects_dependencies_and_blocking() {
    let h = harness(4);
    h.state
        .plan(vec![
            TaskSpec::new(1, "Schema"),
            TaskSpec::new(2, "Repository").with_dependencies([1]),
            TaskSpec::new(3, "Handlers").with_dependencies([1, 2]),
            TaskSpec::new(4, "Config loader"),
        ])
        .unwrap();
    let scheduler = h.state.scheduler();

    let ready: Vec<i64> = scheduler.ready_tasks().unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ready, vec![1, 4]);

    assert!(scheduler.claim(1, "agent-a").unwrap());
    h.state
        .blockers()
        .create_blocker("agent-a", 1, "Which database engine?", BlockerType::Sync)
        .unwrap();

    // Every ready task is pending, unblocked and has completed dependencies
    let tasks = scheduler.tasks().unwrap();
    for task in scheduler.ready_tasks().unwrap() {
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.blocked_by.is_empty());
        for dep in &task.dependencies {
            let dep = tasks.iter().find(|t| t.id == *dep).unwrap();
            assert_eq!(dep.status, TaskStatus::Completed);
        }
    }
    let ready: Vec<i64> = scheduler.ready_tasks().unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ready, vec![4]);
}

#[tokio::test]
async fn test_sync_blocker_pauses_dependents_until_answered() {
    let h = harness(2);
    h.state
        .plan(vec![
            TaskSpec::new(10, "Define API contract"),
            TaskSpec::new(11, "Implement API client").with_dependencies([10]),
        ])
        .unwrap();

    assert!(h.state.scheduler().claim(10, "agent-a").unwrap());
    let blocker = h
        .state
        .blockers()
        .create_blocker("agent-a", 10, "REST or gRPC?", BlockerType::Sync)
        .unwrap();

    let dependent = h.task(11);
    assert_eq!(dependent.status, TaskStatus::Blocked);
    assert!(dependent.blocked_by.contains(&10));
    assert_eq!(h.status(10), TaskStatus::Blocked);

    h.state.blockers().resolve(blocker.id, "REST").unwrap();

    let dependent = h.task(11);
    assert_eq!(dependent.status, TaskStatus::Pending);
    assert!(dependent.blocked_by.is_empty());
    // The asking task still belongs to its agent
    assert_eq!(h.status(10), TaskStatus::InProgress);
}

#[tokio::test]
async fn test_release_only_lifts_the_resolved_origin() {
    let h = harness(2);
    h.state
        .plan(vec![
            TaskSpec::new(1, "Schema"),
            TaskSpec::new(2, "Auth config"),
            TaskSpec::new(3, "Login handler").with_dependencies([1, 2]),
        ])
        .unwrap();
    let scheduler = h.state.scheduler();
    let blockers = h.state.blockers();

    assert!(scheduler.claim(1, "agent-a").unwrap());
    assert!(scheduler.claim(2, "agent-b").unwrap());
    let first = blockers
        .create_blocker("agent-a", 1, "UUID or serial keys?", BlockerType::Sync)
        .unwrap();
    blockers
        .create_blocker("agent-b", 2, "Session lifetime?", BlockerType::Sync)
        .unwrap();

    let waiting = h.task(3);
    assert_eq!(waiting.blocked_by.iter().copied().collect::<Vec<_>>(), vec![1, 2]);

    blockers.resolve(first.id, "UUID").unwrap();

    let waiting = h.task(3);
    assert_eq!(waiting.status, TaskStatus::Blocked);
    assert_eq!(waiting.blocked_by.iter().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(h.status(1), TaskStatus::InProgress);
}

#[test]
fn test_cyclic_plan_is_rejected_without_writes() {
    let h = harness(1);
    h.state.plan(vec![TaskSpec::new(1, "Schema")]).unwrap();

    let err = h
        .state
        .plan(vec![
            TaskSpec::new(2, "Repository").with_dependencies([3]),
            TaskSpec::new(3, "Handlers").with_dependencies([2]),
        ])
        .unwrap_err();

    assert!(matches!(err, AppError::DependencyCycle(_)));
    assert_eq!(h.state.scheduler().counts().unwrap().total, 1);
}

#[test]
fn test_plan_file_is_loaded() {
    let h = harness(1);
    let path = h.dir.path().join("plan.json");
    std::fs::write(
        &path,
        r#"{"tasks": [
            {"id": 1, "title": "Schema"},
            {"id": 2, "title": "Repository", "dependencies": [1], "priority": 2}
        ]}"#,
    )
    .unwrap();

    let tasks = h.state.load_plan(&path).unwrap();

    assert_eq!(tasks.len(), 2);
    assert_eq!(h.task(2).priority, 2);

    std::fs::write(&path, "not json").unwrap();
    assert!(matches!(
        h.state.load_plan(&path).unwrap_err(),
        AppError::Validation(_)
    ));
}
