//! Agent pool: concurrency ceiling, failure isolation, cancellation,
//! shutdown and workers suspended on questions.

use std::time::{Duration, Instant};

use conductor::models::{
    AgentType, BlockerFilter, BlockerStatus, BlockerType, CheckpointTrigger,
    CreateCheckpointRequest, TaskSpec, TaskStatus, WAITING_FOR_AGENT,
};
use conductor::AppError;
use conductor_core::{GeneratedQuestion, GenerationRequest, GenerationResponse, ProviderError};

use crate::support::{config, default_response, eventually, within, FakeGenerator, FakeTests, Harness};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_never_exceeds_max_agents() {
    let h = Harness::new(
        config(10),
        FakeGenerator::ok().with_delay(Duration::from_millis(200)),
        FakeTests::passing(),
    );
    let specs = (1..=11)
        .map(|id| TaskSpec::new(id, format!("Endpoint {}", id)))
        .collect();
    h.state.plan(specs).unwrap();

    let summary = within(Duration::from_secs(30), h.state.run()).await.unwrap();

    assert_eq!(h.generator.peak(), 10);
    assert_eq!(summary.completed, 11);
    assert_eq!(h.state.scheduler().counts().unwrap().completed, 11);
    let status = h.state.status().unwrap();
    assert!(status.pool.total_agents <= 10);
    assert_eq!(status.pool.working, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_failure_and_panic_stay_isolated() {
    let generator = FakeGenerator::new(|request| match request.task_id {
        2 => Err(ProviderError::Failed("model refused".to_string())),
        3 => panic!("generator blew up"),
        _ => default_response(request),
    });
    let h = Harness::new(config(4), generator, FakeTests::passing());
    h.state
        .plan(vec![
            TaskSpec::new(1, "Schema"),
            TaskSpec::new(2, "Repository"),
            TaskSpec::new(3, "Handlers"),
            TaskSpec::new(4, "Config loader"),
            TaskSpec::new(5, "Router").with_dependencies([2]),
        ])
        .unwrap();

    let summary = within(Duration::from_secs(20), h.state.run()).await.unwrap();

    assert_eq!(h.status(1), TaskStatus::Completed);
    assert_eq!(h.status(4), TaskStatus::Completed);
    assert_eq!(h.status(2), TaskStatus::Failed);
    assert_eq!(h.status(3), TaskStatus::Failed);
    assert!(h.task(3).error.unwrap().contains("panicked"));
    // A failed dependency keeps its dependent out of the ready set
    assert_eq!(h.status(5), TaskStatus::Pending);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 2);
    assert!(h.dir.path().join("src/task_1.rs").exists());
    assert_eq!(h.state.registry().working_count().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_interrupts_running_task() {
    let h = Harness::new(
        config(2),
        FakeGenerator::ok().with_delay(Duration::from_secs(30)),
        FakeTests::passing(),
    );
    h.state.plan(vec![TaskSpec::new(1, "Long migration")]).unwrap();

    let run = h.spawn_run();
    eventually(WAIT, || !h.generator.requests().is_empty()).await;
    assert_eq!(h.status(1), TaskStatus::InProgress);

    let cancelled = h.state.pool().cancel_task(1).unwrap().unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let summary = within(WAIT, run).await.unwrap().unwrap();
    assert_eq!(summary.cancelled, 1);
    let task = h.task(1);
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.assigned_agent.is_none());
    assert!(h.state.pool().cancel_task(1).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_returns_running_tasks_to_the_queue() {
    let h = Harness::new(
        config(2),
        FakeGenerator::ok().with_delay(Duration::from_secs(30)),
        FakeTests::passing(),
    );
    h.state.plan(vec![TaskSpec::new(1, "Long migration")]).unwrap();

    let run = h.spawn_run();
    eventually(WAIT, || !h.generator.requests().is_empty()).await;
    h.state.shutdown_token().cancel();

    let summary = within(WAIT, run).await.unwrap().unwrap();
    assert_eq!(summary.interrupted, 1);
    let task = h.task(1);
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assigned_agent.is_none());
    assert_eq!(h.state.registry().working_count().unwrap(), 0);
}

fn asks_about_sessions(
    request: &GenerationRequest,
) -> Result<GenerationResponse, ProviderError> {
    if request.task_id == 1 && request.answers.is_empty() {
        return Ok(GenerationResponse {
            question: Some(GeneratedQuestion {
                text: "Should sessions live in Redis or Postgres?".to_string(),
                blocking: true,
            }),
            ..GenerationResponse::default()
        });
    }
    default_response(request)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_question_suspends_worker_until_answered() {
    let generator = FakeGenerator::new(asks_about_sessions);
    let h = Harness::new(config(1), generator, FakeTests::passing());
    h.state
        .plan(vec![
            TaskSpec::new(1, "Session storage"),
            TaskSpec::new(2, "Login handler").with_dependencies([1]),
            TaskSpec::new(3, "Changelog entry"),
        ])
        .unwrap();

    let run = h.spawn_run();
    let pending = BlockerFilter {
        status: Some(BlockerStatus::Pending),
        ..BlockerFilter::default()
    };
    eventually(WAIT, || !h.state.blockers().list(&pending).unwrap().is_empty()).await;

    let blocker = h.state.blockers().list(&pending).unwrap().remove(0);
    assert_eq!(blocker.task_id, 1);
    assert_eq!(blocker.blocker_type, BlockerType::Sync);
    assert_eq!(h.status(2), TaskStatus::Blocked);

    // The suspended worker gave its slot back, so the single slot runs task 3
    eventually(WAIT, || h.status(3) == TaskStatus::Completed).await;
    assert_eq!(h.state.status().unwrap().pool.waiting, 1);

    h.state.blockers().resolve(blocker.id, "Redis").unwrap();

    let summary = within(Duration::from_secs(20), run).await.unwrap().unwrap();
    assert_eq!(summary.completed, 3);
    for id in 1..=3 {
        assert_eq!(h.status(id), TaskStatus::Completed);
    }
    let resumed = h.generator.calls_for(1).pop().unwrap();
    assert_eq!(resumed.answers, vec!["Redis".to_string()]);
    assert_eq!(h.state.status().unwrap().pool.waiting, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_blocking_question_is_recorded_and_task_continues() {
    let generator = FakeGenerator::new(|request| {
        let mut response = default_response(request)?;
        response.question = Some(GeneratedQuestion {
            text: "Is the default page size of 50 fine?".to_string(),
            blocking: false,
        });
        Ok(response)
    });
    let h = Harness::new(config(1), generator, FakeTests::passing());
    h.state.plan(vec![TaskSpec::new(1, "Pagination")]).unwrap();

    within(Duration::from_secs(20), h.state.run()).await.unwrap();

    assert_eq!(h.status(1), TaskStatus::Completed);
    let blockers = h.state.blockers().for_task(1).unwrap();
    assert_eq!(blockers.len(), 1);
    assert_eq!(blockers[0].blocker_type, BlockerType::Async);
    assert_eq!(blockers[0].status, BlockerStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_open_leaves_a_live_run_alone() {
    let h = Harness::new(
        config(2),
        FakeGenerator::ok().with_delay(Duration::from_secs(30)),
        FakeTests::passing(),
    );
    h.state.plan(vec![TaskSpec::new(1, "Long migration")]).unwrap();

    let run = h.spawn_run();
    eventually(WAIT, || !h.generator.requests().is_empty()).await;
    let owner = h.task(1).assigned_agent.unwrap();

    // What `conductor status` or `blockers list` does from another shell
    let second = h.open_again();
    let task = second.scheduler().get_task(1).unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.assigned_agent.as_deref(), Some(owner.as_str()));
    assert_eq!(second.registry().working_count().unwrap(), 1);
    assert!(!second.scheduler().claim(1, "backend-worker-009").unwrap());
    assert!(matches!(second.run().await, Err(AppError::Conflict(_))));
    assert_eq!(h.task(1).assigned_agent.as_deref(), Some(owner.as_str()));

    h.state.shutdown_token().cancel();
    let summary = within(WAIT, run).await.unwrap().unwrap();
    assert_eq!(summary.interrupted, 1);
    assert_eq!(h.status(1), TaskStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_next_run_recovers_claim_left_by_a_dead_process() {
    let h = Harness::new(config(1), FakeGenerator::ok(), FakeTests::passing());
    h.state.plan(vec![TaskSpec::new(1, "User model")]).unwrap();
    assert!(h.state.scheduler().claim(1, "backend-worker-001").unwrap());

    // Opening alone recovers nothing
    let _reader = h.open_again();
    assert_eq!(h.status(1), TaskStatus::InProgress);

    let summary = within(Duration::from_secs(20), h.state.run()).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(h.status(1), TaskStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restore_is_refused_while_a_worker_waits_on_a_question() {
    let h = Harness::new(
        config(1),
        FakeGenerator::new(asks_about_sessions),
        FakeTests::passing(),
    );
    h.state.plan(vec![TaskSpec::new(1, "Session storage")]).unwrap();
    let checkpoint = h
        .state
        .checkpoints()
        .create(CreateCheckpointRequest {
            name: "planned".to_string(),
            description: None,
            trigger: CheckpointTrigger::Manual,
        })
        .unwrap();

    let run = h.spawn_run();
    eventually(WAIT, || {
        h.task(1).assigned_agent.as_deref() == Some(WAITING_FOR_AGENT)
    })
    .await;
    assert_eq!(h.status(1), TaskStatus::Blocked);
    assert_eq!(h.state.status().unwrap().pool.waiting, 1);

    let refused = h.state.checkpoints().restore(checkpoint.id, true);
    assert!(matches!(refused, Err(AppError::Conflict(_))));
    let blocker = h.state.blockers().for_task(1).unwrap().remove(0);
    assert_eq!(blocker.status, BlockerStatus::Pending);

    h.state.blockers().resolve(blocker.id, "Redis").unwrap();
    let summary = within(Duration::from_secs(20), run).await.unwrap().unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(h.status(1), TaskStatus::Completed);
    assert!(h.task(1).error.is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn test_unstartable_ready_task_waits_without_spinning() {
    let h = Harness::new(config(1), FakeGenerator::ok(), FakeTests::passing());
    h.state.plan(vec![TaskSpec::new(1, "User model")]).unwrap();
    // Occupy the only agent so every start attempt fails
    let held = h.state.registry().acquire(AgentType::Backend, 99).unwrap();

    let shutdown = h.state.shutdown_token();
    let timer = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        timer.cancel();
    });
    // A busy loop never yields to the timer above; this thread ends the run late
    let fallback = shutdown.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(5));
        fallback.cancel();
    });

    let started = Instant::now();
    let summary = h.state.run().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(summary.started, 0);
    assert_eq!(h.status(1), TaskStatus::Pending);
    h.state.registry().release(&held.id, false).unwrap();
}
