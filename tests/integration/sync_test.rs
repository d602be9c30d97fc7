//! Observers: connection-time resync, event order and a reconciled cache.

use std::time::Duration;

use conductor::models::{CheckpointTrigger, CreateCheckpointRequest, TaskSpec, TaskStatus};
use conductor::services::sync::{ObserverState, SyncEvent, SyncEventKind, SyncMessage};

use crate::support::{config, within, FakeGenerator, FakeTests, Harness};

fn position(events: &[SyncEvent], predicate: impl Fn(&SyncEvent) -> bool) -> usize {
    events
        .iter()
        .position(predicate)
        .expect("event not published")
}

fn completed(task_id: &str) -> impl Fn(&SyncEvent) -> bool + '_ {
    move |e| {
        e.entity_id == task_id
            && matches!(
                e.kind,
                SyncEventKind::TaskStatusChanged {
                    status: TaskStatus::Completed,
                    ..
                }
            )
    }
}

fn assigned(task_id: &str) -> impl Fn(&SyncEvent) -> bool + '_ {
    move |e| e.entity_id == task_id && matches!(e.kind, SyncEventKind::TaskAssigned { .. })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscriber_sees_resync_then_lifecycle_in_order() {
    let h = Harness::new(config(2), FakeGenerator::ok(), FakeTests::passing());
    h.state
        .plan(vec![
            TaskSpec::new(1, "User model"),
            TaskSpec::new(2, "User service").with_dependencies([1]),
        ])
        .unwrap();

    let mut subscription = h.state.broadcaster().subscribe().unwrap();
    within(Duration::from_secs(20), h.state.run()).await.unwrap();
    let messages = subscription.drain().unwrap();

    let SyncMessage::Resync(initial) = &messages[0] else {
        panic!("first message must be a resync");
    };
    assert_eq!(initial.tasks.len(), 2);
    assert!(initial.tasks.iter().all(|t| t.status == TaskStatus::Pending));

    let events: Vec<SyncEvent> = messages[1..]
        .iter()
        .filter_map(|m| match m {
            SyncMessage::Event(e) => Some(e.clone()),
            SyncMessage::Resync(_) => None,
        })
        .collect();
    assert!(position(&events, assigned("1")) < position(&events, completed("1")));
    assert!(position(&events, completed("1")) < position(&events, assigned("2")));
    assert!(position(&events, assigned("2")) < position(&events, completed("2")));
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, SyncEventKind::AgentCreated { .. })));

    let mut observer = ObserverState::new();
    for message in &messages {
        observer.apply(message);
    }
    assert_eq!(observer.tasks[&1].status, TaskStatus::Completed);
    assert_eq!(observer.tasks[&2].status, TaskStatus::Completed);
    let progress = observer.progress.unwrap();
    assert_eq!((progress.completed, progress.total), (2, 2));
}

#[tokio::test]
async fn test_late_subscriber_starts_from_current_state() {
    let h = Harness::new(config(1), FakeGenerator::ok(), FakeTests::passing());
    h.state.plan(vec![TaskSpec::new(1, "User model")]).unwrap();
    h.state.pool().cancel_task(1).unwrap();

    let mut subscription = h.state.broadcaster().subscribe().unwrap();
    let Some(SyncMessage::Resync(initial)) = subscription.recv().await.unwrap() else {
        panic!("first message must be a resync");
    };

    assert_eq!(initial.tasks[0].status, TaskStatus::Cancelled);
    assert!(subscription.try_recv().unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_observers_follow_a_restore_to_older_state() {
    let h = Harness::new(config(1), FakeGenerator::ok(), FakeTests::passing());
    h.state.plan(vec![TaskSpec::new(1, "User model")]).unwrap();
    let checkpoint = h
        .state
        .checkpoints()
        .create(CreateCheckpointRequest {
            name: "planned".to_string(),
            description: None,
            trigger: CheckpointTrigger::Manual,
        })
        .unwrap();

    let mut subscription = h.state.broadcaster().subscribe().unwrap();
    within(Duration::from_secs(20), h.state.run()).await.unwrap();
    let before = subscription.drain().unwrap();

    let mut connected = ObserverState::new();
    let mut reconnecting = ObserverState::new();
    for message in &before {
        connected.apply(message);
        reconnecting.apply(message);
    }
    assert_eq!(connected.tasks[&1].status, TaskStatus::Completed);
    assert_eq!(connected.epoch, 0);

    h.state.checkpoints().restore(checkpoint.id, true).unwrap();

    // An observer that stayed connected is told to start over
    let after = subscription.drain().unwrap();
    assert!(after
        .iter()
        .any(|m| matches!(m, SyncMessage::Resync(p) if p.epoch == 1)));
    for message in &after {
        connected.apply(message);
    }
    assert_eq!(connected.epoch, 1);
    assert_eq!(connected.tasks[&1].status, TaskStatus::Pending);
    assert_eq!(connected.progress.as_ref().unwrap().completed, 0);

    // One that reconnects takes the restored state over its newer cache
    let mut fresh = h.state.broadcaster().subscribe().unwrap();
    let Some(resync) = fresh.recv().await.unwrap() else {
        panic!("subscription closed");
    };
    reconnecting.apply(&resync);
    assert_eq!(reconnecting.epoch, 1);
    assert_eq!(reconnecting.tasks[&1].status, TaskStatus::Pending);
}
