//! Checkpoints over a real git working tree.
//!
//! Skipped when `git` is not installed.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use conductor::models::{CheckpointTrigger, CreateCheckpointRequest, TaskSpec, TaskStatus};
use conductor::services::checkpoint::GitBackend;
use conductor::services::sync::{SyncEventKind, SyncMessage};

use crate::support::{config, within, FakeGenerator, FakeTests, Harness};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn read(root: &Path, path: &str) -> Option<String> {
    std::fs::read_to_string(root.join(path)).ok()
}

fn request(name: &str) -> CreateCheckpointRequest {
    CreateCheckpointRequest {
        name: name.to_string(),
        description: Some("before the agents ran".to_string()),
        trigger: CheckpointTrigger::Manual,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restore_rolls_back_code_and_state_together() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("README.md"), "v1\n").unwrap();
    let vcs = Arc::new(GitBackend::open_or_init(dir.path()).unwrap());
    let h = Harness::with_vcs(
        dir,
        config(2),
        FakeGenerator::ok(),
        FakeTests::passing(),
        vcs,
    );
    let root = h.dir.path().to_path_buf();
    h.state
        .plan(vec![
            TaskSpec::new(1, "User model"),
            TaskSpec::new(2, "User service").with_dependencies([1]),
        ])
        .unwrap();

    let checkpoint = h.state.checkpoints().create(request("planned")).unwrap();
    assert_eq!(checkpoint.metadata.tasks.pending, 2);
    assert_eq!(h.state.checkpoints().list().unwrap().len(), 1);

    within(Duration::from_secs(20), h.state.run()).await.unwrap();
    std::fs::write(root.join("README.md"), "v2\n").unwrap();
    assert!(read(&root, "src/task_1.rs").is_some());

    let diff = h.state.checkpoints().diff(checkpoint.id).unwrap();
    assert_eq!(diff.tasks_changed, 2);
    assert!(diff.files_changed >= 3);

    // Preview only
    let preview = h.state.checkpoints().restore(checkpoint.id, false).unwrap();
    assert!(!preview.restored);
    assert_eq!(read(&root, "README.md").as_deref(), Some("v2\n"));
    assert_eq!(h.status(1), TaskStatus::Completed);

    let mut subscription = h.state.broadcaster().subscribe().unwrap();
    let outcome = h.state.checkpoints().restore(checkpoint.id, true).unwrap();

    assert!(outcome.restored);
    assert!(outcome.safety_revision.is_some());
    assert_eq!(read(&root, "README.md").as_deref(), Some("v1\n"));
    assert!(read(&root, "src/task_1.rs").is_none());
    assert!(read(&root, "src/task_2.rs").is_none());
    assert_eq!(h.status(1), TaskStatus::Pending);
    assert_eq!(h.status(2), TaskStatus::Pending);
    let ready: Vec<i64> = h
        .state
        .scheduler()
        .ready_tasks()
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec![1]);

    let messages = subscription.drain().unwrap();
    assert!(messages
        .iter()
        .any(|m| matches!(m, SyncMessage::Resync(p) if p.epoch == 1)));
    let announced: Vec<String> = messages
        .into_iter()
        .filter_map(|m| match m {
            SyncMessage::Event(e) => match e.kind {
                SyncEventKind::TaskStatusChanged {
                    status: TaskStatus::Pending,
                    ..
                } => Some(e.entity_id),
                _ => None,
            },
            SyncMessage::Resync(_) => None,
        })
        .collect();
    assert_eq!(announced, vec!["1".to_string(), "2".to_string()]);

    // The restored plan runs again
    let summary = within(Duration::from_secs(20), h.state.run()).await.unwrap();
    assert_eq!(summary.completed, 2);
    assert!(read(&root, "src/task_2.rs").is_some());
}

#[tokio::test]
async fn test_deleted_checkpoint_removes_snapshots() {
    let h = Harness::new(config(1), FakeGenerator::ok(), FakeTests::passing());
    h.state.plan(vec![TaskSpec::new(1, "User model")]).unwrap();

    let checkpoint = h.state.checkpoints().create(request("planned")).unwrap();
    let dir = conductor::utils::paths::checkpoints_dir(h.dir.path());
    assert!(dir.join(&checkpoint.state_snapshot_path).exists());
    assert!(dir.join(&checkpoint.context_snapshot_path).exists());

    assert!(h.state.checkpoints().delete(checkpoint.id).unwrap());

    assert!(!dir.join(&checkpoint.state_snapshot_path).exists());
    assert!(h.state.checkpoints().list().unwrap().is_empty());
    assert!(h.state.checkpoints().get(checkpoint.id).is_err());
}
