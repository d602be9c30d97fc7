//! Scheduler
//!
//! Owns readiness, assignment order and the blocked/unblocked transitions of
//! task chains. Every state change runs inside one SQLite transaction on the
//! persisted store; lifecycle events are emitted only after commit.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};

use crate::models::{Task, TaskCounts, TaskExecutionResult, TaskSpec, TaskStatus};
use crate::services::sync::{Broadcaster, SyncEventKind};
use crate::storage::database::{pending_sync_task_ids, read_task, read_tasks, write_task};
use crate::storage::Database;
use crate::utils::error::{AppError, AppResult};

use super::graph::TaskGraph;

pub struct Scheduler {
    db: Database,
    broadcaster: Broadcaster,
    graph: RwLock<Arc<TaskGraph>>,
}

/// Remove `origin` from a task's blocking set.
///
/// Returns true when the set changed. A blocked task whose set empties goes
/// back to `in_progress` if a worker still owns it, otherwise to `pending`.
fn lift(task: &mut Task, origin: i64) -> bool {
    if !task.blocked_by.remove(&origin) {
        return false;
    }
    if task.blocked_by.is_empty() && task.status == TaskStatus::Blocked {
        task.status = if task.assigned_agent.is_some() {
            TaskStatus::InProgress
        } else {
            TaskStatus::Pending
        };
    }
    true
}

/// Lift `origin` from every other task it pauses and persist the changes.
fn lift_everywhere(conn: &Connection, origin: i64, changed: &mut Vec<Task>) -> AppResult<()> {
    let now = Utc::now();
    for mut task in read_tasks(conn)? {
        if task.id == origin || task.status.is_terminal() {
            continue;
        }
        if lift(&mut task, origin) {
            task.updated_at = now;
            write_task(conn, &task)?;
            changed.push(task);
        }
    }
    Ok(())
}

impl Scheduler {
    /// Build the scheduler over the tasks already in the store.
    ///
    /// Fails with a dependency-cycle error if the stored graph is cyclic.
    pub fn load(db: Database, broadcaster: Broadcaster) -> AppResult<Self> {
        let tasks = db.list_tasks()?;
        let graph = TaskGraph::build(tasks.iter().map(|t| (t.id, t.dependencies.clone())))?;
        Ok(Self {
            db,
            broadcaster,
            graph: RwLock::new(Arc::new(graph)),
        })
    }

    pub fn graph(&self) -> AppResult<Arc<TaskGraph>> {
        self.graph
            .read()
            .map(|g| Arc::clone(&g))
            .map_err(|_| AppError::internal("scheduler graph lock poisoned"))
    }

    /// Add tasks to the plan.
    ///
    /// The combined graph (stored tasks plus `specs`) is validated before
    /// anything is written, so a cycle or bad reference leaves the store untouched.
    pub fn plan(&self, specs: Vec<TaskSpec>) -> AppResult<Vec<Task>> {
        let existing = self.db.list_tasks()?;
        let nodes = existing
            .iter()
            .map(|t| (t.id, t.dependencies.iter().copied().collect::<Vec<_>>()))
            .chain(specs.iter().map(|s| (s.id, s.dependencies.clone())));
        let graph = TaskGraph::build(nodes)?;

        let now = Utc::now();
        let tasks: Vec<Task> = specs.into_iter().map(|s| Task::from_spec(s, now)).collect();
        self.db.insert_tasks(&tasks)?;

        let mut guard = self
            .graph
            .write()
            .map_err(|_| AppError::internal("scheduler graph lock poisoned"))?;
        *guard = Arc::new(graph);
        drop(guard);

        tracing::info!(added = tasks.len(), total = existing.len() + tasks.len(), "Plan loaded");
        self.broadcaster.project_progress();
        Ok(tasks)
    }

    /// Rebuild the dependency graph from the store after its tasks were
    /// replaced wholesale (checkpoint restore).
    pub fn reload(&self) -> AppResult<()> {
        let tasks = self.db.list_tasks()?;
        let graph = TaskGraph::build(tasks.iter().map(|t| (t.id, t.dependencies.clone())))?;
        let mut guard = self
            .graph
            .write()
            .map_err(|_| AppError::internal("scheduler graph lock poisoned"))?;
        *guard = Arc::new(graph);
        Ok(())
    }

    pub fn get_task(&self, task_id: i64) -> AppResult<Task> {
        self.db
            .get_task(task_id)?
            .ok_or_else(|| AppError::not_found(format!("Task {} not found", task_id)))
    }

    pub fn tasks(&self) -> AppResult<Vec<Task>> {
        self.db.list_tasks()
    }

    pub fn counts(&self) -> AppResult<TaskCounts> {
        Ok(TaskCounts::from_tasks(&self.db.list_tasks()?))
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    /// Ready tasks in assignment order.
    ///
    /// A task is ready iff it is pending, every dependency is completed, and
    /// it carries no pending SYNC blocker.
    pub fn ready_tasks(&self) -> AppResult<Vec<Task>> {
        let tasks = self.db.list_tasks()?;
        let paused = self.db.pending_sync_task_ids()?;
        let completed: HashSet<i64> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect();

        let mut ready: Vec<Task> = tasks
            .into_iter()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && !paused.contains(&t.id)
                    && t.dependencies.iter().all(|d| completed.contains(d))
            })
            .collect();
        ready.sort_by_key(Task::order_key);
        Ok(ready)
    }

    pub fn next_ready(&self) -> AppResult<Option<Task>> {
        Ok(self.ready_tasks()?.into_iter().next())
    }

    /// Non-terminal tasks mapped to their not-yet-completed dependencies
    pub fn blocked_summary(&self) -> AppResult<BTreeMap<i64, Vec<i64>>> {
        let tasks = self.db.list_tasks()?;
        let completed: HashSet<i64> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect();
        Ok(tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .filter_map(|t| {
                let waiting: Vec<i64> = t
                    .dependencies
                    .iter()
                    .copied()
                    .filter(|d| !completed.contains(d))
                    .collect();
                (!waiting.is_empty()).then_some((t.id, waiting))
            })
            .collect())
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Atomically hand a pending task to an agent.
    ///
    /// Returns false when someone else got there first or the task stopped
    /// being pending.
    pub fn claim(&self, task_id: i64, agent_id: &str) -> AppResult<bool> {
        let now = Utc::now();
        if !self.db.claim_task(task_id, agent_id, now)? {
            tracing::debug!(task_id, agent_id, "Claim lost");
            return Ok(false);
        }
        tracing::info!(task_id, agent_id, "Task claimed");
        self.broadcaster.task_at(
            task_id,
            now,
            SyncEventKind::TaskAssigned {
                agent_id: agent_id.to_string(),
            },
        );
        self.broadcaster.task_at(
            task_id,
            now,
            SyncEventKind::TaskStatusChanged {
                status: TaskStatus::InProgress,
                progress: 0,
                error: None,
            },
        );
        Ok(true)
    }

    /// Move a worker-owned task to another agent.
    ///
    /// Used when an execution resumes after a SYNC wait on a different agent
    /// than the one it started on. Returns false when the task is terminal or
    /// no longer owned by a worker.
    pub fn reassign(&self, task_id: i64, agent_id: &str) -> AppResult<bool> {
        let now = Utc::now();
        let moved = self
            .db
            .with_transaction(TransactionBehavior::Immediate, |conn| {
                let Some(mut task) = read_task(conn, task_id)? else {
                    return Err(AppError::not_found(format!("Task {} not found", task_id)));
                };
                if task.status.is_terminal() || task.assigned_agent.is_none() {
                    return Ok(None);
                }
                if task.assigned_agent.as_deref() == Some(agent_id) {
                    return Ok(Some(false));
                }
                task.assigned_agent = Some(agent_id.to_string());
                task.updated_at = now;
                write_task(conn, &task)?;
                Ok(Some(true))
            })?;

        if moved == Some(true) {
            tracing::debug!(task_id, agent_id, "Task reassigned");
            self.broadcaster.task_at(
                task_id,
                now,
                SyncEventKind::TaskAssigned {
                    agent_id: agent_id.to_string(),
                },
            );
        }
        Ok(moved.is_some())
    }

    pub fn record_progress(&self, task_id: i64, progress: u8) -> AppResult<()> {
        let now = Utc::now();
        self.db.set_task_progress(task_id, progress, now)?;
        self.broadcaster.task_at(
            task_id,
            now,
            SyncEventKind::TaskProgress {
                progress: progress.min(100),
            },
        );
        Ok(())
    }

    // ========================================================================
    // Chain transitions
    // ========================================================================

    /// Pause `origin` and every transitive dependent behind `origin`.
    ///
    /// Called when a SYNC blocker is raised on `origin`. Returns the ids of
    /// tasks whose blocking set changed.
    pub fn block_chain(&self, origin: i64) -> AppResult<Vec<i64>> {
        let graph = self.graph()?;
        let mut affected = vec![origin];
        affected.extend(graph.transitive_dependents(origin));

        let changed = self
            .db
            .with_transaction(TransactionBehavior::Immediate, |conn| {
                let now = Utc::now();
                let mut changed = Vec::new();
                for id in &affected {
                    let Some(mut task) = read_task(conn, *id)? else {
                        continue;
                    };
                    if task.status.is_terminal() {
                        continue;
                    }
                    task.blocked_by.insert(origin);
                    task.status = TaskStatus::Blocked;
                    task.updated_at = now;
                    write_task(conn, &task)?;
                    changed.push(task);
                }
                Ok(changed)
            })?;

        tracing::info!(origin, blocked = changed.len(), "Task chain blocked");
        Ok(self.announce(changed))
    }

    /// Lift the pause `origin` placed on itself and its dependents.
    ///
    /// Each affected task drops `origin` from its blocking set; only those
    /// whose set becomes empty leave `blocked`. Returns the ids of tasks that
    /// left `blocked`.
    pub fn release_chain(&self, origin: i64) -> AppResult<Vec<i64>> {
        let changed = self
            .db
            .with_transaction(TransactionBehavior::Immediate, |conn| {
                let mut changed = Vec::new();
                if let Some(mut task) = read_task(conn, origin)? {
                    if !task.status.is_terminal() && lift(&mut task, origin) {
                        task.updated_at = Utc::now();
                        write_task(conn, &task)?;
                        changed.push(task);
                    }
                }
                lift_everywhere(conn, origin, &mut changed)?;
                Ok(changed)
            })?;

        let released: Vec<i64> = changed
            .iter()
            .filter(|t| t.status != TaskStatus::Blocked)
            .map(|t| t.id)
            .collect();
        tracing::info!(origin, released = ?released, "Task chain released");
        self.announce(changed);
        Ok(released)
    }

    /// Park a task for human attention.
    ///
    /// The task becomes blocked behind itself and loses its agent; a later
    /// `release_chain(task_id)` sends it back to `pending` for a fresh run.
    pub fn park_task(&self, task_id: i64) -> AppResult<Option<Task>> {
        let parked = self
            .db
            .with_transaction(TransactionBehavior::Immediate, |conn| {
                let Some(mut task) = read_task(conn, task_id)? else {
                    return Ok(None);
                };
                if task.status.is_terminal() {
                    return Ok(None);
                }
                task.blocked_by.insert(task_id);
                task.status = TaskStatus::Blocked;
                task.assigned_agent = None;
                task.updated_at = Utc::now();
                write_task(conn, &task)?;
                Ok(Some(task))
            })?;

        if let Some(task) = &parked {
            tracing::info!(task_id, "Task parked for human attention");
            self.announce(vec![task.clone()]);
        }
        Ok(parked)
    }

    /// Lift `origin`'s pause from its dependents but keep `origin` itself
    /// parked, detached from its worker.
    pub fn escalate_chain(&self, origin: i64) -> AppResult<Vec<i64>> {
        let changed = self
            .db
            .with_transaction(TransactionBehavior::Immediate, |conn| {
                let mut changed = Vec::new();
                lift_everywhere(conn, origin, &mut changed)?;
                if let Some(mut task) = read_task(conn, origin)? {
                    if !task.status.is_terminal() {
                        task.blocked_by.insert(origin);
                        task.status = TaskStatus::Blocked;
                        task.assigned_agent = None;
                        task.updated_at = Utc::now();
                        write_task(conn, &task)?;
                        changed.push(task);
                    }
                }
                Ok(changed)
            })?;

        let released: Vec<i64> = changed
            .iter()
            .filter(|t| t.status != TaskStatus::Blocked)
            .map(|t| t.id)
            .collect();
        tracing::warn!(origin, released = ?released, "Task chain escalated");
        self.announce(changed);
        Ok(released)
    }

    /// Fail `origin` and every task it currently pauses.
    pub fn fail_chain(&self, origin: i64, reason: &str) -> AppResult<Vec<i64>> {
        let failed = self
            .db
            .with_transaction(TransactionBehavior::Immediate, |conn| {
                let now = Utc::now();
                let mut failed = Vec::new();
                for mut task in read_tasks(conn)? {
                    if task.status.is_terminal()
                        || (task.id != origin && !task.blocked_by.contains(&origin))
                    {
                        continue;
                    }
                    task.status = TaskStatus::Failed;
                    task.error = Some(reason.to_string());
                    task.assigned_agent = None;
                    task.blocked_by.clear();
                    task.updated_at = now;
                    write_task(conn, &task)?;
                    failed.push(task);
                }
                Ok(failed)
            })?;

        tracing::warn!(origin, failed = failed.len(), reason, "Task chain failed");
        let ids = failed.iter().map(|t| t.id).collect();
        for task in &failed {
            self.emit_status(task);
        }
        self.broadcaster.project_progress();
        Ok(ids)
    }

    // ========================================================================
    // Terminal transitions
    // ========================================================================

    /// Persist a worker's final result
    pub fn finish_task(&self, result: &TaskExecutionResult) -> AppResult<Option<Task>> {
        match result.status {
            TaskStatus::Completed => self.complete_task(result),
            TaskStatus::Failed => {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string());
                self.fail_task(result.task_id, &error)
            }
            TaskStatus::Cancelled => self.cancel_task(result.task_id),
            // The pipeline already parked the task
            TaskStatus::Blocked => self.db.get_task(result.task_id),
            TaskStatus::Pending => self.requeue_task(result.task_id),
            other => Err(AppError::validation(format!(
                "Task {} cannot finish as {}",
                result.task_id, other
            ))),
        }
    }

    /// in_progress → completed.
    ///
    /// Refused with a conflict while a SYNC blocker on the task is pending.
    fn complete_task(&self, result: &TaskExecutionResult) -> AppResult<Option<Task>> {
        let task_id = result.task_id;
        let completed = self
            .db
            .with_transaction(TransactionBehavior::Immediate, |conn| {
                let Some(mut task) = read_task(conn, task_id)? else {
                    return Err(AppError::not_found(format!("Task {} not found", task_id)));
                };
                if task.status != TaskStatus::InProgress {
                    return Ok(None);
                }
                if pending_sync_task_ids(conn)?.contains(&task_id) {
                    return Err(AppError::conflict(format!(
                        "Task {} has a pending SYNC blocker",
                        task_id
                    )));
                }
                let now = Utc::now();
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.assigned_agent = None;
                task.modified_files = result.modified_files.clone();
                task.explanation = result.explanation.clone();
                task.error = None;
                task.completed_at = Some(now);
                task.updated_at = now;
                write_task(conn, &task)?;
                Ok(Some(task))
            })?;

        if let Some(task) = &completed {
            tracing::info!(task_id, files = task.modified_files.len(), "Task completed");
            self.emit_status(task);
            self.broadcaster.project_progress();
        }
        Ok(completed)
    }

    /// Fail one task and lift any pause it placed on others.
    pub fn fail_task(&self, task_id: i64, error: &str) -> AppResult<Option<Task>> {
        self.stop_task(task_id, TaskStatus::Failed, Some(error))
    }

    /// Cancel a non-terminal task and lift any pause it placed on others.
    pub fn cancel_task(&self, task_id: i64) -> AppResult<Option<Task>> {
        self.stop_task(task_id, TaskStatus::Cancelled, None)
    }

    fn stop_task(
        &self,
        task_id: i64,
        status: TaskStatus,
        error: Option<&str>,
    ) -> AppResult<Option<Task>> {
        let (stopped, lifted) = self
            .db
            .with_transaction(TransactionBehavior::Immediate, |conn| {
                let Some(mut task) = read_task(conn, task_id)? else {
                    return Err(AppError::not_found(format!("Task {} not found", task_id)));
                };
                if task.status.is_terminal() {
                    return Ok((None, Vec::new()));
                }
                task.status = status;
                task.error = error.map(str::to_string);
                task.assigned_agent = None;
                task.blocked_by.clear();
                task.updated_at = Utc::now();
                write_task(conn, &task)?;

                let mut lifted = Vec::new();
                lift_everywhere(conn, task_id, &mut lifted)?;
                Ok((Some(task), lifted))
            })?;

        if let Some(task) = &stopped {
            match status {
                TaskStatus::Failed => {
                    tracing::warn!(task_id, error = error.unwrap_or_default(), "Task failed")
                }
                _ => tracing::info!(task_id, status = %status, "Task stopped"),
            }
            self.emit_status(task);
            self.announce(lifted);
            self.broadcaster.project_progress();
        }
        Ok(stopped)
    }

    /// Detach an interrupted execution from its task.
    ///
    /// A running task goes back to `pending`; a task paused behind a blocker
    /// stays `blocked` and is picked up again once its blocking set empties.
    pub fn requeue_task(&self, task_id: i64) -> AppResult<Option<Task>> {
        let requeued = self
            .db
            .with_transaction(TransactionBehavior::Immediate, |conn| {
                let Some(mut task) = read_task(conn, task_id)? else {
                    return Err(AppError::not_found(format!("Task {} not found", task_id)));
                };
                if task.status.is_terminal() || task.assigned_agent.is_none() {
                    return Ok(None);
                }
                if task.status == TaskStatus::InProgress {
                    task.status = TaskStatus::Pending;
                }
                task.assigned_agent = None;
                task.progress = 0;
                task.updated_at = Utc::now();
                write_task(conn, &task)?;
                Ok(Some(task))
            })?;

        if let Some(task) = &requeued {
            tracing::info!(task_id, status = %task.status, "Task requeued");
            self.emit_status(task);
        }
        Ok(requeued)
    }

    /// Requeue every task a previous process left attached to an agent
    pub fn recover_interrupted(&self) -> AppResult<Vec<i64>> {
        let mut recovered = Vec::new();
        for task in self.db.list_tasks()? {
            if !task.status.is_terminal()
                && task.assigned_agent.is_some()
                && self.requeue_task(task.id)?.is_some()
            {
                recovered.push(task.id);
            }
        }
        if !recovered.is_empty() {
            tracing::warn!(tasks = ?recovered, "Recovered interrupted tasks");
        }
        Ok(recovered)
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn emit_status(&self, task: &Task) {
        self.broadcaster.task_at(
            task.id,
            task.updated_at,
            SyncEventKind::TaskStatusChanged {
                status: task.status,
                progress: task.progress,
                error: task.error.clone(),
            },
        );
    }

    /// Emit blocked/unblocked events for changed tasks; returns their ids.
    fn announce(&self, changed: Vec<Task>) -> Vec<i64> {
        changed
            .into_iter()
            .map(|task| {
                let kind = if task.status == TaskStatus::Blocked {
                    SyncEventKind::TaskBlocked {
                        blocked_by: task.blocked_by.iter().copied().collect(),
                    }
                } else {
                    SyncEventKind::TaskUnblocked {
                        status: task.status,
                    }
                };
                self.broadcaster.task_at(task.id, task.updated_at, kind);
                task.id
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockerType, NewBlocker};
    use chrono::Duration;

    fn scheduler() -> Scheduler {
        let db = Database::new_in_memory().unwrap();
        let broadcaster = Broadcaster::new(db.clone());
        Scheduler::load(db, broadcaster).unwrap()
    }

    fn raise_sync(s: &Scheduler, task_id: i64) -> i64 {
        let now = Utc::now();
        let blocker = s
            .db
            .insert_blocker(&NewBlocker {
                agent_id: "backend-worker-001".to_string(),
                task_id,
                blocker_type: BlockerType::Sync,
                question: "Which database?".to_string(),
                created_at: now,
                expires_at: now + Duration::hours(1),
            })
            .unwrap();
        s.block_chain(task_id).unwrap();
        blocker.id
    }

    fn complete(s: &Scheduler, task_id: i64) {
        assert!(s.claim(task_id, "backend-worker-001").unwrap());
        s.finish_task(&TaskExecutionResult::completed(
            task_id,
            vec![],
            "done".to_string(),
        ))
        .unwrap()
        .unwrap();
    }

    fn ready_ids(s: &Scheduler) -> Vec<i64> {
        s.ready_tasks().unwrap().iter().map(|t| t.id).collect()
    }

    #[test]
    fn test_ready_order_priority_step_id() {
        let s = scheduler();
        s.plan(vec![
            TaskSpec::new(1, "A").with_priority(0).with_workflow_step(1),
            TaskSpec::new(2, "B")
                .with_priority(0)
                .with_workflow_step(2)
                .with_dependencies([1]),
            TaskSpec::new(3, "C").with_priority(1).with_workflow_step(1),
        ])
        .unwrap();

        // One agent: A, then C, then B once A is done
        let mut order = Vec::new();
        while let Some(task) = s.next_ready().unwrap() {
            order.push(task.id);
            complete(&s, task.id);
        }
        assert_eq!(order, vec![1, 3, 2]);
    }

    #[test]
    fn test_plan_rejects_cycle_without_writing() {
        let s = scheduler();
        let err = s
            .plan(vec![
                TaskSpec::new(1, "a").with_dependencies([2]),
                TaskSpec::new(2, "b").with_dependencies([1]),
            ])
            .unwrap_err();
        assert!(matches!(err, AppError::DependencyCycle(_)));
        assert!(s.tasks().unwrap().is_empty());
    }

    #[test]
    fn test_plan_validates_against_existing_tasks() {
        let s = scheduler();
        s.plan(vec![TaskSpec::new(1, "a")]).unwrap();
        assert!(matches!(
            s.plan(vec![TaskSpec::new(1, "dup")]).unwrap_err(),
            AppError::Validation(_)
        ));
        s.plan(vec![TaskSpec::new(2, "b").with_dependencies([1])])
            .unwrap();
        assert_eq!(s.graph().unwrap().dependents_of(1), vec![2]);
    }

    #[test]
    fn test_sync_blocker_pauses_chain_and_release_restores_it() {
        let s = scheduler();
        s.plan(vec![
            TaskSpec::new(1, "X"),
            TaskSpec::new(2, "Y").with_dependencies([1]),
            TaskSpec::new(3, "Z").with_dependencies([2]),
        ])
        .unwrap();
        assert!(s.claim(1, "backend-worker-001").unwrap());

        let blocker_id = raise_sync(&s, 1);
        for id in [1, 2, 3] {
            let task = s.get_task(id).unwrap();
            assert_eq!(task.status, TaskStatus::Blocked);
            assert_eq!(task.blocked_by.iter().copied().collect::<Vec<_>>(), vec![1]);
        }

        s.db.resolve_blocker(blocker_id, "Postgres", Utc::now())
            .unwrap();
        let released = s.release_chain(1).unwrap();
        assert_eq!(released, vec![1, 2, 3]);
        // The owning worker is still attached, so X resumes
        assert_eq!(s.get_task(1).unwrap().status, TaskStatus::InProgress);
        assert_eq!(s.get_task(2).unwrap().status, TaskStatus::Pending);
        assert_eq!(s.get_task(3).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_release_never_over_unblocks() {
        let s = scheduler();
        s.plan(vec![
            TaskSpec::new(1, "X"),
            TaskSpec::new(2, "W"),
            TaskSpec::new(3, "Z").with_dependencies([1, 2]),
            TaskSpec::new(4, "V").with_dependencies([1]),
        ])
        .unwrap();
        s.claim(1, "backend-worker-001").unwrap();
        s.claim(2, "backend-worker-002").unwrap();
        let on_x = raise_sync(&s, 1);
        raise_sync(&s, 2);

        s.db.resolve_blocker(on_x, "yes", Utc::now()).unwrap();
        let released = s.release_chain(1).unwrap();

        assert_eq!(released, vec![1, 4]);
        let z = s.get_task(3).unwrap();
        assert_eq!(z.status, TaskStatus::Blocked);
        assert_eq!(z.blocked_by.iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_pending_sync_blocker_hides_task_from_ready_set() {
        let s = scheduler();
        s.plan(vec![TaskSpec::new(1, "X"), TaskSpec::new(2, "Y")])
            .unwrap();
        let now = Utc::now();
        s.db.insert_blocker(&NewBlocker {
            agent_id: "backend-worker-001".to_string(),
            task_id: 2,
            blocker_type: BlockerType::Sync,
            question: "?".to_string(),
            created_at: now,
            expires_at: now + Duration::hours(1),
        })
        .unwrap();
        assert_eq!(ready_ids(&s), vec![1]);
    }

    #[test]
    fn test_completion_refused_while_sync_pending() {
        let s = scheduler();
        s.plan(vec![TaskSpec::new(1, "X")]).unwrap();
        s.claim(1, "backend-worker-001").unwrap();
        let now = Utc::now();
        s.db.insert_blocker(&NewBlocker {
            agent_id: "backend-worker-001".to_string(),
            task_id: 1,
            blocker_type: BlockerType::Sync,
            question: "?".to_string(),
            created_at: now,
            expires_at: now + Duration::hours(1),
        })
        .unwrap();

        let err = s
            .finish_task(&TaskExecutionResult::completed(1, vec![], String::new()))
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(s.get_task(1).unwrap().status, TaskStatus::InProgress);
    }

    #[test]
    fn test_fail_chain_fails_paused_dependents() {
        let s = scheduler();
        s.plan(vec![
            TaskSpec::new(1, "X"),
            TaskSpec::new(2, "Y").with_dependencies([1]),
            TaskSpec::new(3, "free"),
        ])
        .unwrap();
        s.claim(1, "backend-worker-001").unwrap();
        raise_sync(&s, 1);

        let failed = s.fail_chain(1, "blocker 1 expired").unwrap();
        assert_eq!(failed, vec![1, 2]);
        let y = s.get_task(2).unwrap();
        assert_eq!(y.status, TaskStatus::Failed);
        assert_eq!(y.error.as_deref(), Some("blocker 1 expired"));
        assert!(y.blocked_by.is_empty());
        assert_eq!(s.get_task(3).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_escalate_releases_dependents_and_parks_origin() {
        let s = scheduler();
        s.plan(vec![
            TaskSpec::new(1, "X"),
            TaskSpec::new(2, "Y").with_dependencies([1]),
        ])
        .unwrap();
        s.claim(1, "backend-worker-001").unwrap();
        let blocker_id = raise_sync(&s, 1);
        s.db.expire_blocker(blocker_id, Utc::now()).unwrap();

        assert_eq!(s.escalate_chain(1).unwrap(), vec![2]);
        let x = s.get_task(1).unwrap();
        assert_eq!(x.status, TaskStatus::Blocked);
        assert!(x.assigned_agent.is_none());
        assert_eq!(s.get_task(2).unwrap().status, TaskStatus::Pending);

        // Resolving the escalation sends X back for a fresh run
        assert_eq!(s.release_chain(1).unwrap(), vec![1]);
        assert_eq!(ready_ids(&s), vec![1]);
    }

    #[test]
    fn test_cancel_lifts_pause_from_dependents() {
        let s = scheduler();
        s.plan(vec![
            TaskSpec::new(1, "X"),
            TaskSpec::new(2, "Y").with_dependencies([1]),
        ])
        .unwrap();
        s.claim(1, "backend-worker-001").unwrap();
        raise_sync(&s, 1);

        let cancelled = s.cancel_task(1).unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.assigned_agent.is_none());
        assert_eq!(s.get_task(2).unwrap().status, TaskStatus::Pending);
        // Terminal tasks are left alone
        assert!(s.cancel_task(1).unwrap().is_none());
    }

    #[test]
    fn test_blocked_summary_lists_incomplete_dependencies() {
        let s = scheduler();
        s.plan(vec![
            TaskSpec::new(1, "a"),
            TaskSpec::new(2, "b"),
            TaskSpec::new(3, "c").with_dependencies([1, 2]),
        ])
        .unwrap();
        complete(&s, 1);
        let summary = s.blocked_summary().unwrap();
        assert_eq!(summary.get(&3), Some(&vec![2]));
        assert_eq!(summary.len(), 1);
    }

    #[test]
    fn test_lost_claim_returns_false() {
        let s = scheduler();
        s.plan(vec![TaskSpec::new(1, "a")]).unwrap();
        assert!(s.claim(1, "backend-worker-001").unwrap());
        assert!(!s.claim(1, "backend-worker-002").unwrap());
        assert_eq!(
            s.get_task(1).unwrap().assigned_agent.as_deref(),
            Some("backend-worker-001")
        );
    }

    #[test]
    fn test_requeue_returns_running_task_to_pending() {
        let s = scheduler();
        s.plan(vec![TaskSpec::new(1, "a"), TaskSpec::new(2, "b")]).unwrap();
        s.claim(1, "backend-worker-001").unwrap();
        s.claim(2, "backend-worker-002").unwrap();
        raise_sync(&s, 2);

        assert_eq!(s.recover_interrupted().unwrap(), vec![1, 2]);
        let a = s.get_task(1).unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
        assert!(a.assigned_agent.is_none());
        // Still paused behind its own question, but no longer owned
        let b = s.get_task(2).unwrap();
        assert_eq!(b.status, TaskStatus::Blocked);
        assert!(b.assigned_agent.is_none());
        assert!(s.requeue_task(1).unwrap().is_none());
    }
}
