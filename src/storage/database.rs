//! SQLite Database
//!
//! The authoritative persisted store, using rusqlite with r2d2 connection pooling.
//! Workers share no memory with each other; every coordination step goes
//! through the atomic per-row operations defined here.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use serde::de::DeserializeOwned;

use crate::models::{
    Agent, AgentStatus, AgentType, Blocker, BlockerFilter, BlockerStatus, BlockerType, Checkpoint,
    CheckpointTrigger, ContextItem, ContextSnapshot, ContextTier, CorrectionAttempt,
    CorrectionOutcome, NewBlocker, NewCheckpoint, NewCorrectionAttempt, StateSnapshot, Task,
    TaskStatus,
};
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::{database_path, ensure_state_dir};

/// Type alias for the connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Database service for managing SQLite operations
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

const TASK_COLUMNS: &str = "id, title, description, status, dependencies, priority, workflow_step, \
     agent_type, assigned_agent, blocked_by, progress, explanation, error, modified_files, \
     created_at, updated_at, completed_at";

const AGENT_COLUMNS: &str =
    "id, agent_type, status, current_task, context_token_usage, tasks_completed, last_update";

const BLOCKER_COLUMNS: &str = "id, agent_id, task_id, blocker_type, question, answer, status, \
     created_at, resolved_at, expires_at";

const CONTEXT_COLUMNS: &str = "agent_id, key, content, tier, token_count, importance_score, \
     pinned, access_count, last_accessed, created_at";

const CHECKPOINT_COLUMNS: &str = "id, name, description, trigger, git_commit, \
     state_snapshot_path, context_snapshot_path, snapshot_sha256, context_sha256, metadata, \
     created_at";

const ATTEMPT_COLUMNS: &str =
    "id, task_id, attempt_number, error_analysis, fix_description, outcome, created_at";

impl Database {
    /// Create an in-memory database for testing.
    ///
    /// A single pooled connection keeps every caller on the same in-memory
    /// database.
    pub fn new_in_memory() -> AppResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .build(manager)
            .map_err(|e| AppError::database(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Open (or create) the database file at `path`
    pub fn new(path: &Path) -> AppResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")
        });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| AppError::database(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;

        Ok(db)
    }

    /// Open the project database at `<project>/.conductor/state.db`
    pub fn open_project(project_root: &Path) -> AppResult<Self> {
        ensure_state_dir(project_root)?;
        Self::new(&database_path(project_root))
    }

    /// Initialize the database schema
    fn init_schema(&self) -> AppResult<()> {
        let conn = self.get_connection()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                dependencies TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                workflow_step INTEGER NOT NULL DEFAULT 0,
                agent_type TEXT NOT NULL,
                assigned_agent TEXT,
                blocked_by TEXT NOT NULL DEFAULT '[]',
                progress INTEGER NOT NULL DEFAULT 0,
                explanation TEXT,
                error TEXT,
                modified_files TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                agent_type TEXT NOT NULL,
                status TEXT NOT NULL,
                current_task INTEGER,
                context_token_usage INTEGER NOT NULL DEFAULT 0,
                tasks_completed INTEGER NOT NULL DEFAULT 0,
                last_update TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS blockers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                task_id INTEGER NOT NULL,
                blocker_type TEXT NOT NULL,
                question TEXT NOT NULL,
                answer TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_blockers_status ON blockers(status, blocker_type);
            CREATE INDEX IF NOT EXISTS idx_blockers_task ON blockers(task_id);

            CREATE TABLE IF NOT EXISTS context_items (
                agent_id TEXT NOT NULL,
                key TEXT NOT NULL,
                content TEXT NOT NULL,
                tier TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                importance_score REAL NOT NULL,
                pinned INTEGER NOT NULL DEFAULT 0,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (agent_id, key)
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                trigger TEXT NOT NULL,
                git_commit TEXT NOT NULL,
                state_snapshot_path TEXT NOT NULL,
                context_snapshot_path TEXT NOT NULL,
                snapshot_sha256 TEXT NOT NULL,
                context_sha256 TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS correction_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                attempt_number INTEGER NOT NULL,
                error_analysis TEXT NOT NULL,
                fix_description TEXT NOT NULL,
                outcome TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_task ON correction_attempts(task_id);

            CREATE TABLE IF NOT EXISTS run_lease (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );",
        )?;

        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> AppResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::database(format!("Failed to get connection: {}", e)))
    }

    /// Run `f` inside one transaction; any error rolls everything back.
    ///
    /// `f` must only use the connection it is handed.
    pub fn with_transaction<T>(
        &self,
        behavior: TransactionBehavior,
        f: impl FnOnce(&Connection) -> AppResult<T>,
    ) -> AppResult<T> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(behavior)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Insert new tasks in one transaction
    pub fn insert_tasks(&self, tasks: &[Task]) -> AppResult<()> {
        self.with_transaction(TransactionBehavior::Immediate, |conn| {
            for task in tasks {
                insert_task_row(conn, task)?;
            }
            Ok(())
        })
    }

    pub fn get_task(&self, id: i64) -> AppResult<Option<Task>> {
        let conn = self.get_connection()?;
        read_task(&conn, id)
    }

    pub fn list_tasks(&self) -> AppResult<Vec<Task>> {
        let conn = self.get_connection()?;
        read_tasks(&conn)
    }

    /// Atomically claim a pending task for an agent.
    ///
    /// Returns false when the task is no longer pending: another agent won the
    /// claim or the task was blocked or cancelled in the meantime.
    pub fn claim_task(&self, task_id: i64, agent_id: &str, at: DateTime<Utc>) -> AppResult<bool> {
        let conn = self.get_connection()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'in_progress', assigned_agent = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![task_id, agent_id, format_ts(&at)],
        )?;
        Ok(changed == 1)
    }

    /// Record pipeline progress (0..=100) of a task
    pub fn set_task_progress(&self, task_id: i64, progress: u8, at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "UPDATE tasks SET progress = ?2, updated_at = ?3 WHERE id = ?1",
            params![task_id, progress.min(100), format_ts(&at)],
        )?;
        Ok(())
    }

    // ========================================================================
    // Agent Operations
    // ========================================================================

    pub fn upsert_agent(&self, agent: &Agent) -> AppResult<()> {
        let conn = self.get_connection()?;
        upsert_agent_row(&conn, agent)
    }

    pub fn get_agent(&self, id: &str) -> AppResult<Option<Agent>> {
        let conn = self.get_connection()?;
        let result = conn.query_row(
            &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
            params![id],
            row_to_agent,
        );

        match result {
            Ok(agent) => Ok(Some(agent)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_agents(&self) -> AppResult<Vec<Agent>> {
        let conn = self.get_connection()?;
        read_agents(&conn)
    }

    pub fn delete_agent(&self, id: &str) -> AppResult<bool> {
        let conn = self.get_connection()?;
        let changed = conn.execute("DELETE FROM agents WHERE id = ?1", params![id])?;
        conn.execute("DELETE FROM context_items WHERE agent_id = ?1", params![id])?;
        Ok(changed == 1)
    }

    // ========================================================================
    // Blocker Operations
    // ========================================================================

    pub fn insert_blocker(&self, blocker: &NewBlocker) -> AppResult<Blocker> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO blockers (agent_id, task_id, blocker_type, question, status, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5, ?6)",
            params![
                blocker.agent_id,
                blocker.task_id,
                blocker.blocker_type.as_str(),
                blocker.question,
                format_ts(&blocker.created_at),
                format_ts(&blocker.expires_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Blocker {
            id,
            agent_id: blocker.agent_id.clone(),
            task_id: blocker.task_id,
            blocker_type: blocker.blocker_type,
            question: blocker.question.clone(),
            answer: None,
            status: BlockerStatus::Pending,
            created_at: blocker.created_at,
            resolved_at: None,
            expires_at: blocker.expires_at,
        })
    }

    pub fn get_blocker(&self, id: i64) -> AppResult<Option<Blocker>> {
        let conn = self.get_connection()?;
        read_blocker(&conn, id)
    }

    /// List blockers matching the filter, oldest first
    pub fn list_blockers(&self, filter: &BlockerFilter) -> AppResult<Vec<Blocker>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(blocker_type) = filter.blocker_type {
            values.push(Value::Text(blocker_type.as_str().to_string()));
            clauses.push(format!("blocker_type = ?{}", values.len()));
        }
        if let Some(task_id) = filter.task_id {
            values.push(Value::Integer(task_id));
            clauses.push(format!("task_id = ?{}", values.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM blockers {} ORDER BY created_at ASC, id ASC",
            BLOCKER_COLUMNS, where_clause
        ))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_blocker)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// PENDING → RESOLVED; false when the blocker is missing or already terminal
    pub fn resolve_blocker(&self, id: i64, answer: &str, at: DateTime<Utc>) -> AppResult<bool> {
        let conn = self.get_connection()?;
        let changed = conn.execute(
            "UPDATE blockers SET status = 'RESOLVED', answer = ?2, resolved_at = ?3
             WHERE id = ?1 AND status = 'PENDING'",
            params![id, answer, format_ts(&at)],
        )?;
        Ok(changed == 1)
    }

    /// PENDING → EXPIRED; false when the blocker is missing or already terminal
    pub fn expire_blocker(&self, id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        let conn = self.get_connection()?;
        let changed = conn.execute(
            "UPDATE blockers SET status = 'EXPIRED', resolved_at = ?2
             WHERE id = ?1 AND status = 'PENDING'",
            params![id, format_ts(&at)],
        )?;
        Ok(changed == 1)
    }

    /// Pending blockers whose expiry deadline is at or before `now`
    pub fn due_blockers(&self, now: DateTime<Utc>) -> AppResult<Vec<Blocker>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM blockers WHERE status = 'PENDING' AND expires_at <= ?1
             ORDER BY expires_at ASC, id ASC",
            BLOCKER_COLUMNS
        ))?;
        let rows = stmt.query_map(params![format_ts(&now)], row_to_blocker)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Ids of tasks carrying a PENDING SYNC blocker
    pub fn pending_sync_task_ids(&self) -> AppResult<HashSet<i64>> {
        let conn = self.get_connection()?;
        pending_sync_task_ids(&conn)
    }

    // ========================================================================
    // Context Operations
    // ========================================================================

    pub fn upsert_context_item(&self, item: &ContextItem) -> AppResult<()> {
        let conn = self.get_connection()?;
        upsert_context_row(&conn, item)
    }

    pub fn delete_context_item(&self, agent_id: &str, key: &str) -> AppResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "DELETE FROM context_items WHERE agent_id = ?1 AND key = ?2",
            params![agent_id, key],
        )?;
        Ok(())
    }

    pub fn load_context_items(&self, agent_id: &str) -> AppResult<Vec<ContextItem>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM context_items WHERE agent_id = ?1 ORDER BY key",
            CONTEXT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![agent_id], row_to_context_item)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ========================================================================
    // Checkpoint Operations
    // ========================================================================

    pub fn insert_checkpoint(&self, checkpoint: &NewCheckpoint) -> AppResult<Checkpoint> {
        let created_at = Utc::now();
        let metadata = serde_json::to_string(&checkpoint.metadata)?;
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO checkpoints (name, description, trigger, git_commit, state_snapshot_path,
                 context_snapshot_path, snapshot_sha256, context_sha256, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                checkpoint.name,
                checkpoint.description,
                checkpoint.trigger.as_str(),
                checkpoint.git_commit,
                checkpoint.state_snapshot_path,
                checkpoint.context_snapshot_path,
                checkpoint.snapshot_sha256,
                checkpoint.context_sha256,
                metadata,
                format_ts(&created_at),
            ],
        )?;
        Ok(Checkpoint {
            id: conn.last_insert_rowid(),
            name: checkpoint.name.clone(),
            description: checkpoint.description.clone(),
            trigger: checkpoint.trigger,
            git_commit: checkpoint.git_commit.clone(),
            state_snapshot_path: checkpoint.state_snapshot_path.clone(),
            context_snapshot_path: checkpoint.context_snapshot_path.clone(),
            snapshot_sha256: checkpoint.snapshot_sha256.clone(),
            context_sha256: checkpoint.context_sha256.clone(),
            metadata: checkpoint.metadata.clone(),
            created_at,
        })
    }

    pub fn get_checkpoint(&self, id: i64) -> AppResult<Option<Checkpoint>> {
        let conn = self.get_connection()?;
        let result = conn.query_row(
            &format!("SELECT {} FROM checkpoints WHERE id = ?1", CHECKPOINT_COLUMNS),
            params![id],
            row_to_checkpoint,
        );

        match result {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List checkpoints, newest first
    pub fn list_checkpoints(&self) -> AppResult<Vec<Checkpoint>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM checkpoints ORDER BY created_at DESC, id DESC",
            CHECKPOINT_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_checkpoint)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete_checkpoint(&self, id: i64) -> AppResult<bool> {
        let conn = self.get_connection()?;
        let changed = conn.execute("DELETE FROM checkpoints WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    }

    // ========================================================================
    // Correction Attempt Operations
    // ========================================================================

    pub fn insert_correction_attempt(
        &self,
        attempt: &NewCorrectionAttempt,
    ) -> AppResult<CorrectionAttempt> {
        let created_at = Utc::now();
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO correction_attempts (task_id, attempt_number, error_analysis,
                 fix_description, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                attempt.task_id,
                attempt.attempt_number,
                attempt.error_analysis,
                attempt.fix_description,
                attempt.outcome.as_str(),
                format_ts(&created_at),
            ],
        )?;
        Ok(CorrectionAttempt {
            id: conn.last_insert_rowid(),
            task_id: attempt.task_id,
            attempt_number: attempt.attempt_number,
            error_analysis: attempt.error_analysis.clone(),
            fix_description: attempt.fix_description.clone(),
            outcome: attempt.outcome,
            created_at,
        })
    }

    /// Full correction history of a task, in recording order
    pub fn correction_history(&self, task_id: i64) -> AppResult<Vec<CorrectionAttempt>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM correction_attempts WHERE task_id = ?1 ORDER BY id",
            ATTEMPT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![task_id], row_to_attempt)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ========================================================================
    // Run Lease Operations
    // ========================================================================

    /// Take the project's single run lease for `holder`.
    ///
    /// Succeeds when nobody holds it, when `holder` already does, or when the
    /// current holder's heartbeat is older than `ttl`.
    pub fn acquire_run_lease(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let cutoff = now - lease_ttl(ttl)?;
        let conn = self.get_connection()?;
        let changed = conn.execute(
            "INSERT INTO run_lease (id, holder, heartbeat_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET holder = excluded.holder,
                 heartbeat_at = excluded.heartbeat_at
             WHERE run_lease.holder = excluded.holder OR run_lease.heartbeat_at < ?3",
            params![holder, format_ts(&now), format_ts(&cutoff)],
        )?;
        Ok(changed == 1)
    }

    /// Refresh the heartbeat; false when `holder` no longer owns the lease
    pub fn renew_run_lease(&self, holder: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let conn = self.get_connection()?;
        let changed = conn.execute(
            "UPDATE run_lease SET heartbeat_at = ?2 WHERE id = 1 AND holder = ?1",
            params![holder, format_ts(&now)],
        )?;
        Ok(changed == 1)
    }

    pub fn release_run_lease(&self, holder: &str) -> AppResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "DELETE FROM run_lease WHERE id = 1 AND holder = ?1",
            params![holder],
        )?;
        Ok(())
    }

    /// Holder of a lease whose heartbeat is younger than `ttl`
    pub fn active_run_lease(&self, ttl: Duration, now: DateTime<Utc>) -> AppResult<Option<String>> {
        let cutoff = now - lease_ttl(ttl)?;
        let conn = self.get_connection()?;
        let result = conn.query_row(
            "SELECT holder FROM run_lease WHERE id = 1 AND heartbeat_at >= ?1",
            params![format_ts(&cutoff)],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(holder) => Ok(Some(holder)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Counter bumped every time the whole state is replaced by a restore
    pub fn state_epoch(&self) -> AppResult<u64> {
        let conn = self.get_connection()?;
        read_epoch(&conn)
    }

    // ========================================================================
    // Snapshot Operations
    // ========================================================================

    /// Consistent read of all orchestration state
    pub fn export_state(&self) -> AppResult<StateSnapshot> {
        self.with_transaction(TransactionBehavior::Deferred, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM blockers ORDER BY id",
                BLOCKER_COLUMNS
            ))?;
            let blockers = stmt
                .query_map([], row_to_blocker)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM correction_attempts ORDER BY id",
                ATTEMPT_COLUMNS
            ))?;
            let correction_attempts = stmt
                .query_map([], row_to_attempt)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(StateSnapshot {
                tasks: read_tasks(conn)?,
                agents: read_agents(conn)?,
                blockers,
                correction_attempts,
            })
        })
    }

    /// All context items of all agents
    pub fn export_context(&self) -> AppResult<ContextSnapshot> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM context_items ORDER BY agent_id, key",
            CONTEXT_COLUMNS
        ))?;
        let items = stmt
            .query_map([], row_to_context_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ContextSnapshot { items })
    }

    /// Replace all orchestration state with a snapshot and bump the state
    /// epoch; returns the new epoch.
    ///
    /// Runs inside one exclusive transaction: either every table is replaced or
    /// none is.
    pub fn import_state(&self, state: &StateSnapshot, context: &ContextSnapshot) -> AppResult<u64> {
        self.with_transaction(TransactionBehavior::Exclusive, |conn| {
            conn.execute_batch(
                "DELETE FROM tasks;
                 DELETE FROM agents;
                 DELETE FROM blockers;
                 DELETE FROM correction_attempts;
                 DELETE FROM context_items;",
            )?;
            for task in &state.tasks {
                insert_task_row(conn, task)?;
            }
            for agent in &state.agents {
                upsert_agent_row(conn, agent)?;
            }
            for blocker in &state.blockers {
                insert_blocker_row(conn, blocker)?;
            }
            for attempt in &state.correction_attempts {
                insert_attempt_row(conn, attempt)?;
            }
            for item in &context.items {
                upsert_context_row(conn, item)?;
            }
            let epoch = read_epoch(conn)? + 1;
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('state_epoch', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![epoch as i64],
            )?;
            Ok(epoch)
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool_size", &self.pool.state().connections)
            .finish()
    }
}

// ============================================================================
// Connection-level helpers
//
// Usable inside `Database::with_transaction` closures, where only the
// transaction's connection may be touched.
// ============================================================================

/// Timestamps are stored as fixed-width RFC 3339 UTC text so that string
/// comparison orders them chronologically.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn read_task(conn: &Connection, id: i64) -> AppResult<Option<Task>> {
    let result = conn.query_row(
        &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
        params![id],
        row_to_task,
    );

    match result {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn read_tasks(conn: &Connection) -> AppResult<Vec<Task>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks ORDER BY id", TASK_COLUMNS))?;
    let rows = stmt.query_map([], row_to_task)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Persist every mutable column of a task
pub fn write_task(conn: &Connection, task: &Task) -> AppResult<()> {
    let changed = conn.execute(
        "UPDATE tasks SET status = ?2, assigned_agent = ?3, blocked_by = ?4, progress = ?5,
             explanation = ?6, error = ?7, modified_files = ?8, updated_at = ?9, completed_at = ?10
         WHERE id = ?1",
        params![
            task.id,
            task.status.as_str(),
            task.assigned_agent,
            serde_json::to_string(&task.blocked_by)?,
            task.progress,
            task.explanation,
            task.error,
            serde_json::to_string(&task.modified_files)?,
            format_ts(&task.updated_at),
            task.completed_at.as_ref().map(format_ts),
        ],
    )?;
    if changed == 0 {
        return Err(AppError::not_found(format!("Task {} not found", task.id)));
    }
    Ok(())
}

pub fn read_blocker(conn: &Connection, id: i64) -> AppResult<Option<Blocker>> {
    let result = conn.query_row(
        &format!("SELECT {} FROM blockers WHERE id = ?1", BLOCKER_COLUMNS),
        params![id],
        row_to_blocker,
    );

    match result {
        Ok(blocker) => Ok(Some(blocker)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn pending_sync_task_ids(conn: &Connection) -> AppResult<HashSet<i64>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT task_id FROM blockers WHERE status = 'PENDING' AND blocker_type = 'SYNC'",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    Ok(rows.collect::<Result<HashSet<_>, _>>()?)
}

fn read_epoch(conn: &Connection) -> AppResult<u64> {
    let result = conn.query_row(
        "SELECT value FROM meta WHERE key = 'state_epoch'",
        [],
        |row| row.get::<_, i64>(0),
    );
    match result {
        Ok(value) => Ok(value.max(0) as u64),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn lease_ttl(ttl: Duration) -> AppResult<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| AppError::validation(format!("Invalid lease ttl: {}", e)))
}

fn read_agents(conn: &Connection) -> AppResult<Vec<Agent>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM agents ORDER BY id", AGENT_COLUMNS))?;
    let rows = stmt.query_map([], row_to_agent)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn insert_task_row(conn: &Connection, task: &Task) -> AppResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            TASK_COLUMNS
        ),
        params![
            task.id,
            task.title,
            task.description,
            task.status.as_str(),
            serde_json::to_string(&task.dependencies)?,
            task.priority,
            task.workflow_step,
            task.agent_type.as_str(),
            task.assigned_agent,
            serde_json::to_string(&task.blocked_by)?,
            task.progress,
            task.explanation,
            task.error,
            serde_json::to_string(&task.modified_files)?,
            format_ts(&task.created_at),
            format_ts(&task.updated_at),
            task.completed_at.as_ref().map(format_ts),
        ],
    )?;
    Ok(())
}

fn upsert_agent_row(conn: &Connection, agent: &Agent) -> AppResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO agents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET status = ?3, current_task = ?4,
                 context_token_usage = ?5, tasks_completed = ?6, last_update = ?7",
            AGENT_COLUMNS
        ),
        params![
            agent.id,
            agent.agent_type.as_str(),
            agent.status.as_str(),
            agent.current_task,
            agent.context_token_usage as i64,
            agent.tasks_completed,
            format_ts(&agent.last_update),
        ],
    )?;
    Ok(())
}

fn insert_blocker_row(conn: &Connection, blocker: &Blocker) -> AppResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO blockers ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            BLOCKER_COLUMNS
        ),
        params![
            blocker.id,
            blocker.agent_id,
            blocker.task_id,
            blocker.blocker_type.as_str(),
            blocker.question,
            blocker.answer,
            blocker.status.as_str(),
            format_ts(&blocker.created_at),
            blocker.resolved_at.as_ref().map(format_ts),
            format_ts(&blocker.expires_at),
        ],
    )?;
    Ok(())
}

fn insert_attempt_row(conn: &Connection, attempt: &CorrectionAttempt) -> AppResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO correction_attempts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            ATTEMPT_COLUMNS
        ),
        params![
            attempt.id,
            attempt.task_id,
            attempt.attempt_number,
            attempt.error_analysis,
            attempt.fix_description,
            attempt.outcome.as_str(),
            format_ts(&attempt.created_at),
        ],
    )?;
    Ok(())
}

fn upsert_context_row(conn: &Connection, item: &ContextItem) -> AppResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO context_items ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(agent_id, key) DO UPDATE SET content = ?3, tier = ?4, token_count = ?5,
                 importance_score = ?6, pinned = ?7, access_count = ?8, last_accessed = ?9",
            CONTEXT_COLUMNS
        ),
        params![
            item.agent_id,
            item.key,
            item.content,
            item.tier.as_str(),
            item.token_count,
            item.importance_score,
            item.pinned,
            item.access_count,
            format_ts(&item.last_accessed),
            format_ts(&item.created_at),
        ],
    )?;
    Ok(())
}

// ============================================================================
// Row mapping
// ============================================================================

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn ts_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn enum_column<T>(row: &Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown value '{}'", raw)))
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: enum_column(row, 3, TaskStatus::from_str)?,
        dependencies: json_column(row, 4)?,
        priority: row.get(5)?,
        workflow_step: row.get(6)?,
        agent_type: enum_column(row, 7, AgentType::from_str)?,
        assigned_agent: row.get(8)?,
        blocked_by: json_column(row, 9)?,
        progress: row.get(10)?,
        explanation: row.get(11)?,
        error: row.get(12)?,
        modified_files: json_column(row, 13)?,
        created_at: ts_column(row, 14)?,
        updated_at: ts_column(row, 15)?,
        completed_at: opt_ts_column(row, 16)?,
    })
}

fn row_to_agent(row: &Row) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        agent_type: enum_column(row, 1, AgentType::from_str)?,
        status: enum_column(row, 2, AgentStatus::from_str)?,
        current_task: row.get(3)?,
        context_token_usage: row.get::<_, i64>(4)?.max(0) as u64,
        tasks_completed: row.get(5)?,
        last_update: ts_column(row, 6)?,
    })
}

fn row_to_blocker(row: &Row) -> rusqlite::Result<Blocker> {
    Ok(Blocker {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        task_id: row.get(2)?,
        blocker_type: enum_column(row, 3, BlockerType::from_str)?,
        question: row.get(4)?,
        answer: row.get(5)?,
        status: enum_column(row, 6, BlockerStatus::from_str)?,
        created_at: ts_column(row, 7)?,
        resolved_at: opt_ts_column(row, 8)?,
        expires_at: ts_column(row, 9)?,
    })
}

fn row_to_context_item(row: &Row) -> rusqlite::Result<ContextItem> {
    Ok(ContextItem {
        agent_id: row.get(0)?,
        key: row.get(1)?,
        content: row.get(2)?,
        tier: enum_column(row, 3, ContextTier::from_str)?,
        token_count: row.get(4)?,
        importance_score: row.get(5)?,
        pinned: row.get(6)?,
        access_count: row.get(7)?,
        last_accessed: ts_column(row, 8)?,
        created_at: ts_column(row, 9)?,
    })
}

fn row_to_checkpoint(row: &Row) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        trigger: enum_column(row, 3, CheckpointTrigger::from_str)?,
        git_commit: row.get(4)?,
        state_snapshot_path: row.get(5)?,
        context_snapshot_path: row.get(6)?,
        snapshot_sha256: row.get(7)?,
        context_sha256: row.get(8)?,
        metadata: json_column(row, 9)?,
        created_at: ts_column(row, 10)?,
    })
}

fn row_to_attempt(row: &Row) -> rusqlite::Result<CorrectionAttempt> {
    Ok(CorrectionAttempt {
        id: row.get(0)?,
        task_id: row.get(1)?,
        attempt_number: row.get(2)?,
        error_analysis: row.get(3)?,
        fix_description: row.get(4)?,
        outcome: enum_column(row, 5, CorrectionOutcome::from_str)?,
        created_at: ts_column(row, 6)?,
    })
}
