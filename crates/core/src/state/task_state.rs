//! # Task State Management
//!
//! Task rows in SQLite. Every mutation that can race with another execution
//! is a single guarded `UPDATE`: a claim only succeeds when the row is still
//! at the revision the caller read and unleased, and a finish only lands
//! while the claimant still holds the lease. Every write bumps `revision`.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

use super::db::KataDb;
use crate::kata::CompiledKata;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Waiting,
    WaitingForEvent,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::WaitingForEvent => "waiting_for_event",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "waiting_for_event" => Some(Self::WaitingForEvent),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// The legal edges of the task state machine
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;

        match (self, next) {
            (from, Canceled) => !from.is_terminal(),
            (Pending, Running) => true,
            (Running, Running | Waiting | WaitingForEvent | Completed | Failed | Pending) => true,
            (Waiting, Running | Failed) => true,
            (WaitingForEvent, Running) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One running or finished instance of a kata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub kata_name: String,
    pub kata_version: u32,
    pub state: TaskState,
    pub current_phase: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    /// Last failure message, only set once the task has failed
    #[serde(default)]
    pub error: Option<String>,
    /// Failed attempts of the current phase (or its child)
    #[serde(default)]
    pub attempt: u32,
    /// Backoff gate: not claimable before this instant
    #[serde(default)]
    pub run_after: Option<DateTime<Utc>>,
    /// Child task id or event topic the task is blocked on
    #[serde(default)]
    pub waiting_on: Option<String>,
    /// Bumped by every write to the row
    #[serde(default)]
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A fresh `pending` task at the kata's initial phase
    pub fn new(kata: &CompiledKata, variables: Map<String, Value>, parent: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kata_name: kata.name.clone(),
            kata_version: kata.version,
            state: TaskState::Pending,
            current_phase: kata.initial_phase.clone(),
            variables,
            parent_task_id: parent,
            error: None,
            attempt: 0,
            run_after: None,
            waiting_on: None,
            revision: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Shallow merge, last write wins per key
    pub fn merge_variables(&mut self, partial: Map<String, Value>) {
        for (key, value) in partial {
            self.variables.insert(key, value);
        }
    }
}

/// Result of a guarded variable update
#[derive(Debug)]
pub enum VariablesUpdate {
    Updated(Task),
    /// The task already reached a terminal state
    Terminal(TaskState),
    /// A phase execution holds the task right now
    Busy,
    NotFound,
}

/// Fixed-width timestamp so that text comparison in SQL orders correctly
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

const TASK_COLUMNS: &str = "id, kata_name, kata_version, state, current_phase, variables_json, \
    parent_task_id, error, attempt, run_after, waiting_on, created_at, started_at, completed_at, updated_at, \
    revision";

/// SQLite-backed task store
#[derive(Clone)]
pub struct TaskStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    pub fn new(db: &KataDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Persist a newly spawned task
    pub fn insert(&self, task: &Task) -> Result<()> {
        let variables = serde_json::to_string(&task.variables)?;
        let conn = KataDb::lock(&self.conn)?;

        conn.execute(
            &format!(
                "INSERT INTO tasks ({}, lease) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, NULL)",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.kata_name,
                task.kata_version,
                task.state.as_str(),
                task.current_phase,
                variables,
                task.parent_task_id,
                task.error,
                task.attempt,
                task.run_after.as_ref().map(ts),
                task.waiting_on,
                ts(&task.created_at),
                task.started_at.as_ref().map(ts),
                task.completed_at.as_ref().map(ts),
                ts(&task.updated_at),
                task.revision,
            ],
        )
        .with_context(|| format!("Failed to insert task {}", task.id))?;

        Ok(())
    }

    /// Load a task by ID
    pub fn load(&self, id: &str) -> Result<Option<Task>> {
        let conn = KataDb::lock(&self.conn)?;

        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            Self::row_to_task,
        )
        .optional()
        .with_context(|| format!("Failed to load task {}", id))
    }

    /// Atomically take the execution lease.
    ///
    /// Succeeds only if the row is still at `revision`, in `from`, unleased,
    /// and past its backoff gate. On success the row moves to `to`, carries
    /// `token` and is one revision further on.
    pub fn claim(
        &self,
        id: &str,
        from: TaskState,
        to: TaskState,
        revision: i64,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = KataDb::lock(&self.conn)?;
        let now = ts(&now);

        let affected = conn.execute(
            r#"
            UPDATE tasks SET
                state = ?1,
                lease = ?2,
                started_at = COALESCE(started_at, ?3),
                updated_at = ?3,
                revision = revision + 1
            WHERE id = ?4
              AND state = ?5
              AND revision = ?6
              AND lease IS NULL
              AND (run_after IS NULL OR run_after <= ?3)
            "#,
            params![to.as_str(), token, now, id, from.as_str(), revision],
        )?;

        Ok(affected == 1)
    }

    /// Write back a claimed task and release the lease.
    ///
    /// Returns `false` when the lease is gone, i.e. the task was cancelled
    /// while the phase was executing; nothing is written in that case.
    pub fn finish(&self, task: &Task, token: &str, consume_resumption: bool) -> Result<bool> {
        let variables = serde_json::to_string(&task.variables)?;
        let mut conn = KataDb::lock(&self.conn)?;
        let tx = conn.transaction()?;

        let affected = tx.execute(
            r#"
            UPDATE tasks SET
                state = ?1,
                current_phase = ?2,
                variables_json = ?3,
                error = ?4,
                attempt = ?5,
                run_after = ?6,
                waiting_on = ?7,
                started_at = ?8,
                completed_at = ?9,
                updated_at = ?10,
                lease = NULL,
                revision = revision + 1
            WHERE id = ?11 AND lease = ?12
            "#,
            params![
                task.state.as_str(),
                task.current_phase,
                variables,
                task.error,
                task.attempt,
                task.run_after.as_ref().map(ts),
                task.waiting_on,
                task.started_at.as_ref().map(ts),
                task.completed_at.as_ref().map(ts),
                ts(&task.updated_at),
                task.id,
                token,
            ],
        )?;

        if affected == 1 && consume_resumption {
            tx.execute("DELETE FROM resumptions WHERE task_id = ?1", params![task.id])?;
        }
        tx.commit()?;

        Ok(affected == 1)
    }

    /// Drop the lease without writing the task back
    pub fn release_lease(&self, id: &str, token: &str) -> Result<bool> {
        let conn = KataDb::lock(&self.conn)?;
        let affected = conn.execute(
            "UPDATE tasks SET lease = NULL, revision = revision + 1 WHERE id = ?1 AND lease = ?2",
            params![id, token],
        )?;
        Ok(affected == 1)
    }

    /// Cancel a task observed in `expected`; drops any lease and queued resumption
    pub fn cancel(&self, id: &str, expected: TaskState, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = KataDb::lock(&self.conn)?;
        let tx = conn.transaction()?;
        let now = ts(&now);

        let affected = tx.execute(
            r#"
            UPDATE tasks SET
                state = 'canceled',
                lease = NULL,
                run_after = NULL,
                completed_at = ?1,
                updated_at = ?1,
                revision = revision + 1
            WHERE id = ?2 AND state = ?3
              AND state NOT IN ('completed', 'failed', 'canceled')
            "#,
            params![now, id, expected.as_str()],
        )?;

        if affected == 1 {
            tx.execute("DELETE FROM resumptions WHERE task_id = ?1", params![id])?;
        }
        tx.commit()?;

        Ok(affected == 1)
    }

    /// Merge variables into an idle, non-terminal task
    pub fn update_variables(&self, id: &str, partial: Map<String, Value>) -> Result<VariablesUpdate> {
        let conn = KataDb::lock(&self.conn)?;

        let row = conn
            .query_row(
                &format!("SELECT {}, lease FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                |row| Ok((Self::row_to_task(row)?, row.get::<_, Option<String>>(16)?)),
            )
            .optional()?;

        let (mut task, lease) = match row {
            Some(found) => found,
            None => return Ok(VariablesUpdate::NotFound),
        };
        if task.is_terminal() {
            return Ok(VariablesUpdate::Terminal(task.state));
        }
        if lease.is_some() {
            return Ok(VariablesUpdate::Busy);
        }

        task.merge_variables(partial);
        task.updated_at = Utc::now();
        let variables = serde_json::to_string(&task.variables)?;

        let affected = conn.execute(
            r#"
            UPDATE tasks SET
                variables_json = ?1,
                updated_at = ?2,
                revision = revision + 1
            WHERE id = ?3 AND lease IS NULL AND revision = ?4
            "#,
            params![variables, ts(&task.updated_at), id, task.revision],
        )?;
        task.revision += 1;

        if affected == 1 {
            Ok(VariablesUpdate::Updated(task))
        } else {
            Ok(VariablesUpdate::Busy)
        }
    }

    /// Tasks a poll cycle should try to claim
    pub fn list_runnable(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = KataDb::lock(&self.conn)?;

        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE lease IS NULL AND (
                (state IN ('pending', 'running') AND (run_after IS NULL OR run_after <= ?1))
                OR (state IN ('waiting', 'waiting_for_event')
                    AND id IN (SELECT task_id FROM resumptions))
            )
            ORDER BY created_at ASC
            "#,
            TASK_COLUMNS
        ))?;

        let tasks = stmt
            .query_map(params![ts(&now)], Self::row_to_task)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list runnable tasks")?;

        Ok(tasks)
    }

    /// List tasks by state
    pub fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE state = ?1 ORDER BY created_at ASC",
                TASK_COLUMNS
            ),
            params![state.as_str()],
        )
    }

    /// Direct children of a task, oldest first
    pub fn list_children(&self, parent_id: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE parent_task_id = ?1 ORDER BY created_at ASC",
                TASK_COLUMNS
            ),
            params![parent_id],
        )
    }

    /// Tasks blocked on an external event topic
    pub fn list_waiting_for_event(&self, topic: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE state = 'waiting_for_event' AND waiting_on = ?1 ORDER BY created_at ASC",
                TASK_COLUMNS
            ),
            params![topic],
        )
    }

    /// Drop every lease; only safe while no executor is running
    pub fn release_leases(&self) -> Result<usize> {
        let conn = KataDb::lock(&self.conn)?;
        let released = conn.execute(
            "UPDATE tasks SET lease = NULL, revision = revision + 1 WHERE lease IS NOT NULL",
            [],
        )?;
        if released > 0 {
            tracing::warn!(released, "Released stale task leases");
        }
        Ok(released)
    }

    fn query_tasks(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Task>> {
        let conn = KataDb::lock(&self.conn)?;
        let mut stmt = conn.prepare(sql)?;
        let tasks = stmt
            .query_map(params, Self::row_to_task)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query tasks")?;
        Ok(tasks)
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let state: String = row.get(3)?;
        let variables_json: String = row.get(5)?;

        Ok(Task {
            id: row.get(0)?,
            kata_name: row.get(1)?,
            kata_version: row.get(2)?,
            state: TaskState::parse(&state).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    Type::Text,
                    format!("unknown task state '{}'", state).into(),
                )
            })?,
            current_phase: row.get(4)?,
            variables: serde_json::from_str(&variables_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
            })?,
            parent_task_id: row.get(6)?,
            error: row.get(7)?,
            attempt: row.get(8)?,
            run_after: parse_ts(row.get(9)?),
            waiting_on: row.get(10)?,
            created_at: parse_ts(row.get(11)?).unwrap_or_else(Utc::now),
            started_at: parse_ts(row.get(12)?),
            completed_at: parse_ts(row.get(13)?),
            updated_at: parse_ts(row.get(14)?).unwrap_or_else(Utc::now),
            revision: row.get(15)?,
        })
    }
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kata::compile;
    use serde_json::json;

    fn fixture() -> (TaskStore, Task) {
        let db = KataDb::open_in_memory().unwrap();
        let kata = compile("kata audit v1\ninitial a\nphase a\n run skill x\n complete\n").unwrap();
        let store = TaskStore::new(&db);
        let task = Task::new(&kata, Map::new(), None);
        store.insert(&task).unwrap();
        (store, task)
    }

    #[test]
    fn test_task_state_serialization() {
        let json = serde_json::to_string(&TaskState::WaitingForEvent).unwrap();
        assert_eq!(json, "\"waiting_for_event\"");
        assert_eq!(TaskState::parse("waiting_for_event"), Some(TaskState::WaitingForEvent));
        assert_eq!(TaskState::parse("sleeping"), None);
    }

    #[test]
    fn test_transition_edges() {
        use TaskState::*;

        assert!(Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Pending));
        assert!(Waiting.can_transition_to(Failed));
        assert!(!WaitingForEvent.can_transition_to(Failed));
        for state in [Pending, Running, Waiting, WaitingForEvent] {
            assert!(state.can_transition_to(Canceled));
        }
        for terminal in [Completed, Failed, Canceled] {
            for next in [Pending, Running, Waiting, WaitingForEvent, Completed, Failed, Canceled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_insert_and_load_round_trip() {
        let (store, task) = fixture();
        let loaded = store.load(&task.id).unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.state, TaskState::Pending);
        assert_eq!(loaded.current_phase, "a");
        assert!(store.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (store, task) = fixture();
        let now = Utc::now();

        assert!(store
            .claim(&task.id, TaskState::Pending, TaskState::Running, 0, "t1", now)
            .unwrap());
        assert!(!store
            .claim(&task.id, TaskState::Pending, TaskState::Running, 0, "t2", now)
            .unwrap());
        assert!(!store
            .claim(&task.id, TaskState::Running, TaskState::Running, 1, "t2", now)
            .unwrap());

        let claimed = store.load(&task.id).unwrap().unwrap();
        assert_eq!(claimed.state, TaskState::Running);
        assert_eq!(claimed.revision, 1);
        assert!(claimed.started_at.is_some());
    }

    #[test]
    fn test_finish_requires_lease() {
        let (store, mut task) = fixture();
        store
            .claim(&task.id, TaskState::Pending, TaskState::Running, 0, "t1", Utc::now())
            .unwrap();

        task.state = TaskState::Completed;
        assert!(!store.finish(&task, "other", false).unwrap());
        assert!(store.finish(&task, "t1", false).unwrap());
        assert_eq!(store.load(&task.id).unwrap().unwrap().state, TaskState::Completed);
    }

    #[test]
    fn test_run_after_gates_claim_and_listing() {
        let (store, mut task) = fixture();
        let now = Utc::now();
        store
            .claim(&task.id, TaskState::Pending, TaskState::Running, 0, "t1", now)
            .unwrap();

        task.state = TaskState::Pending;
        task.run_after = Some(now + chrono::Duration::seconds(60));
        store.finish(&task, "t1", false).unwrap();

        assert!(store.list_runnable(now).unwrap().is_empty());
        assert!(!store
            .claim(&task.id, TaskState::Pending, TaskState::Running, 2, "t2", now)
            .unwrap());

        let later = now + chrono::Duration::seconds(61);
        assert_eq!(store.list_runnable(later).unwrap().len(), 1);
        assert!(store
            .claim(&task.id, TaskState::Pending, TaskState::Running, 2, "t2", later)
            .unwrap());
    }

    #[test]
    fn test_claim_rejects_stale_revision() {
        let (store, mut task) = fixture();
        let snapshot = store.load(&task.id).unwrap().unwrap();

        // Another execution claims, fails with an immediate retry and puts the
        // row back in `pending`, unleased
        assert!(store
            .claim(&task.id, TaskState::Pending, TaskState::Running, 0, "t1", Utc::now())
            .unwrap());
        task.attempt = 1;
        assert!(store.finish(&task, "t1", false).unwrap());

        let current = store.load(&task.id).unwrap().unwrap();
        assert_eq!(current.state, TaskState::Pending);
        assert_eq!(current.revision, 2);

        assert!(!store
            .claim(&task.id, snapshot.state, TaskState::Running, snapshot.revision, "t2", Utc::now())
            .unwrap());
        assert!(store
            .claim(&task.id, current.state, TaskState::Running, current.revision, "t2", Utc::now())
            .unwrap());
    }

    #[test]
    fn test_release_lease_requires_token() {
        let (store, task) = fixture();
        store
            .claim(&task.id, TaskState::Pending, TaskState::Running, 0, "t1", Utc::now())
            .unwrap();

        assert!(!store.release_lease(&task.id, "other").unwrap());
        assert!(store.release_lease(&task.id, "t1").unwrap());
        let released = store.load(&task.id).unwrap().unwrap();
        assert_eq!(released.revision, 2);
        assert!(store
            .claim(&task.id, TaskState::Running, TaskState::Running, 2, "t2", Utc::now())
            .unwrap());
    }

    #[test]
    fn test_cancel_discards_in_flight_finish() {
        let (store, mut task) = fixture();
        store
            .claim(&task.id, TaskState::Pending, TaskState::Running, 0, "t1", Utc::now())
            .unwrap();

        assert!(store.cancel(&task.id, TaskState::Running, Utc::now()).unwrap());

        task.state = TaskState::Completed;
        assert!(!store.finish(&task, "t1", false).unwrap());
        assert_eq!(store.load(&task.id).unwrap().unwrap().state, TaskState::Canceled);
        assert!(!store.cancel(&task.id, TaskState::Canceled, Utc::now()).unwrap());
    }

    #[test]
    fn test_update_variables_guards() {
        let (store, task) = fixture();
        let mut partial = Map::new();
        partial.insert("region".to_string(), json!("eu"));

        match store.update_variables(&task.id, partial.clone()).unwrap() {
            VariablesUpdate::Updated(t) => assert_eq!(t.variables["region"], "eu"),
            other => panic!("unexpected {:?}", other),
        }

        assert!(store
            .claim(&task.id, TaskState::Pending, TaskState::Running, 1, "t1", Utc::now())
            .unwrap());
        assert!(matches!(
            store.update_variables(&task.id, partial.clone()).unwrap(),
            VariablesUpdate::Busy
        ));

        store.cancel(&task.id, TaskState::Running, Utc::now()).unwrap();
        assert!(matches!(
            store.update_variables(&task.id, partial).unwrap(),
            VariablesUpdate::Terminal(TaskState::Canceled)
        ));
    }

    #[test]
    fn test_release_leases() {
        let (store, task) = fixture();
        store
            .claim(&task.id, TaskState::Pending, TaskState::Running, 0, "t1", Utc::now())
            .unwrap();
        assert!(store.list_runnable(Utc::now()).unwrap().is_empty());

        assert_eq!(store.release_leases().unwrap(), 1);
        assert_eq!(store.list_runnable(Utc::now()).unwrap().len(), 1);
    }
}
