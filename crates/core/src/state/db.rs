//! # Engine Database
//!
//! Single SQLite database holding compiled katas, task rows and the
//! resumption queue. Lives at `.kata/kata.db` unless configured otherwise.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Shared database handle for the kata and task stores
#[derive(Clone)]
pub struct KataDb {
    conn: Arc<Mutex<Connection>>,
}

impl KataDb {
    /// Open or create the database at `path`
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open kata database")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, one-shot CLI runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a shared connection for use by the stores
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Lock the connection for one statement batch
    pub(crate) fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
        conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// Run schema migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = Self::lock(&self.conn)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        Ok(())
    }

    /// Migration to version 1 - katas, tasks, resumption queue
    fn migrate_v1(conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS katas (
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                compiled_graph TEXT NOT NULL,
                source TEXT,
                registered_at TEXT NOT NULL,
                PRIMARY KEY (name, version)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                kata_name TEXT NOT NULL,
                kata_version INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                current_phase TEXT NOT NULL,
                variables_json TEXT NOT NULL DEFAULT '{}',
                parent_task_id TEXT,
                error TEXT,
                attempt INTEGER NOT NULL DEFAULT 0,
                run_after TEXT,
                waiting_on TEXT,
                lease TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 0
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS resumptions (
                task_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                outcome TEXT NOT NULL,
                payload_json TEXT NOT NULL DEFAULT 'null',
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_waiting_on ON tasks(waiting_on)",
            [],
        )?;

        tracing::info!("KataDb initialized with schema version {}", SCHEMA_VERSION);

        Ok(())
    }
}
