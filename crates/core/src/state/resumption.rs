//! # Resumption Queue
//!
//! Blocked tasks are woken by message, not by callback: when a child task
//! finishes or an external event arrives, a row is queued here for the
//! waiting task. The poll cycle treats a `waiting`/`waiting_for_event` task
//! with a queued resumption as runnable and consumes the row when the
//! claimed execution finishes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::db::KataDb;
use super::task_state::{ts, TaskStore};

/// What woke the task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResumptionKind {
    Child,
    Event,
}

impl ResumptionKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Child => "child",
            Self::Event => "event",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "child" => Self::Child,
            _ => Self::Event,
        }
    }
}

/// How the awaited thing turned out
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResumptionOutcome {
    Completed,
    Failed,
    /// Child canceled by an operator; the parent fails without retrying
    Canceled,
}

impl ResumptionOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => Self::Completed,
        }
    }
}

/// A queued wake-up for one blocked task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resumption {
    pub task_id: String,
    pub kind: ResumptionKind,
    /// Child task id or event topic
    pub source: String,
    pub outcome: ResumptionOutcome,
    /// Child variables, failure message, or event payload
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Resumption {
    pub fn child(parent_id: &str, child_id: &str, outcome: ResumptionOutcome, payload: Value) -> Self {
        Self {
            task_id: parent_id.to_string(),
            kind: ResumptionKind::Child,
            source: child_id.to_string(),
            outcome,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn event(task_id: &str, topic: &str, payload: Value) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind: ResumptionKind::Event,
            source: topic.to_string(),
            outcome: ResumptionOutcome::Completed,
            payload,
            created_at: Utc::now(),
        }
    }
}

impl TaskStore {
    /// Queue a wake-up; a newer resumption for the same task replaces the old one
    pub fn enqueue_resumption(&self, resumption: &Resumption) -> Result<()> {
        let payload = serde_json::to_string(&resumption.payload)?;
        let conn = KataDb::lock(&self.conn)?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO resumptions (task_id, kind, source, outcome, payload_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                resumption.task_id,
                resumption.kind.as_str(),
                resumption.source,
                resumption.outcome.as_str(),
                payload,
                ts(&resumption.created_at),
            ],
        )
        .with_context(|| format!("Failed to queue resumption for task {}", resumption.task_id))?;

        Ok(())
    }

    /// The queued resumption for a task, if any
    pub fn resumption(&self, task_id: &str) -> Result<Option<Resumption>> {
        let conn = KataDb::lock(&self.conn)?;

        let row = conn
            .query_row(
                "SELECT task_id, kind, source, outcome, payload_json, created_at FROM resumptions WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(task_id, kind, source, outcome, payload, created_at)| {
            Ok(Resumption {
                task_id,
                kind: ResumptionKind::from_str(&kind),
                source,
                outcome: ResumptionOutcome::from_str(&outcome),
                payload: serde_json::from_str(&payload).context("Corrupt resumption payload")?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })
        .transpose()
    }

    /// Drop a resumption without running it
    pub fn discard_resumption(&self, task_id: &str) -> Result<()> {
        let conn = KataDb::lock(&self.conn)?;
        conn.execute("DELETE FROM resumptions WHERE task_id = ?1", params![task_id])?;
        Ok(())
    }
}
