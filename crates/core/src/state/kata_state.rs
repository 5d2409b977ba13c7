//! # Kata Store
//!
//! Compiled katas keyed by `(name, version)`. The compiled graph is stored
//! as JSON next to the source text it was compiled from.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

use super::db::KataDb;
use crate::kata::{CompiledKata, KataKey};

/// SQLite-backed store of compiled katas
#[derive(Clone)]
pub struct KataStore {
    conn: Arc<Mutex<Connection>>,
}

impl KataStore {
    pub fn new(db: &KataDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Insert or overwrite the kata with the same name and version
    pub fn save(&self, kata: &CompiledKata, source: Option<&str>) -> Result<()> {
        let graph = serde_json::to_string(kata).context("Failed to serialize compiled kata")?;
        let conn = KataDb::lock(&self.conn)?;

        conn.execute(
            r#"
            INSERT INTO katas (name, version, compiled_graph, source, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(name, version) DO UPDATE SET
                compiled_graph = ?3,
                source = ?4,
                registered_at = ?5
            "#,
            params![kata.name, kata.version, graph, source, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed to save kata {}", kata.key()))?;

        Ok(())
    }

    /// Look up a compiled kata
    pub fn load(&self, name: &str, version: u32) -> Result<Option<CompiledKata>> {
        let conn = KataDb::lock(&self.conn)?;

        let graph: Option<String> = conn
            .query_row(
                "SELECT compiled_graph FROM katas WHERE name = ?1 AND version = ?2",
                params![name, version],
                |row| row.get(0),
            )
            .optional()?;

        graph
            .map(|g| {
                serde_json::from_str(&g)
                    .with_context(|| format!("Corrupt compiled graph for kata {} v{}", name, version))
            })
            .transpose()
    }

    /// Source text a kata was registered from, if it was kept
    pub fn source(&self, name: &str, version: u32) -> Result<Option<String>> {
        let conn = KataDb::lock(&self.conn)?;

        let source: Option<Option<String>> = conn
            .query_row(
                "SELECT source FROM katas WHERE name = ?1 AND version = ?2",
                params![name, version],
                |row| row.get(0),
            )
            .optional()?;

        Ok(source.flatten())
    }

    /// List the identities of all stored katas
    pub fn list(&self) -> Result<Vec<KataKey>> {
        let conn = KataDb::lock(&self.conn)?;

        let mut stmt = conn.prepare("SELECT name, version FROM katas ORDER BY name, version")?;
        let keys = stmt
            .query_map([], |row| Ok(KataKey::new(row.get::<_, String>(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list katas")?;

        Ok(keys)
    }
}
