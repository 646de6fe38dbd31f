//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The orchestrator goes through the `ResultStore` trait; it never
//! executes SQL directly.
//!
//! Record kinds live in submodules, each adding an `impl AnalysisStore`
//! block. Row-level helpers take a `&Connection` so the final
//! persistence write can run them inside one transaction.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, Row};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};

pub(crate) mod aggregate;
pub(crate) mod layer;
pub(crate) mod pattern;
mod run;
pub(crate) mod simulation;

pub use run::PipelineRunRow;

#[derive(Clone)]
pub struct AnalysisStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl AnalysisStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (:memory: ignores it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Open and migrate in one step.
    pub fn open_migrated(path: &str) -> EngineResult<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases this returns a new, isolated database.
    pub fn reopen(&self) -> EngineResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
            conn.execute_batch(include_str!("../../../migrations/002_patterns_simulation.sql"))?;
            conn.execute_batch(include_str!("../../../migrations/003_pipeline.sql"))?;
            Ok(())
        })
    }

    /// Lock the connection. A poisoned mutex is recovered: the SQLite
    /// connection itself is still usable.
    pub(crate) fn with_conn<F, R>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&Connection) -> EngineResult<R>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    // ── Topics ─────────────────────────────────────────────────

    pub fn topic_exists(&self, topic_id: &str) -> EngineResult<bool> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM topic WHERE topic_id = ?1",
                params![topic_id],
                |r| r.get(0),
            )?;
            Ok(n > 0)
        })
    }

    pub fn list_topics(&self) -> EngineResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT topic_id FROM topic ORDER BY topic_id")?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            let mut result = Vec::new();
            for r in rows {
                result.push(r?);
            }
            Ok(result)
        })
    }

    /// Delete a topic and, by cascade, every record it owns.
    pub fn delete_topic(&self, topic_id: &str) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM topic WHERE topic_id = ?1", params![topic_id])?;
            conn.execute("DELETE FROM topic_lock WHERE topic_id = ?1", params![topic_id])?;
            Ok(())
        })
    }
}

pub(crate) fn ensure_topic(conn: &Connection, topic_id: &str) -> EngineResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO topic (topic_id, created_at) VALUES (?1, ?2)",
        params![topic_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

// ── Column helpers ─────────────────────────────────────────────

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> EngineResult<String> {
    serde_json::to_string(value).map_err(EngineError::from)
}

pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn bool_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    Ok(row.get::<_, i64>(idx)? != 0)
}

pub(crate) fn usize_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<usize> {
    Ok(row.get::<_, i64>(idx)?.max(0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let store = AnalysisStore::in_memory().unwrap();
        store.migrate().unwrap();
        store.migrate().unwrap();
        assert!(store.list_topics().unwrap().is_empty());
    }

    #[test]
    fn reopen_in_memory_is_isolated() {
        let store = AnalysisStore::in_memory().unwrap();
        store.migrate().unwrap();
        store.with_conn(|c| ensure_topic(c, "t1")).unwrap();
        assert!(store.topic_exists("t1").unwrap());

        let other = store.reopen().unwrap();
        other.migrate().unwrap();
        assert!(!other.topic_exists("t1").unwrap());
    }
}
