//! Pipeline runs, topic locks and the event log.

use super::AnalysisStore;
use crate::{error::EngineResult, event::EventLogEntry};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRunRow {
    pub run_token: String,
    pub topic_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub outcome: Option<String>,
    pub summary: Option<String>,
}

impl AnalysisStore {
    // ── Topic lock ─────────────────────────────────────────────

    /// Compare-and-set: succeeds only when no live run holds the topic.
    ///
    /// A lock older than `lease` is stale and is taken over. Re-acquiring
    /// with the holder's own token renews the lease.
    pub fn try_lock_topic(
        &self,
        topic_id: &str,
        run_token: &str,
        lease: Duration,
    ) -> EngineResult<bool> {
        let now = Utc::now();
        let lease =
            chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(3650));
        let cutoff = now - lease;
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let stale = tx.execute(
                "DELETE FROM topic_lock
                 WHERE topic_id = ?1 AND run_token <> ?2 AND acquired_at < ?3",
                params![topic_id, run_token, lock_time(cutoff)],
            )?;
            if stale > 0 {
                log::warn!("topic {topic_id}: stale lock taken over by run {run_token}");
            }
            tx.execute(
                "INSERT INTO topic_lock (topic_id, run_token, acquired_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(topic_id) DO UPDATE SET acquired_at = excluded.acquired_at
                 WHERE topic_lock.run_token = excluded.run_token",
                params![topic_id, run_token, lock_time(now)],
            )?;
            let held = lock_holder(&tx, topic_id)?.as_deref() == Some(run_token);
            tx.commit()?;
            Ok(held)
        })
    }

    /// Release only if `run_token` still holds the lock.
    pub fn unlock_topic(&self, topic_id: &str, run_token: &str) -> EngineResult<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM topic_lock WHERE topic_id = ?1 AND run_token = ?2",
                params![topic_id, run_token],
            )?;
            Ok(n > 0)
        })
    }

    /// Drop the lock whoever holds it. For operators clearing up after a
    /// crashed run without waiting out the lease.
    pub fn force_release_topic_lock(&self, topic_id: &str) -> EngineResult<Option<String>> {
        self.with_conn(|conn| {
            let holder = lock_holder(conn, topic_id)?;
            conn.execute("DELETE FROM topic_lock WHERE topic_id = ?1", params![topic_id])?;
            if let Some(token) = &holder {
                log::warn!("topic {topic_id}: lock of run {token} force-released");
            }
            Ok(holder)
        })
    }

    pub fn topic_lock_holder(&self, topic_id: &str) -> EngineResult<Option<String>> {
        self.with_conn(|conn| lock_holder(conn, topic_id))
    }

    // ── Run records ────────────────────────────────────────────

    pub fn insert_run(&self, run_token: &str, topic_id: &str) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pipeline_run (run_token, topic_id, started_at) VALUES (?1, ?2, ?3)",
                params![run_token, topic_id, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn finish_run(&self, run_token: &str, outcome: &str, summary_json: &str) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pipeline_run SET finished_at = ?1, outcome = ?2, summary = ?3
                 WHERE run_token = ?4",
                params![Utc::now().to_rfc3339(), outcome, summary_json, run_token],
            )?;
            Ok(())
        })
    }

    pub fn runs_for_topic(&self, topic_id: &str) -> EngineResult<Vec<PipelineRunRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_token, topic_id, started_at, finished_at, outcome, summary
                 FROM pipeline_run WHERE topic_id = ?1
                 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map(params![topic_id], |r| {
                Ok(PipelineRunRow {
                    run_token: r.get(0)?,
                    topic_id: r.get(1)?,
                    started_at: r.get(2)?,
                    finished_at: r.get(3)?,
                    outcome: r.get(4)?,
                    summary: r.get(5)?,
                })
            })?;
            let mut result = Vec::new();
            for r in rows {
                result.push(r?);
            }
            Ok(result)
        })
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pipeline_event (topic_id, run_token, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.topic_id,
                    entry.run_token,
                    entry.event_type,
                    entry.payload,
                    entry.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn events_for_topic(&self, topic_id: &str) -> EngineResult<Vec<EventLogEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, topic_id, run_token, event_type, payload, created_at
                 FROM pipeline_event WHERE topic_id = ?1
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![topic_id], |r| {
                Ok(EventLogEntry {
                    id: r.get(0)?,
                    topic_id: r.get(1)?,
                    run_token: r.get(2)?,
                    event_type: r.get(3)?,
                    payload: r.get(4)?,
                    created_at: r.get(5)?,
                })
            })?;
            let mut result = Vec::new();
            for r in rows {
                result.push(r?);
            }
            Ok(result)
        })
    }
}

/// Fixed-width UTC timestamps so lease cutoffs compare as text.
fn lock_time(t: chrono::DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn lock_holder(conn: &Connection, topic_id: &str) -> EngineResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT run_token FROM topic_lock WHERE topic_id = ?1",
            params![topic_id],
            |r| r.get(0),
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AnalysisStore {
        let store = AnalysisStore::in_memory().unwrap();
        store.migrate().unwrap();
        store
    }

    const LEASE: Duration = Duration::from_secs(600);

    #[test]
    fn lock_is_exclusive_until_released() {
        let store = store();
        assert!(store.try_lock_topic("t1", "run-a", LEASE).unwrap());
        assert!(!store.try_lock_topic("t1", "run-b", LEASE).unwrap());
        assert!(store.try_lock_topic("t2", "run-b", LEASE).unwrap(), "locks are per topic");

        assert!(!store.unlock_topic("t1", "run-b").unwrap(), "only the holder releases");
        assert_eq!(store.topic_lock_holder("t1").unwrap().as_deref(), Some("run-a"));

        assert!(store.unlock_topic("t1", "run-a").unwrap());
        assert!(store.try_lock_topic("t1", "run-b", LEASE).unwrap());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let store = store();
        assert!(store.try_lock_topic("t1", "dead-run", LEASE).unwrap());
        store
            .with_conn(|c| {
                c.execute(
                    "UPDATE topic_lock SET acquired_at = '2000-01-01T00:00:00.000000Z'",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        assert!(store.try_lock_topic("t1", "run-b", LEASE).unwrap());
        assert_eq!(store.topic_lock_holder("t1").unwrap().as_deref(), Some("run-b"));
        assert!(!store.unlock_topic("t1", "dead-run").unwrap(), "old holder cannot release");
    }

    #[test]
    fn holder_renews_its_lease() {
        let store = store();
        assert!(store.try_lock_topic("t1", "run-a", LEASE).unwrap());
        store
            .with_conn(|c| {
                c.execute(
                    "UPDATE topic_lock SET acquired_at = '2000-01-01T00:00:00.000000Z'",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(store.try_lock_topic("t1", "run-a", LEASE).unwrap());
        assert!(
            !store.try_lock_topic("t1", "run-b", LEASE).unwrap(),
            "renewed lock is live again"
        );
    }

    #[test]
    fn force_release_clears_any_holder() {
        let store = store();
        assert!(store.try_lock_topic("t1", "dead-run", LEASE).unwrap());
        assert_eq!(
            store.force_release_topic_lock("t1").unwrap().as_deref(),
            Some("dead-run")
        );
        assert_eq!(store.topic_lock_holder("t1").unwrap(), None);
        assert_eq!(store.force_release_topic_lock("t1").unwrap(), None);
    }

    #[test]
    fn run_record_lifecycle() {
        let store = store();
        store.insert_run("run-a", "t1").unwrap();
        store.finish_run("run-a", "completed", "{}").unwrap();
        let runs = store.runs_for_topic("t1").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome.as_deref(), Some("completed"));
        assert!(runs[0].finished_at.is_some());
    }
}
