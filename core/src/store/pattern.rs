//! Pattern evaluation queries.

use super::{bool_column, ensure_topic, json_column, time_column, to_json, usize_column, AnalysisStore};
use crate::{error::EngineResult, pattern_matcher::PatternMatch};
use rusqlite::{params, Connection};

impl AnalysisStore {
    /// Replace the topic's stored evaluations with `matches`.
    /// Every evaluated pattern is kept, matched or not.
    pub fn replace_pattern_matches(&self, topic_id: &str, matches: &[PatternMatch]) -> EngineResult<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            replace_pattern_rows(&tx, topic_id, matches)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn pattern_matches_for_topic(&self, topic_id: &str) -> EngineResult<Vec<PatternMatch>> {
        self.with_conn(|conn| pattern_rows(conn, topic_id))
    }
}

pub(crate) fn replace_pattern_rows(
    conn: &Connection,
    topic_id: &str,
    matches: &[PatternMatch],
) -> EngineResult<()> {
    ensure_topic(conn, topic_id)?;
    conn.execute("DELETE FROM pattern_match WHERE topic_id = ?1", params![topic_id])?;
    for m in matches.iter().filter(|m| m.topic_id == topic_id) {
        conn.execute(
            "INSERT INTO pattern_match
                (topic_id, pattern_id, pattern_name, type_tag, match_score, confidence,
                 matched, satisfied_conditions, total_conditions, strategic_response,
                 provenance, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                m.topic_id,
                m.pattern_id,
                m.pattern_name,
                m.type_tag,
                m.match_score,
                m.confidence,
                m.matched as i64,
                m.satisfied_conditions as i64,
                m.total_conditions as i64,
                m.strategic_response,
                to_json(&m.provenance)?,
                m.computed_at.to_rfc3339(),
            ],
        )?;
    }
    Ok(())
}

pub(crate) fn pattern_rows(conn: &Connection, topic_id: &str) -> EngineResult<Vec<PatternMatch>> {
    let mut stmt = conn.prepare(
        "SELECT topic_id, pattern_id, pattern_name, type_tag, match_score, confidence,
                matched, satisfied_conditions, total_conditions, strategic_response,
                provenance, computed_at
         FROM pattern_match WHERE topic_id = ?1
         ORDER BY pattern_id ASC",
    )?;
    let rows = stmt.query_map(params![topic_id], |r| {
        Ok(PatternMatch {
            topic_id: r.get(0)?,
            pattern_id: r.get(1)?,
            pattern_name: r.get(2)?,
            type_tag: r.get(3)?,
            match_score: r.get(4)?,
            confidence: r.get(5)?,
            matched: bool_column(r, 6)?,
            satisfied_conditions: usize_column(r, 7)?,
            total_conditions: usize_column(r, 8)?,
            strategic_response: r.get(9)?,
            provenance: json_column(r, 10)?,
            computed_at: time_column(r, 11)?,
        })
    })?;
    let mut result = Vec::new();
    for r in rows {
        result.push(r?);
    }
    Ok(result)
}
