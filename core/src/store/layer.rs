//! Layer score queries.

use super::{bool_column, ensure_topic, json_column, time_column, to_json, usize_column, AnalysisStore};
use crate::{error::EngineResult, layer_scorer::LayerRecord};
use rusqlite::{params, Connection};

impl AnalysisStore {
    /// Upsert keyed by (topic_id, layer_id).
    pub fn upsert_layers(&self, records: &[LayerRecord]) -> EngineResult<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            upsert_layer_rows(&tx, records)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn layers_for_topic(&self, topic_id: &str) -> EngineResult<Vec<LayerRecord>> {
        self.with_conn(|conn| layer_rows(conn, topic_id))
    }
}

pub(crate) fn upsert_layer_rows(conn: &Connection, records: &[LayerRecord]) -> EngineResult<()> {
    for r in records {
        ensure_topic(conn, &r.topic_id)?;
        conn.execute(
            "INSERT INTO layer_score
                (topic_id, layer_id, parent_factor_id, persona, weight_in_factor,
                 score, confidence, insights, evidence_count, insufficient_structure,
                 degraded_reason, provenance, scored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(topic_id, layer_id) DO UPDATE SET
                parent_factor_id = excluded.parent_factor_id,
                persona = excluded.persona,
                weight_in_factor = excluded.weight_in_factor,
                score = excluded.score,
                confidence = excluded.confidence,
                insights = excluded.insights,
                evidence_count = excluded.evidence_count,
                insufficient_structure = excluded.insufficient_structure,
                degraded_reason = excluded.degraded_reason,
                provenance = excluded.provenance,
                scored_at = excluded.scored_at",
            params![
                r.topic_id,
                r.layer_id,
                r.parent_factor_id,
                r.persona,
                r.weight_in_factor,
                r.score,
                r.confidence,
                to_json(&r.insights)?,
                r.evidence_count as i64,
                r.insufficient_structure as i64,
                r.degraded_reason,
                to_json(&r.provenance)?,
                r.scored_at.to_rfc3339(),
            ],
        )?;
    }
    Ok(())
}

pub(crate) fn layer_rows(conn: &Connection, topic_id: &str) -> EngineResult<Vec<LayerRecord>> {
    let mut stmt = conn.prepare(
        "SELECT topic_id, layer_id, parent_factor_id, persona, weight_in_factor,
                score, confidence, insights, evidence_count, insufficient_structure,
                degraded_reason, provenance, scored_at
         FROM layer_score WHERE topic_id = ?1
         ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map(params![topic_id], |r| {
        Ok(LayerRecord {
            topic_id: r.get(0)?,
            layer_id: r.get(1)?,
            parent_factor_id: r.get(2)?,
            persona: r.get(3)?,
            weight_in_factor: r.get(4)?,
            score: r.get(5)?,
            confidence: r.get(6)?,
            insights: json_column(r, 7)?,
            evidence_count: usize_column(r, 8)?,
            insufficient_structure: bool_column(r, 9)?,
            degraded_reason: r.get(10)?,
            provenance: json_column(r, 11)?,
            scored_at: time_column(r, 12)?,
        })
    })?;
    let mut result = Vec::new();
    for r in rows {
        result.push(r?);
    }
    Ok(result)
}
