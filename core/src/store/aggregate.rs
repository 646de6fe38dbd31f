//! Factor, segment and overall score queries.

use super::{bool_column, ensure_topic, json_column, time_column, to_json, usize_column, AnalysisStore};
use crate::{
    error::EngineResult,
    factor_aggregator::FactorRecord,
    segment_aggregator::{OverallScore, SegmentRecord},
};
use rusqlite::{params, Connection, OptionalExtension};

impl AnalysisStore {
    pub fn upsert_factors(&self, records: &[FactorRecord]) -> EngineResult<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            upsert_factor_rows(&tx, records)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn upsert_segments(
        &self,
        segments: &[SegmentRecord],
        overall: &OverallScore,
    ) -> EngineResult<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            upsert_segment_rows(&tx, segments, overall)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn factors_for_topic(&self, topic_id: &str) -> EngineResult<Vec<FactorRecord>> {
        self.with_conn(|conn| factor_rows(conn, topic_id))
    }

    pub fn segments_for_topic(&self, topic_id: &str) -> EngineResult<Vec<SegmentRecord>> {
        self.with_conn(|conn| segment_rows(conn, topic_id))
    }

    pub fn overall_for_topic(&self, topic_id: &str) -> EngineResult<Option<OverallScore>> {
        self.with_conn(|conn| overall_row(conn, topic_id))
    }
}

pub(crate) fn upsert_factor_rows(conn: &Connection, records: &[FactorRecord]) -> EngineResult<()> {
    for r in records {
        ensure_topic(conn, &r.topic_id)?;
        conn.execute(
            "INSERT INTO factor_score
                (topic_id, factor_id, parent_segment_id, weight_in_segment, value,
                 confidence, insufficient_data, input_count, provenance, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(topic_id, factor_id) DO UPDATE SET
                parent_segment_id = excluded.parent_segment_id,
                weight_in_segment = excluded.weight_in_segment,
                value = excluded.value,
                confidence = excluded.confidence,
                insufficient_data = excluded.insufficient_data,
                input_count = excluded.input_count,
                provenance = excluded.provenance,
                computed_at = excluded.computed_at",
            params![
                r.topic_id,
                r.factor_id,
                r.parent_segment_id,
                r.weight_in_segment,
                r.value,
                r.confidence,
                r.insufficient_data as i64,
                r.input_count as i64,
                to_json(&r.provenance)?,
                r.computed_at.to_rfc3339(),
            ],
        )?;
    }
    Ok(())
}

pub(crate) fn upsert_segment_rows(
    conn: &Connection,
    segments: &[SegmentRecord],
    overall: &OverallScore,
) -> EngineResult<()> {
    ensure_topic(conn, &overall.topic_id)?;
    for r in segments {
        ensure_topic(conn, &r.topic_id)?;
        conn.execute(
            "INSERT INTO segment_score
                (topic_id, segment_id, weight_among_segments, value, confidence,
                 insufficient_data, input_count, provenance, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(topic_id, segment_id) DO UPDATE SET
                weight_among_segments = excluded.weight_among_segments,
                value = excluded.value,
                confidence = excluded.confidence,
                insufficient_data = excluded.insufficient_data,
                input_count = excluded.input_count,
                provenance = excluded.provenance,
                computed_at = excluded.computed_at",
            params![
                r.topic_id,
                r.segment_id,
                r.weight_among_segments,
                r.value,
                r.confidence,
                r.insufficient_data as i64,
                r.input_count as i64,
                to_json(&r.provenance)?,
                r.computed_at.to_rfc3339(),
            ],
        )?;
    }
    conn.execute(
        "INSERT INTO overall_score
            (topic_id, value, confidence, insufficient_data, input_count, provenance, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(topic_id) DO UPDATE SET
            value = excluded.value,
            confidence = excluded.confidence,
            insufficient_data = excluded.insufficient_data,
            input_count = excluded.input_count,
            provenance = excluded.provenance,
            computed_at = excluded.computed_at",
        params![
            overall.topic_id,
            overall.value,
            overall.confidence,
            overall.insufficient_data as i64,
            overall.input_count as i64,
            to_json(&overall.provenance)?,
            overall.computed_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub(crate) fn factor_rows(conn: &Connection, topic_id: &str) -> EngineResult<Vec<FactorRecord>> {
    let mut stmt = conn.prepare(
        "SELECT topic_id, factor_id, parent_segment_id, weight_in_segment, value,
                confidence, insufficient_data, input_count, provenance, computed_at
         FROM factor_score WHERE topic_id = ?1
         ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map(params![topic_id], |r| {
        Ok(FactorRecord {
            topic_id: r.get(0)?,
            factor_id: r.get(1)?,
            parent_segment_id: r.get(2)?,
            weight_in_segment: r.get(3)?,
            value: r.get(4)?,
            confidence: r.get(5)?,
            insufficient_data: bool_column(r, 6)?,
            input_count: usize_column(r, 7)?,
            provenance: json_column(r, 8)?,
            computed_at: time_column(r, 9)?,
        })
    })?;
    let mut result = Vec::new();
    for r in rows {
        result.push(r?);
    }
    Ok(result)
}

pub(crate) fn segment_rows(conn: &Connection, topic_id: &str) -> EngineResult<Vec<SegmentRecord>> {
    let mut stmt = conn.prepare(
        "SELECT topic_id, segment_id, weight_among_segments, value, confidence,
                insufficient_data, input_count, provenance, computed_at
         FROM segment_score WHERE topic_id = ?1
         ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map(params![topic_id], |r| {
        Ok(SegmentRecord {
            topic_id: r.get(0)?,
            segment_id: r.get(1)?,
            weight_among_segments: r.get(2)?,
            value: r.get(3)?,
            confidence: r.get(4)?,
            insufficient_data: bool_column(r, 5)?,
            input_count: usize_column(r, 6)?,
            provenance: json_column(r, 7)?,
            computed_at: time_column(r, 8)?,
        })
    })?;
    let mut result = Vec::new();
    for r in rows {
        result.push(r?);
    }
    Ok(result)
}

pub(crate) fn overall_row(conn: &Connection, topic_id: &str) -> EngineResult<Option<OverallScore>> {
    Ok(conn
        .query_row(
            "SELECT topic_id, value, confidence, insufficient_data, input_count,
                    provenance, computed_at
             FROM overall_score WHERE topic_id = ?1",
            params![topic_id],
            |r| {
                Ok(OverallScore {
                    topic_id: r.get(0)?,
                    value: r.get(1)?,
                    confidence: r.get(2)?,
                    insufficient_data: bool_column(r, 3)?,
                    input_count: usize_column(r, 4)?,
                    provenance: json_column(r, 5)?,
                    computed_at: time_column(r, 6)?,
                })
            },
        )
        .optional()?)
}
