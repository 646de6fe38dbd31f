//! Monte Carlo outcome queries.

use super::{ensure_topic, json_column, time_column, to_json, usize_column, AnalysisStore};
use crate::{
    error::EngineResult,
    monte_carlo::{DistributionFamily, SimulationResult},
};
use rusqlite::{params, types::Type, Connection};

impl AnalysisStore {
    /// Upsert keyed by (topic_id, pattern_id, kpi_id).
    pub fn upsert_simulations(&self, results: &[SimulationResult]) -> EngineResult<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            upsert_simulation_rows(&tx, results)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn simulations_for_topic(&self, topic_id: &str) -> EngineResult<Vec<SimulationResult>> {
        self.with_conn(|conn| simulation_rows(conn, topic_id))
    }
}

pub(crate) fn clear_simulation_rows(conn: &Connection, topic_id: &str) -> EngineResult<()> {
    conn.execute("DELETE FROM simulation_result WHERE topic_id = ?1", params![topic_id])?;
    Ok(())
}

pub(crate) fn upsert_simulation_rows(conn: &Connection, results: &[SimulationResult]) -> EngineResult<()> {
    for r in results {
        ensure_topic(conn, &r.topic_id)?;
        conn.execute(
            "INSERT INTO simulation_result
                (topic_id, pattern_id, kpi_id, distribution_family, sample_count, seed,
                 success_reference, mean, median, std_dev, p5, p95, ci90_low, ci90_high,
                 probability_positive, provenance, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(topic_id, pattern_id, kpi_id) DO UPDATE SET
                distribution_family = excluded.distribution_family,
                sample_count = excluded.sample_count,
                seed = excluded.seed,
                success_reference = excluded.success_reference,
                mean = excluded.mean,
                median = excluded.median,
                std_dev = excluded.std_dev,
                p5 = excluded.p5,
                p95 = excluded.p95,
                ci90_low = excluded.ci90_low,
                ci90_high = excluded.ci90_high,
                probability_positive = excluded.probability_positive,
                provenance = excluded.provenance,
                computed_at = excluded.computed_at",
            params![
                r.topic_id,
                r.pattern_id,
                r.kpi_id,
                r.distribution_family.name(),
                r.sample_count as i64,
                r.seed.map(|s| s as i64),
                r.success_reference,
                r.mean,
                r.median,
                r.std_dev,
                r.p5,
                r.p95,
                r.ci90_low,
                r.ci90_high,
                r.probability_positive,
                to_json(&r.provenance)?,
                r.computed_at.to_rfc3339(),
            ],
        )?;
    }
    Ok(())
}

pub(crate) fn simulation_rows(conn: &Connection, topic_id: &str) -> EngineResult<Vec<SimulationResult>> {
    let mut stmt = conn.prepare(
        "SELECT topic_id, pattern_id, kpi_id, distribution_family, sample_count, seed,
                success_reference, mean, median, std_dev, p5, p95, ci90_low, ci90_high,
                probability_positive, provenance, computed_at
         FROM simulation_result WHERE topic_id = ?1
         ORDER BY pattern_id ASC, kpi_id ASC",
    )?;
    let rows = stmt.query_map(params![topic_id], |r| {
        let family: String = r.get(3)?;
        let distribution_family = DistributionFamily::from_name(&family).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Text,
                format!("unknown distribution family '{family}'").into(),
            )
        })?;
        Ok(SimulationResult {
            topic_id: r.get(0)?,
            pattern_id: r.get(1)?,
            kpi_id: r.get(2)?,
            distribution_family,
            sample_count: usize_column(r, 4)?,
            seed: r.get::<_, Option<i64>>(5)?.map(|s| s as u64),
            success_reference: r.get(6)?,
            mean: r.get(7)?,
            median: r.get(8)?,
            std_dev: r.get(9)?,
            p5: r.get(10)?,
            p95: r.get(11)?,
            ci90_low: r.get(12)?,
            ci90_high: r.get(13)?,
            probability_positive: r.get(14)?,
            provenance: json_column(r, 15)?,
            computed_at: time_column(r, 16)?,
        })
    })?;
    let mut result = Vec::new();
    for r in rows {
        result.push(r?);
    }
    Ok(result)
}
