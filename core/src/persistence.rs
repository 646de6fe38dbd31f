//! Result store capability.
//!
//! The orchestrator persists through `ResultStore` only. `AnalysisStore`
//! implements it on SQLite, moving each call onto the blocking pool.

use crate::{
    error::EngineResult,
    event::EventLogEntry,
    factor_aggregator::FactorRecord,
    layer_scorer::LayerRecord,
    monte_carlo::SimulationResult,
    pattern_matcher::PatternMatch,
    segment_aggregator::{OverallScore, SegmentRecord},
    store::{self, AnalysisStore},
    types::TopicId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything derived for one topic by one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopicResults {
    pub topic_id: TopicId,
    pub layers: Vec<LayerRecord>,
    pub factors: Vec<FactorRecord>,
    pub segments: Vec<SegmentRecord>,
    pub overall: Option<OverallScore>,
    /// Every evaluated pattern, matched or not.
    pub pattern_matches: Vec<PatternMatch>,
    pub simulations: Vec<SimulationResult>,
}

impl TopicResults {
    pub fn new(topic_id: &str) -> Self {
        Self {
            topic_id: topic_id.to_string(),
            ..Default::default()
        }
    }

    pub fn matched(&self) -> impl Iterator<Item = &PatternMatch> {
        self.pattern_matches.iter().filter(|m| m.matched)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty() && self.factors.is_empty() && self.segments.is_empty()
    }
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn upsert_layers(&self, records: &[LayerRecord]) -> EngineResult<()>;
    async fn upsert_factors(&self, records: &[FactorRecord]) -> EngineResult<()>;
    async fn upsert_segments(
        &self,
        segments: &[SegmentRecord],
        overall: &OverallScore,
    ) -> EngineResult<()>;
    async fn replace_pattern_matches(
        &self,
        topic_id: &str,
        matches: &[PatternMatch],
    ) -> EngineResult<()>;
    async fn upsert_simulations(&self, results: &[SimulationResult]) -> EngineResult<()>;

    /// The authoritative end-of-run write. Stores that can should make
    /// it atomic; the default writes each kind in turn.
    async fn persist_results(&self, results: &TopicResults) -> EngineResult<()> {
        self.upsert_layers(&results.layers).await?;
        self.upsert_factors(&results.factors).await?;
        if let Some(overall) = &results.overall {
            self.upsert_segments(&results.segments, overall).await?;
        }
        self.replace_pattern_matches(&results.topic_id, &results.pattern_matches)
            .await?;
        self.upsert_simulations(&results.simulations).await
    }

    async fn fetch_latest(&self, topic_id: &str) -> EngineResult<TopicResults>;

    /// Compare-and-set on the run token. `false` means another live run
    /// holds it. Locks older than `lease` are stale; the holder renews by
    /// acquiring again.
    async fn acquire_topic_lock(
        &self,
        topic_id: &str,
        run_token: &str,
        lease: Duration,
    ) -> EngineResult<bool>;
    async fn release_topic_lock(&self, topic_id: &str, run_token: &str) -> EngineResult<()>;

    async fn append_event(&self, entry: &EventLogEntry) -> EngineResult<()>;

    /// Run bookkeeping. Stores without a run table may ignore it.
    async fn start_run(&self, _topic_id: &str, _run_token: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn finish_run(
        &self,
        _run_token: &str,
        _outcome: &str,
        _summary_json: &str,
    ) -> EngineResult<()> {
        Ok(())
    }
}

impl AnalysisStore {
    async fn blocking<F, R>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(AnalysisStore) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store)).await?
    }
}

#[async_trait]
impl ResultStore for AnalysisStore {
    async fn upsert_layers(&self, records: &[LayerRecord]) -> EngineResult<()> {
        let records = records.to_vec();
        self.blocking(move |s| s.upsert_layers(&records)).await
    }

    async fn upsert_factors(&self, records: &[FactorRecord]) -> EngineResult<()> {
        let records = records.to_vec();
        self.blocking(move |s| s.upsert_factors(&records)).await
    }

    async fn upsert_segments(
        &self,
        segments: &[SegmentRecord],
        overall: &OverallScore,
    ) -> EngineResult<()> {
        let segments = segments.to_vec();
        let overall = overall.clone();
        self.blocking(move |s| s.upsert_segments(&segments, &overall))
            .await
    }

    async fn replace_pattern_matches(
        &self,
        topic_id: &str,
        matches: &[PatternMatch],
    ) -> EngineResult<()> {
        let topic_id = topic_id.to_string();
        let matches = matches.to_vec();
        self.blocking(move |s| s.replace_pattern_matches(&topic_id, &matches))
            .await
    }

    async fn upsert_simulations(&self, results: &[SimulationResult]) -> EngineResult<()> {
        let results = results.to_vec();
        self.blocking(move |s| s.upsert_simulations(&results)).await
    }

    /// One transaction: either every record kind lands or none does.
    async fn persist_results(&self, results: &TopicResults) -> EngineResult<()> {
        let results = results.clone();
        self.blocking(move |s| {
            s.with_conn(|conn| {
                let tx = conn.unchecked_transaction()?;
                store::layer::upsert_layer_rows(&tx, &results.layers)?;
                store::aggregate::upsert_factor_rows(&tx, &results.factors)?;
                if let Some(overall) = &results.overall {
                    store::aggregate::upsert_segment_rows(&tx, &results.segments, overall)?;
                }
                store::pattern::replace_pattern_rows(
                    &tx,
                    &results.topic_id,
                    &results.pattern_matches,
                )?;
                store::simulation::clear_simulation_rows(&tx, &results.topic_id)?;
                store::simulation::upsert_simulation_rows(&tx, &results.simulations)?;
                tx.commit()?;
                Ok(())
            })
        })
        .await
    }

    async fn fetch_latest(&self, topic_id: &str) -> EngineResult<TopicResults> {
        let topic_id = topic_id.to_string();
        self.blocking(move |s| {
            s.with_conn(|conn| {
                Ok(TopicResults {
                    layers: store::layer::layer_rows(conn, &topic_id)?,
                    factors: store::aggregate::factor_rows(conn, &topic_id)?,
                    segments: store::aggregate::segment_rows(conn, &topic_id)?,
                    overall: store::aggregate::overall_row(conn, &topic_id)?,
                    pattern_matches: store::pattern::pattern_rows(conn, &topic_id)?,
                    simulations: store::simulation::simulation_rows(conn, &topic_id)?,
                    topic_id,
                })
            })
        })
        .await
    }

    async fn acquire_topic_lock(
        &self,
        topic_id: &str,
        run_token: &str,
        lease: Duration,
    ) -> EngineResult<bool> {
        let (topic_id, run_token) = (topic_id.to_string(), run_token.to_string());
        self.blocking(move |s| s.try_lock_topic(&topic_id, &run_token, lease))
            .await
    }

    async fn release_topic_lock(&self, topic_id: &str, run_token: &str) -> EngineResult<()> {
        let (topic_id, run_token) = (topic_id.to_string(), run_token.to_string());
        self.blocking(move |s| {
            if !s.unlock_topic(&topic_id, &run_token)? {
                log::warn!("topic {topic_id}: lock was not held by run {run_token}");
            }
            Ok(())
        })
        .await
    }

    async fn append_event(&self, entry: &EventLogEntry) -> EngineResult<()> {
        let entry = entry.clone();
        self.blocking(move |s| s.append_event(&entry)).await
    }

    async fn start_run(&self, topic_id: &str, run_token: &str) -> EngineResult<()> {
        let (topic_id, run_token) = (topic_id.to_string(), run_token.to_string());
        self.blocking(move |s| s.insert_run(&run_token, &topic_id))
            .await
    }

    async fn finish_run(
        &self,
        run_token: &str,
        outcome: &str,
        summary_json: &str,
    ) -> EngineResult<()> {
        let (run_token, outcome, summary_json) = (
            run_token.to_string(),
            outcome.to_string(),
            summary_json.to_string(),
        );
        self.blocking(move |s| s.finish_run(&run_token, &outcome, &summary_json))
            .await
    }
}
