//! The orchestrator: runs the full analysis pipeline for one topic.
//!
//! EXECUTION ORDER (fixed, never reordered):
//!   1. SCORING_LAYERS       evidence → every catalog layer, in bounded batches
//!   2. AGGREGATING_FACTORS  layers → factors
//!   3. AGGREGATING_SEGMENTS factors → segments + overall
//!   4. MATCHING_PATTERNS    scores → ranked pattern matches
//!   5. SIMULATING           KPI anchors of the ranked matches
//!   6. PERSISTING           one authoritative write of everything above
//!
//! RULES:
//!   - A run holds the topic lock (CAS on its run token) from before
//!     SCORING_LAYERS until it reaches a terminal state.
//!   - Failures before PERSISTING degrade in place and are reported in
//!     the summary. FAILED is reachable only from PERSISTING.
//!   - Cancellation is cooperative: checked between batches and stages.
//!   - Every transition is appended to the topic's pipeline event log.

use crate::{
    config::{EngineConfig, LayerSlot},
    content::ContentStore,
    error::{EngineError, EngineResult},
    event::{EventLogEntry, PipelineEvent},
    factor_aggregator::{self, FactorRecord},
    generator::TextGenerator,
    layer_scorer::{EvidenceDigest, LayerRecord, LayerScorer},
    monte_carlo::{MonteCarloSimulator, SimulationResult},
    pattern_matcher::{rank_matches, MetricSnapshot, PatternCatalog, PatternMatch, PatternMatcher},
    persistence::{ResultStore, TopicResults},
    provenance::{Provenance, Stage},
    segment_aggregator::{self, OverallScore, SegmentRecord},
    types::{FactorId, KpiId, LayerId, PatternId, RunToken, SegmentId, TopicId},
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── State machine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Pending,
    ScoringLayers,
    AggregatingFactors,
    AggregatingSegments,
    MatchingPatterns,
    Simulating,
    Persisting,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::ScoringLayers => "SCORING_LAYERS",
            Self::AggregatingFactors => "AGGREGATING_FACTORS",
            Self::AggregatingSegments => "AGGREGATING_SEGMENTS",
            Self::MatchingPatterns => "MATCHING_PATTERNS",
            Self::Simulating => "SIMULATING",
            Self::Persisting => "PERSISTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase().replace('-', "_");
        [
            Self::Pending,
            Self::ScoringLayers,
            Self::AggregatingFactors,
            Self::AggregatingSegments,
            Self::MatchingPatterns,
            Self::Simulating,
            Self::Persisting,
            Self::Completed,
            Self::Failed,
            Self::Cancelled,
        ]
        .into_iter()
        .find(|s| s.name() == upper)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stages a run may resume from; upstream records come from the store.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::AggregatingFactors
                | Self::AggregatingSegments
                | Self::MatchingPatterns
                | Self::Simulating
        )
    }

    fn successor(&self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::ScoringLayers),
            Self::ScoringLayers => Some(Self::AggregatingFactors),
            Self::AggregatingFactors => Some(Self::AggregatingSegments),
            Self::AggregatingSegments => Some(Self::MatchingPatterns),
            Self::MatchingPatterns => Some(Self::Simulating),
            Self::Simulating => Some(Self::Persisting),
            Self::Persisting => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        if self.successor() == Some(next) {
            return true;
        }
        match (self, next) {
            (Self::Persisting, Self::Failed) => true,
            (Self::Pending, n) if n.is_resumable() => true,
            (s, Self::Cancelled) => !s.is_terminal() && *s != Self::Persisting,
            _ => false,
        }
    }

    pub fn advance(&mut self, next: Self) -> EngineResult<()> {
        if !self.can_transition_to(next) {
            return Err(EngineError::IllegalTransition {
                from: self.name(),
                to: next.name(),
            });
        }
        *self = next;
        Ok(())
    }
}

// ── Options and summary ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Start at this stage instead of SCORING_LAYERS.
    pub resume_from: Option<PipelineState>,
    /// Overrides the configured `default_top_k`.
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerDegradation {
    pub layer_id: LayerId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedSimulation {
    pub pattern_id: PatternId,
    pub kpi_id: Option<KpiId>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSummary {
    pub topic_id: TopicId,
    pub run_token: RunToken,
    pub final_state: PipelineState,
    pub resumed_from: Option<PipelineState>,
    pub layers_scored: usize,
    pub degraded_layers: Vec<LayerDegradation>,
    /// Stage-level degradations: evidence load, checkpoint writes.
    pub degradations: Vec<String>,
    pub insufficient_factors: Vec<FactorId>,
    pub insufficient_segments: Vec<SegmentId>,
    pub overall_score: Option<f64>,
    pub patterns_evaluated: usize,
    pub top_matches: Vec<PatternMatch>,
    pub simulations_completed: usize,
    pub skipped_simulations: Vec<SkippedSimulation>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineSummary {
    fn new(topic_id: &str, run_token: &str, resumed_from: Option<PipelineState>) -> Self {
        Self {
            topic_id: topic_id.to_string(),
            run_token: run_token.to_string(),
            final_state: PipelineState::Pending,
            resumed_from,
            layers_scored: 0,
            degraded_layers: Vec::new(),
            degradations: Vec::new(),
            insufficient_factors: Vec::new(),
            insufficient_segments: Vec::new(),
            overall_score: None,
            patterns_evaluated: 0,
            top_matches: Vec::new(),
            simulations_completed: 0,
            skipped_simulations: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.final_state == PipelineState::Completed
    }
}

/// `base * 2^attempt`, exponent capped at 5.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

struct RunContext {
    topic_id: TopicId,
    run_token: RunToken,
    state: PipelineState,
    summary: PipelineSummary,
    results: TopicResults,
}

enum StageOutcome {
    Continue,
    Cancelled,
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

pub struct Orchestrator {
    config: EngineConfig,
    catalog: PatternCatalog,
    scorer: LayerScorer,
    matcher: PatternMatcher,
    simulator: MonteCarloSimulator,
    content: Arc<dyn ContentStore>,
    store: Arc<dyn ResultStore>,
}

impl Orchestrator {
    /// Validates the configuration and pattern catalog up front.
    /// The generator's availability is checked once, here.
    pub fn new(
        config: EngineConfig,
        content: Arc<dyn ContentStore>,
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn ResultStore>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let simulator = MonteCarloSimulator::new(&config.simulation);
        let catalog = PatternCatalog::build(config.patterns.clone(), &config.hierarchy, &simulator)?;
        let scorer = LayerScorer::new(config.scoring.clone(), generator);
        let matcher = PatternMatcher::new(&config.matching);
        log::info!(
            "orchestrator ready: {} segments, {} layers, {} patterns",
            config.hierarchy.segments.len(),
            config.hierarchy.layer_count(),
            catalog.len()
        );
        Ok(Self {
            config,
            catalog,
            scorer,
            matcher,
            simulator,
            content,
            store,
        })
    }

    /// Pin (or unpin) the Monte Carlo master seed.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.simulator = self.simulator.with_seed(seed);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PatternCatalog {
        &self.catalog
    }

    // ── Single-stage operations ────────────────────────────────

    /// Create neutral layer records for every catalog layer not yet stored.
    /// Returns all of the topic's layer records.
    pub async fn bootstrap_topic(&self, topic_id: &str) -> EngineResult<Vec<LayerRecord>> {
        let existing = self.store.fetch_latest(topic_id).await?.layers;
        let fresh: Vec<LayerRecord> = self
            .config
            .hierarchy
            .layers()
            .into_iter()
            .filter(|slot| !existing.iter().any(|l| l.layer_id == slot.layer.id))
            .map(|slot| {
                LayerRecord::neutral(
                    topic_id,
                    &slot.layer.id,
                    slot.factor_id,
                    &slot.layer.persona,
                    slot.layer.weight,
                    Provenance::new(Stage::Bootstrap, "catalog"),
                )
            })
            .collect();
        if !fresh.is_empty() {
            self.with_retry("bootstrap", || self.store.upsert_layers(&fresh))
                .await?;
        }
        log::info!(
            "topic {topic_id}: bootstrapped {} layers ({} already present)",
            fresh.len(),
            existing.len()
        );
        Ok(self.store.fetch_latest(topic_id).await?.layers)
    }

    /// Score every layer of a topic and store the records.
    pub async fn run_layer_scoring(&self, topic_id: &str) -> EngineResult<Vec<LayerRecord>> {
        let digest = match self.load_evidence(topic_id).await {
            Ok(d) => d,
            Err(e) => {
                log::warn!("topic {topic_id}: evidence unavailable: {e}");
                EvidenceDigest::default()
            }
        };
        let slots = self.config.hierarchy.layers();
        let records = self.score_slots(topic_id, &slots, &digest, None).await;
        self.with_retry("layer upsert", || self.store.upsert_layers(&records))
            .await?;
        Ok(records)
    }

    /// Recompute factors from the stored layer records.
    pub async fn aggregate_factors(&self, topic_id: &str) -> EngineResult<Vec<FactorRecord>> {
        let layers = self.store.fetch_latest(topic_id).await?.layers;
        let factors =
            factor_aggregator::aggregate_factors(topic_id, &self.config.hierarchy, &layers, None);
        self.with_retry("factor upsert", || self.store.upsert_factors(&factors))
            .await?;
        Ok(factors)
    }

    /// Recompute segments and the overall score from the stored factors.
    pub async fn aggregate_segments(
        &self,
        topic_id: &str,
    ) -> EngineResult<(Vec<SegmentRecord>, OverallScore)> {
        let factors = self.store.fetch_latest(topic_id).await?.factors;
        let (segments, overall) = segment_aggregator::aggregate_segments(
            topic_id,
            &self.config.hierarchy,
            &factors,
            None,
        );
        self.with_retry("segment upsert", || {
            self.store.upsert_segments(&segments, &overall)
        })
        .await?;
        Ok((segments, overall))
    }

    /// Evaluate every pattern against the stored scores. All evaluations
    /// are stored; the ranked matches are returned.
    pub async fn match_patterns(
        &self,
        topic_id: &str,
        top_k: Option<usize>,
    ) -> EngineResult<Vec<PatternMatch>> {
        let latest = self.store.fetch_latest(topic_id).await?;
        let snapshot =
            MetricSnapshot::from_records(&latest.factors, &latest.segments, latest.overall.as_ref());
        let evaluations = self
            .matcher
            .evaluate_all(topic_id, &self.catalog, &snapshot, None);
        self.with_retry("pattern upsert", || {
            self.store.replace_pattern_matches(topic_id, &evaluations)
        })
        .await?;
        Ok(rank_matches(
            &evaluations,
            top_k.unwrap_or(self.config.matching.default_top_k),
        ))
    }

    /// Simulate every KPI anchor of one catalog pattern. A KPI whose
    /// simulation fails is logged and left out; its siblings still land.
    pub async fn simulate(
        &self,
        topic_id: &str,
        pattern_id: &str,
    ) -> EngineResult<BTreeMap<KpiId, SimulationResult>> {
        let pattern = self
            .catalog
            .get(pattern_id)
            .cloned()
            .ok_or_else(|| EngineError::PatternNotFound {
                pattern_id: pattern_id.to_string(),
            })?;
        let simulator = self.simulator.clone();
        let topic = topic_id.to_string();
        let outcomes =
            tokio::task::spawn_blocking(move || simulator.simulate_pattern(&topic, &pattern, None))
                .await?;
        let (results, skipped) = split_outcomes(pattern_id, outcomes);
        for s in &skipped {
            log::warn!(
                "simulation {}/{} skipped: {}",
                s.pattern_id,
                s.kpi_id.as_deref().unwrap_or("-"),
                s.reason
            );
        }
        let rows: Vec<SimulationResult> = results.values().cloned().collect();
        self.with_retry("simulation upsert", || self.store.upsert_simulations(&rows))
            .await?;
        Ok(results)
    }

    // ── Full pipeline ──────────────────────────────────────────

    /// Run independent topics concurrently.
    pub async fn run_topics(
        &self,
        topic_ids: &[TopicId],
        options: &PipelineOptions,
        cancel: Option<&AtomicBool>,
    ) -> Vec<EngineResult<PipelineSummary>> {
        futures::future::join_all(
            topic_ids
                .iter()
                .map(|topic_id| self.run_full_pipeline(topic_id, options, cancel)),
        )
        .await
    }

    pub async fn run_full_pipeline(
        &self,
        topic_id: &str,
        options: &PipelineOptions,
        cancel: Option<&AtomicBool>,
    ) -> EngineResult<PipelineSummary> {
        if let Some(stage) = options.resume_from {
            if !stage.is_resumable() {
                return Err(EngineError::validation(format!(
                    "cannot resume from {}",
                    stage.name()
                )));
            }
        }

        let run_token = uuid::Uuid::new_v4().to_string();
        let lease = self.config.persistence.lock_lease();
        if !self.store.acquire_topic_lock(topic_id, &run_token, lease).await? {
            log::warn!("topic {topic_id}: busy, run not started");
            return Err(EngineError::TopicBusy {
                topic_id: topic_id.to_string(),
            });
        }
        if let Err(e) = self.store.start_run(topic_id, &run_token).await {
            log::warn!("topic {topic_id}: run record not written: {e}");
        }

        let mut ctx = RunContext {
            topic_id: topic_id.to_string(),
            run_token: run_token.clone(),
            state: PipelineState::Pending,
            summary: PipelineSummary::new(topic_id, &run_token, options.resume_from),
            results: TopicResults::new(topic_id),
        };
        self.emit(
            &ctx,
            PipelineEvent::RunStarted {
                run_token: run_token.clone(),
                resume_from: options.resume_from.map(|s| s.name().to_string()),
            },
        )
        .await;

        let outcome = self.execute(&mut ctx, options, cancel).await;

        if let Err(e) = self.store.release_topic_lock(topic_id, &run_token).await {
            log::warn!("topic {topic_id}: lock release failed: {e}");
        }
        outcome?;

        ctx.summary.final_state = ctx.state;
        ctx.summary.finished_at = Some(Utc::now());
        match serde_json::to_string(&ctx.summary) {
            Ok(json) => {
                if let Err(e) = self.store.finish_run(&run_token, ctx.state.name(), &json).await {
                    log::warn!("topic {topic_id}: run record not finalised: {e}");
                }
            }
            Err(e) => log::warn!("topic {topic_id}: summary not serialisable: {e}"),
        }
        log::info!(
            "topic {topic_id}: run {run_token} finished {} ({} layers, {} degraded, {} matches, {} simulations)",
            ctx.state.name(),
            ctx.summary.layers_scored,
            ctx.summary.degraded_layers.len(),
            ctx.summary.top_matches.len(),
            ctx.summary.simulations_completed,
        );
        Ok(ctx.summary)
    }

    async fn execute(
        &self,
        ctx: &mut RunContext,
        options: &PipelineOptions,
        cancel: Option<&AtomicBool>,
    ) -> EngineResult<()> {
        let start = options.resume_from.unwrap_or(PipelineState::ScoringLayers);
        if start != PipelineState::ScoringLayers {
            self.load_upstream(ctx, start, options).await?;
        }

        let stages = [
            PipelineState::ScoringLayers,
            PipelineState::AggregatingFactors,
            PipelineState::AggregatingSegments,
            PipelineState::MatchingPatterns,
            PipelineState::Simulating,
        ];
        for stage in stages.into_iter().filter(|s| *s >= start) {
            if is_cancelled(cancel) {
                return self.cancel(ctx).await;
            }
            self.renew_lock(ctx).await;
            self.transition(ctx, stage).await?;
            let outcome = match stage {
                PipelineState::ScoringLayers => self.stage_score_layers(ctx, cancel).await,
                PipelineState::AggregatingFactors => self.stage_aggregate_factors(ctx),
                PipelineState::AggregatingSegments => self.stage_aggregate_segments(ctx),
                PipelineState::MatchingPatterns => self.stage_match_patterns(ctx, options).await,
                PipelineState::Simulating => self.stage_simulate(ctx).await?,
                _ => StageOutcome::Continue,
            };
            if let StageOutcome::Cancelled = outcome {
                return self.cancel(ctx).await;
            }
        }

        self.transition(ctx, PipelineState::Persisting).await?;
        let persisted = {
            let results = &ctx.results;
            self.with_retry("final persist", || self.store.persist_results(results))
                .await
        };
        match persisted {
            Ok(()) => self.transition(ctx, PipelineState::Completed).await?,
            Err(e) => {
                log::error!("topic {}: persistence failed: {e}", ctx.topic_id);
                ctx.summary.error = Some(e.to_string());
                self.transition(ctx, PipelineState::Failed).await?;
                self.emit(
                    ctx,
                    PipelineEvent::RunFailed {
                        state: PipelineState::Persisting.name().to_string(),
                        message: e.to_string(),
                    },
                )
                .await;
                return Ok(());
            }
        }

        self.emit(
            ctx,
            PipelineEvent::RunCompleted {
                layers_scored: ctx.summary.layers_scored,
                layers_degraded: ctx.summary.degraded_layers.len(),
                patterns_matched: ctx.summary.top_matches.len(),
                simulations: ctx.summary.simulations_completed,
            },
        )
        .await;
        Ok(())
    }

    /// Load the records upstream of `start` from the store.
    async fn load_upstream(
        &self,
        ctx: &mut RunContext,
        start: PipelineState,
        options: &PipelineOptions,
    ) -> EngineResult<()> {
        let latest = self.store.fetch_latest(&ctx.topic_id).await?;
        if latest.layers.is_empty() {
            return Err(EngineError::validation(format!(
                "topic '{}' has no stored layers to resume from",
                ctx.topic_id
            )));
        }
        ctx.summary.layers_scored = latest.layers.len();
        ctx.results.layers = latest.layers;
        if start > PipelineState::AggregatingFactors {
            ctx.results.factors = latest.factors;
        }
        if start > PipelineState::AggregatingSegments {
            ctx.results.segments = latest.segments;
            ctx.results.overall = latest.overall;
            ctx.summary.overall_score = ctx.results.overall.as_ref().map(|o| o.value);
        }
        if start > PipelineState::MatchingPatterns {
            ctx.summary.patterns_evaluated = latest.pattern_matches.len();
            ctx.summary.top_matches =
                rank_matches(&latest.pattern_matches, self.top_k(options));
            ctx.results.pattern_matches = latest.pattern_matches;
        }
        log::info!("topic {}: resuming at {}", ctx.topic_id, start.name());
        Ok(())
    }

    // ── Stages ─────────────────────────────────────────────────

    async fn stage_score_layers(
        &self,
        ctx: &mut RunContext,
        cancel: Option<&AtomicBool>,
    ) -> StageOutcome {
        let digest = match self.load_evidence(&ctx.topic_id).await {
            Ok(d) => d,
            Err(e) => {
                let message = e.to_string();
                ctx.summary
                    .degradations
                    .push(format!("evidence unavailable: {message}"));
                self.emit(ctx, PipelineEvent::EvidenceUnavailable { message })
                    .await;
                EvidenceDigest::default()
            }
        };

        let slots = self.config.hierarchy.layers();
        let batch_size = self.config.scoring.batch_size.max(1);
        for (batch_index, batch) in slots.chunks(batch_size).enumerate() {
            if batch_index > 0 && is_cancelled(cancel) {
                return StageOutcome::Cancelled;
            }
            let records = self
                .score_slots(&ctx.topic_id, batch, &digest, Some(&ctx.run_token))
                .await;
            let degraded = records.iter().filter(|r| r.is_degraded()).count();
            for record in records.iter().filter(|r| r.is_degraded()) {
                let reason = record.degraded_reason.clone().unwrap_or_default();
                ctx.summary.degraded_layers.push(LayerDegradation {
                    layer_id: record.layer_id.clone(),
                    reason: reason.clone(),
                });
                self.emit(
                    ctx,
                    PipelineEvent::LayerDegraded {
                        layer_id: record.layer_id.clone(),
                        reason,
                    },
                )
                .await;
            }

            // Checkpoint; the final PERSISTING write stays authoritative.
            if let Err(e) = self.store.upsert_layers(&records).await {
                log::warn!(
                    "topic {}: checkpoint of batch {batch_index} failed: {e}",
                    ctx.topic_id
                );
                ctx.summary
                    .degradations
                    .push(format!("checkpoint batch {batch_index}: {e}"));
                self.emit(
                    ctx,
                    PipelineEvent::CheckpointFailed {
                        batch_index,
                        message: e.to_string(),
                    },
                )
                .await;
            }
            self.emit(
                ctx,
                PipelineEvent::LayerBatchCompleted {
                    batch_index,
                    layers: records.len(),
                    degraded,
                },
            )
            .await;
            ctx.summary.layers_scored += records.len();
            ctx.results.layers.extend(records);
        }
        StageOutcome::Continue
    }

    fn stage_aggregate_factors(&self, ctx: &mut RunContext) -> StageOutcome {
        let factors = factor_aggregator::aggregate_factors(
            &ctx.topic_id,
            &self.config.hierarchy,
            &ctx.results.layers,
            Some(&ctx.run_token),
        );
        ctx.summary.insufficient_factors = factors
            .iter()
            .filter(|f| f.insufficient_data)
            .map(|f| f.factor_id.clone())
            .collect();
        ctx.results.factors = factors;
        StageOutcome::Continue
    }

    fn stage_aggregate_segments(&self, ctx: &mut RunContext) -> StageOutcome {
        let (segments, overall) = segment_aggregator::aggregate_segments(
            &ctx.topic_id,
            &self.config.hierarchy,
            &ctx.results.factors,
            Some(&ctx.run_token),
        );
        ctx.summary.insufficient_segments = segments
            .iter()
            .filter(|s| s.insufficient_data)
            .map(|s| s.segment_id.clone())
            .collect();
        ctx.summary.overall_score = Some(overall.value);
        ctx.results.segments = segments;
        ctx.results.overall = Some(overall);
        StageOutcome::Continue
    }

    async fn stage_match_patterns(
        &self,
        ctx: &mut RunContext,
        options: &PipelineOptions,
    ) -> StageOutcome {
        let snapshot = MetricSnapshot::from_records(
            &ctx.results.factors,
            &ctx.results.segments,
            ctx.results.overall.as_ref(),
        );
        let evaluations =
            self.matcher
                .evaluate_all(&ctx.topic_id, &self.catalog, &snapshot, Some(&ctx.run_token));
        let ranked = rank_matches(&evaluations, self.top_k(options));
        for m in &ranked {
            self.emit(
                ctx,
                PipelineEvent::PatternMatched {
                    pattern_id: m.pattern_id.clone(),
                    match_score: m.match_score,
                    confidence: m.confidence,
                },
            )
            .await;
        }
        ctx.summary.patterns_evaluated = evaluations.len();
        ctx.summary.top_matches = ranked;
        ctx.results.pattern_matches = evaluations;
        StageOutcome::Continue
    }

    async fn stage_simulate(&self, ctx: &mut RunContext) -> EngineResult<StageOutcome> {
        let patterns: Vec<_> = ctx
            .summary
            .top_matches
            .iter()
            .filter_map(|m| self.catalog.get(&m.pattern_id).cloned())
            .collect();
        let simulator = self.simulator.clone();
        let topic_id = ctx.topic_id.clone();
        let run_token = ctx.run_token.clone();
        let outcomes = tokio::task::spawn_blocking(move || {
            patterns
                .iter()
                .map(|p| {
                    let results = simulator.simulate_pattern(&topic_id, p, Some(&run_token));
                    (p.pattern_id.clone(), results)
                })
                .collect::<Vec<_>>()
        })
        .await?;

        let mut skipped = Vec::new();
        for (pattern_id, results) in outcomes {
            if results.is_empty() {
                skipped.push(SkippedSimulation {
                    pattern_id: pattern_id.clone(),
                    kpi_id: None,
                    reason: "no KPI anchors".into(),
                });
            }
            let (completed, failed) = split_outcomes(&pattern_id, results);
            for s in &failed {
                log::warn!(
                    "simulation {pattern_id}/{} skipped: {}",
                    s.kpi_id.as_deref().unwrap_or("-"),
                    s.reason
                );
            }
            ctx.summary.simulations_completed += completed.len();
            ctx.results.simulations.extend(completed.into_values());
            skipped.extend(failed);
        }
        for s in &skipped {
            self.emit(
                ctx,
                PipelineEvent::SimulationSkipped {
                    pattern_id: s.pattern_id.clone(),
                    kpi_id: s.kpi_id.clone().unwrap_or_default(),
                    reason: s.reason.clone(),
                },
            )
            .await;
        }
        ctx.summary.skipped_simulations.extend(skipped);
        Ok(StageOutcome::Continue)
    }

    // ── Helpers ────────────────────────────────────────────────

    /// Stages can outlast a short lease; the holder re-acquires before each.
    async fn renew_lock(&self, ctx: &RunContext) {
        let lease = self.config.persistence.lock_lease();
        match self
            .store
            .acquire_topic_lock(&ctx.topic_id, &ctx.run_token, lease)
            .await
        {
            Ok(true) => {}
            Ok(false) => log::warn!(
                "topic {}: lock lost to another run; continuing {}",
                ctx.topic_id,
                ctx.run_token
            ),
            Err(e) => log::warn!("topic {}: lock renewal failed: {e}", ctx.topic_id),
        }
    }

    fn top_k(&self, options: &PipelineOptions) -> usize {
        options.top_k.unwrap_or(self.config.matching.default_top_k)
    }

    async fn load_evidence(&self, topic_id: &str) -> EngineResult<EvidenceDigest> {
        let items = self.content.evidence(topic_id).await?;
        let digest = self.scorer.digest(&items);
        log::debug!(
            "topic {topic_id}: {} evidence items, {} used",
            items.len(),
            digest.count
        );
        Ok(digest)
    }

    /// Score slots with at most `batch_size` generator calls in flight.
    /// Output order follows `slots`.
    async fn score_slots(
        &self,
        topic_id: &str,
        slots: &[LayerSlot<'_>],
        digest: &EvidenceDigest,
        run_token: Option<&str>,
    ) -> Vec<LayerRecord> {
        let concurrency = self.config.scoring.batch_size.max(1);
        let mut scored: Vec<(usize, LayerRecord)> = stream::iter(slots.iter().enumerate())
            .map(|(i, slot)| async move {
                (i, self.scorer.score_layer(topic_id, slot, digest, run_token).await)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        scored.sort_by_key(|(i, _)| *i);
        scored.into_iter().map(|(_, r)| r).collect()
    }

    async fn transition(&self, ctx: &mut RunContext, next: PipelineState) -> EngineResult<()> {
        ctx.state.advance(next)?;
        log::info!("topic {}: → {}", ctx.topic_id, next.name());
        self.emit(
            ctx,
            PipelineEvent::StateEntered {
                state: next.name().to_string(),
            },
        )
        .await;
        Ok(())
    }

    async fn cancel(&self, ctx: &mut RunContext) -> EngineResult<()> {
        let at = ctx.state;
        ctx.state.advance(PipelineState::Cancelled)?;
        log::warn!("topic {}: cancelled during {}", ctx.topic_id, at.name());
        self.emit(
            ctx,
            PipelineEvent::RunCancelled {
                state: at.name().to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Event log writes never fail a run.
    async fn emit(&self, ctx: &RunContext, event: PipelineEvent) {
        let entry = match EventLogEntry::new(&ctx.topic_id, &ctx.run_token, &event) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("topic {}: event not serialisable: {e}", ctx.topic_id);
                return;
            }
        };
        if let Err(e) = self.store.append_event(&entry).await {
            log::warn!(
                "topic {}: event {} not recorded: {e}",
                ctx.topic_id,
                entry.event_type
            );
        }
    }

    /// Retry a store write with exponential backoff.
    async fn with_retry<F, Fut>(&self, what: &str, mut op: F) -> EngineResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<()>>,
    {
        let attempts = self.config.persistence.max_attempts.max(1);
        let base = Duration::from_millis(self.config.persistence.retry_base_delay_ms);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e.to_string();
                    log::warn!("{what}: attempt {}/{attempts} failed: {e}", attempt + 1);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(backoff_delay(base, attempt)).await;
                    }
                }
            }
        }
        Err(EngineError::Persistence {
            attempts,
            message: last_error,
        })
    }
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|c| c.load(Ordering::Relaxed))
}

/// Separate per-KPI outcomes into results and skips.
fn split_outcomes(
    pattern_id: &str,
    outcomes: BTreeMap<KpiId, EngineResult<SimulationResult>>,
) -> (BTreeMap<KpiId, SimulationResult>, Vec<SkippedSimulation>) {
    let mut results = BTreeMap::new();
    let mut skipped = Vec::new();
    for (kpi_id, outcome) in outcomes {
        match outcome {
            Ok(result) => {
                results.insert(kpi_id, result);
            }
            Err(e) => skipped.push(SkippedSimulation {
                pattern_id: pattern_id.to_string(),
                kpi_id: Some(kpi_id),
                reason: e.to_string(),
            }),
        }
    }
    (results, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_path_is_legal() {
        let mut state = PipelineState::Pending;
        for next in [
            PipelineState::ScoringLayers,
            PipelineState::AggregatingFactors,
            PipelineState::AggregatingSegments,
            PipelineState::MatchingPatterns,
            PipelineState::Simulating,
            PipelineState::Persisting,
            PipelineState::Completed,
        ] {
            state.advance(next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn failed_only_from_persisting() {
        for from in [
            PipelineState::Pending,
            PipelineState::ScoringLayers,
            PipelineState::AggregatingFactors,
            PipelineState::MatchingPatterns,
            PipelineState::Simulating,
        ] {
            assert!(!from.can_transition_to(PipelineState::Failed), "{from:?}");
        }
        assert!(PipelineState::Persisting.can_transition_to(PipelineState::Failed));
    }

    #[test]
    fn skipping_and_reversing_are_rejected() {
        let mut state = PipelineState::ScoringLayers;
        let err = state.advance(PipelineState::MatchingPatterns).unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));
        assert_eq!(state, PipelineState::ScoringLayers, "state unchanged on rejection");

        let mut done = PipelineState::Completed;
        assert!(done.advance(PipelineState::Pending).is_err());
        assert!(done.advance(PipelineState::Cancelled).is_err());
    }

    #[test]
    fn resume_entry_points() {
        assert!(PipelineState::Pending.can_transition_to(PipelineState::AggregatingFactors));
        assert!(PipelineState::Pending.can_transition_to(PipelineState::Simulating));
        assert!(!PipelineState::Pending.can_transition_to(PipelineState::Persisting));
        assert!(!PipelineState::ScoringLayers.is_resumable());
    }

    #[test]
    fn persisting_cannot_be_cancelled() {
        assert!(PipelineState::Simulating.can_transition_to(PipelineState::Cancelled));
        assert!(!PipelineState::Persisting.can_transition_to(PipelineState::Cancelled));
    }

    #[test]
    fn state_names_round_trip() {
        assert_eq!(
            PipelineState::from_name("aggregating-factors"),
            Some(PipelineState::AggregatingFactors)
        );
        assert_eq!(PipelineState::from_name("nope"), None);
        let json = serde_json::to_string(&PipelineState::MatchingPatterns).unwrap();
        assert_eq!(json, "\"MATCHING_PATTERNS\"");
    }

    #[test]
    fn failed_kpi_does_not_drop_its_siblings() {
        let config = crate::config::EngineConfig::default_test();
        let simulator = MonteCarloSimulator::new(&config.simulation).with_seed(Some(3));
        let mut pattern = config.patterns[0].clone();
        pattern.kpi_anchors[0].sample_count = Some(0);
        let bad_kpi = pattern.kpi_anchors[0].kpi_id.clone();

        let outcomes = simulator.simulate_pattern("t1", &pattern, None);
        let (results, skipped) = split_outcomes(&pattern.pattern_id, outcomes);

        assert_eq!(results.len(), pattern.kpi_anchors.len() - 1);
        assert!(!results.contains_key(&bad_kpi));
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].kpi_id.as_deref(), Some(bad_kpi.as_str()));
        assert!(skipped[0].reason.contains("sample_count"), "{}", skipped[0].reason);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(50);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(50));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(1600));
    }
}
