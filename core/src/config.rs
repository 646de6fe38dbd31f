use crate::{
    error::{EngineError, EngineResult},
    monte_carlo::{DistributionFamily, KpiAnchor},
    pattern_matcher::Comparator,
    types::{FactorId, LayerId, PatternId, SegmentId},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

pub const DEFAULT_PROMPT_TEMPLATE: &str = "\
You are {persona}.
You are assessing the layer \"{layer_name}\" for topic {topic_id}.
Focus: {layer_focus}

Evidence:
{evidence}

Respond in exactly this format:
SCORE: <number between 0 and 1>
CONFIDENCE: <number between 0 and 1>
INSIGHTS:
- <insight>
- <insight>
- <insight>";

// ── Hierarchy catalog ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub id: LayerId,
    pub label: String,
    pub persona: String,
    #[serde(default)]
    pub focus: String,
    pub weight: f64,
    /// Overrides `ScoringConfig::prompt_template` for this layer.
    #[serde(default)]
    pub prompt_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorConfig {
    pub id: FactorId,
    pub label: String,
    pub weight: f64,
    pub layers: Vec<LayerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub id: SegmentId,
    pub label: String,
    /// Weight among segments for the overall score. When every segment
    /// leaves this unset, segments are weighted equally.
    #[serde(default)]
    pub weight: Option<f64>,
    pub factors: Vec<FactorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyCatalog {
    pub segments: Vec<SegmentConfig>,
}

/// A layer with its parent ids resolved, in catalog order.
#[derive(Debug, Clone)]
pub struct LayerSlot<'a> {
    pub factor_id: &'a str,
    pub layer: &'a LayerConfig,
}

impl HierarchyCatalog {
    pub fn layers(&self) -> Vec<LayerSlot<'_>> {
        self.segments
            .iter()
            .flat_map(|s| {
                s.factors.iter().flat_map(move |f| {
                    f.layers.iter().map(move |l| LayerSlot {
                        factor_id: &f.id,
                        layer: l,
                    })
                })
            })
            .collect()
    }

    pub fn factors(&self) -> impl Iterator<Item = (&SegmentConfig, &FactorConfig)> {
        self.segments
            .iter()
            .flat_map(|s| s.factors.iter().map(move |f| (s, f)))
    }

    pub fn layer_count(&self) -> usize {
        self.factors().map(|(_, f)| f.layers.len()).sum()
    }

    /// Effective segment weights: configured values, or 1/N each when
    /// no segment carries an explicit weight.
    pub fn segment_weights(&self) -> BTreeMap<SegmentId, f64> {
        let any_explicit = self.segments.iter().any(|s| s.weight.is_some());
        let n = self.segments.len().max(1) as f64;
        self.segments
            .iter()
            .map(|s| {
                let w = if any_explicit {
                    s.weight.unwrap_or(0.0)
                } else {
                    1.0 / n
                };
                (s.id.clone(), w)
            })
            .collect()
    }

    /// Every id a pattern condition may reference.
    pub fn metric_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self.segments.iter().map(|s| s.id.clone()).collect();
        ids.extend(self.factors().map(|(_, f)| f.id.clone()));
        ids.insert(crate::types::OVERALL_METRIC.to_string());
        ids
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.segments.is_empty() {
            return Err(EngineError::validation("hierarchy has no segments"));
        }
        let mut seen = HashSet::new();
        let mut claim = |id: &str| -> EngineResult<()> {
            if id == crate::types::OVERALL_METRIC {
                return Err(EngineError::validation(format!(
                    "'{id}' is reserved for the overall score"
                )));
            }
            if !seen.insert(id.to_string()) {
                return Err(EngineError::validation(format!("duplicate catalog id '{id}'")));
            }
            Ok(())
        };
        for segment in &self.segments {
            claim(&segment.id)?;
            if let Some(w) = segment.weight {
                check_weight(&segment.id, w)?;
            }
            for factor in &segment.factors {
                claim(&factor.id)?;
                check_weight(&factor.id, factor.weight)?;
                for layer in &factor.layers {
                    claim(&layer.id)?;
                    check_weight(&layer.id, layer.weight)?;
                }
            }
        }
        Ok(())
    }
}

fn check_weight(id: &str, weight: f64) -> EngineResult<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(EngineError::validation(format!(
            "weight of '{id}' must be a finite non-negative number, got {weight}"
        )));
    }
    Ok(())
}

// ── Pattern catalog ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub metric_id: String,
    pub comparator: Comparator,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub pattern_id: PatternId,
    pub name: String,
    pub type_tag: String,
    #[serde(default)]
    pub segments_involved: Vec<SegmentId>,
    pub trigger_conditions: Vec<TriggerCondition>,
    pub strategic_response: String,
    #[serde(default)]
    pub kpi_anchors: Vec<KpiAnchor>,
    pub base_confidence: f64,
    pub evidence_strength: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct PatternCatalogFile {
    patterns: Vec<PatternConfig>,
}

// ── Engine tuning ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Concurrent generator calls per batch.
    pub batch_size: usize,
    pub call_timeout_ms: u64,
    pub max_evidence_items: usize,
    pub max_chars_per_item: usize,
    pub max_insights: usize,
    /// Confidence assigned when a score parses but no confidence does.
    pub default_confidence: f64,
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
}

fn default_prompt_template() -> String {
    DEFAULT_PROMPT_TEMPLATE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub partial_match_threshold: f64,
    pub default_top_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub sample_count: usize,
    pub success_reference: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// A topic lock older than this is stale and may be taken over.
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
}

impl PersistenceConfig {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }
}

fn default_lock_lease_ms() -> u64 {
    900_000
}

#[derive(Debug, Clone, Deserialize)]
struct EngineTuningFile {
    scoring: ScoringConfig,
    matching: MatchingConfig,
    simulation: SimulationConfig,
    persistence: PersistenceConfig,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub hierarchy: HierarchyCatalog,
    pub patterns: Vec<PatternConfig>,
    pub scoring: ScoringConfig,
    pub matching: MatchingConfig,
    pub simulation: SimulationConfig,
    pub persistence: PersistenceConfig,
}

impl EngineConfig {
    /// Load from the data/ directory.
    /// In tests, use EngineConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let hierarchy_path = format!("{data_dir}/hierarchy/catalog.json");
        let hierarchy_content = std::fs::read_to_string(&hierarchy_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {hierarchy_path}: {e}"))?;
        let hierarchy: HierarchyCatalog = serde_json::from_str(&hierarchy_content)?;

        let pattern_path = format!("{data_dir}/patterns/pattern_catalog.json");
        let pattern_content = std::fs::read_to_string(&pattern_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {pattern_path}: {e}"))?;
        let pattern_file: PatternCatalogFile = serde_json::from_str(&pattern_content)?;

        let tuning_path = format!("{data_dir}/engine/engine_config.json");
        let tuning_content = std::fs::read_to_string(&tuning_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {tuning_path}: {e}"))?;
        let tuning: EngineTuningFile = serde_json::from_str(&tuning_content)?;

        let config = Self {
            hierarchy,
            patterns: pattern_file.patterns,
            scoring: tuning.scoring,
            matching: tuning.matching,
            simulation: tuning.simulation,
            persistence: tuning.persistence,
        };
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration in {data_dir}: {e}"))?;
        Ok(config)
    }

    /// Check tuning bounds and the hierarchy. Pattern validation lives in
    /// `PatternCatalog::build`, which needs the hierarchy's metric ids.
    pub fn validate(&self) -> EngineResult<()> {
        self.hierarchy.validate()?;

        let s = &self.scoring;
        if !(1..=64).contains(&s.batch_size) {
            return Err(EngineError::validation(format!(
                "scoring.batch_size must be in 1..=64, got {}",
                s.batch_size
            )));
        }
        if s.call_timeout_ms == 0 {
            return Err(EngineError::validation("scoring.call_timeout_ms must be > 0"));
        }
        if !(0.0..=1.0).contains(&s.default_confidence) {
            return Err(EngineError::validation(
                "scoring.default_confidence must lie in [0, 1]",
            ));
        }

        let t = self.matching.partial_match_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(EngineError::validation(format!(
                "matching.partial_match_threshold must lie in (0, 1], got {t}"
            )));
        }
        if self.simulation.sample_count == 0 {
            return Err(EngineError::validation("simulation.sample_count must be >= 1"));
        }
        if !self.simulation.success_reference.is_finite() {
            return Err(EngineError::validation(
                "simulation.success_reference must be finite",
            ));
        }
        if self.persistence.max_attempts == 0 {
            return Err(EngineError::validation("persistence.max_attempts must be >= 1"));
        }
        if self.persistence.lock_lease_ms == 0 {
            return Err(EngineError::validation("persistence.lock_lease_ms must be > 0"));
        }
        Ok(())
    }

    /// Config with hardcoded defaults for use in unit tests.
    ///
    /// Five segments S1..S5, seven factors F1..F7, two layers per factor.
    /// Two patterns: P1 (F1 > 0.6, S2 < 0.5) and P2 (four conditions).
    pub fn default_test() -> Self {
        let factor = |id: &str, weight: f64, layer_ids: [&str; 2]| FactorConfig {
            id: id.into(),
            label: format!("Factor {id}"),
            weight,
            layers: layer_ids
                .iter()
                .map(|lid| LayerConfig {
                    id: (*lid).into(),
                    label: format!("Layer {lid}"),
                    persona: "a senior strategy analyst".into(),
                    focus: format!("signals relevant to {lid}"),
                    weight: 0.5,
                    prompt_template: None,
                })
                .collect(),
        };
        let segment = |id: &str, factors: Vec<FactorConfig>| SegmentConfig {
            id: id.into(),
            label: format!("Segment {id}"),
            weight: None,
            factors,
        };

        let hierarchy = HierarchyCatalog {
            segments: vec![
                segment(
                    "S1",
                    vec![factor("F1", 0.5, ["L1", "L2"]), factor("F2", 0.5, ["L3", "L4"])],
                ),
                segment(
                    "S2",
                    vec![factor("F3", 0.5, ["L5", "L6"]), factor("F4", 0.5, ["L7", "L8"])],
                ),
                segment("S3", vec![factor("F5", 1.0, ["L9", "L10"])]),
                segment("S4", vec![factor("F6", 1.0, ["L11", "L12"])]),
                segment("S5", vec![factor("F7", 1.0, ["L13", "L14"])]),
            ],
        };

        let anchor = |kpi_id: &str, family: DistributionFamily, params: &[(&str, f64)]| KpiAnchor {
            kpi_id: kpi_id.into(),
            distribution_family: family,
            parameters: params.iter().map(|(k, v)| ((*k).to_string(), *v)).collect(),
            sample_count: None,
            success_reference: None,
        };

        let patterns = vec![
            PatternConfig {
                pattern_id: "P1".into(),
                name: "Momentum gap".into(),
                type_tag: "opportunity".into(),
                segments_involved: vec!["S1".into(), "S2".into()],
                trigger_conditions: vec![
                    TriggerCondition {
                        metric_id: "F1".into(),
                        comparator: Comparator::Gt,
                        threshold: 0.6,
                    },
                    TriggerCondition {
                        metric_id: "S2".into(),
                        comparator: Comparator::Lt,
                        threshold: 0.5,
                    },
                ],
                strategic_response: "Invest behind the leading factor while S2 lags.".into(),
                kpi_anchors: vec![
                    anchor(
                        "revenue_growth_pct",
                        DistributionFamily::Triangular,
                        &[("low", 6.0), ("mode", 9.0), ("high", 12.0)],
                    ),
                    anchor("share_shift_pts", DistributionFamily::Normal, &[("mean", 1.5), ("std_dev", 1.0)]),
                ],
                base_confidence: 0.8,
                evidence_strength: 0.9,
            },
            PatternConfig {
                pattern_id: "P2".into(),
                name: "Broad strength".into(),
                type_tag: "defensive".into(),
                segments_involved: vec!["S3".into(), "S4".into(), "S5".into()],
                trigger_conditions: vec![
                    TriggerCondition {
                        metric_id: "S3".into(),
                        comparator: Comparator::Ge,
                        threshold: 0.5,
                    },
                    TriggerCondition {
                        metric_id: "S4".into(),
                        comparator: Comparator::Ge,
                        threshold: 0.5,
                    },
                    TriggerCondition {
                        metric_id: "S5".into(),
                        comparator: Comparator::Ge,
                        threshold: 0.5,
                    },
                    TriggerCondition {
                        metric_id: "overall".into(),
                        comparator: Comparator::Ge,
                        threshold: 0.5,
                    },
                ],
                strategic_response: "Consolidate position across dimensions.".into(),
                kpi_anchors: vec![anchor(
                    "retention_rate",
                    DistributionFamily::Beta,
                    &[("alpha", 8.0), ("beta", 2.0)],
                )],
                base_confidence: 0.7,
                evidence_strength: 0.8,
            },
        ];

        Self {
            hierarchy,
            patterns,
            scoring: ScoringConfig {
                batch_size: 4,
                call_timeout_ms: 2_000,
                max_evidence_items: 10,
                max_chars_per_item: 600,
                max_insights: 8,
                default_confidence: 0.5,
                prompt_template: DEFAULT_PROMPT_TEMPLATE.into(),
            },
            matching: MatchingConfig {
                partial_match_threshold: 0.75,
                default_top_k: 4,
            },
            simulation: SimulationConfig {
                sample_count: 1000,
                success_reference: 0.0,
                seed: Some(42),
            },
            persistence: PersistenceConfig {
                max_attempts: 3,
                retry_base_delay_ms: 1,
                lock_lease_ms: 60_000,
            },
        }
    }
}
