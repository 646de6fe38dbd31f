//! Pattern matcher: declarative threshold rules over factor/segment scores.
//!
//! This module:
//!   1. Validates the static pattern catalog against the hierarchy
//!      (unknown metric ids are rejected at load, never at evaluation)
//!   2. Scores each pattern: match_score = satisfied / total conditions
//!   3. Marks a pattern matched iff match_score >= partial_match_threshold
//!   4. Ranks matched patterns by confidence, truncated to top-K
//!
//! Conditions on a metric flagged insufficient_data count as unsatisfied.

use crate::{
    config::{HierarchyCatalog, MatchingConfig, PatternConfig},
    error::{EngineError, EngineResult},
    factor_aggregator::FactorRecord,
    monte_carlo::MonteCarloSimulator,
    provenance::{Provenance, Stage},
    segment_aggregator::{OverallScore, SegmentRecord},
    types::{clamp_unit, PatternId, TopicId, OVERALL_METRIC},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const EQ_TOLERANCE: f64 = 1e-9;

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Comparator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

impl Comparator {
    pub fn holds(&self, actual: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => actual > threshold,
            Self::Ge => actual >= threshold,
            Self::Lt => actual < threshold,
            Self::Le => actual <= threshold,
            Self::Eq => (actual - threshold).abs() <= EQ_TOLERANCE,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricValue {
    pub value: f64,
    pub insufficient_data: bool,
}

/// Current factor, segment and overall values for one topic,
/// keyed by metric id.
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    values: HashMap<String, MetricValue>,
}

impl MetricSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(
        factors: &[FactorRecord],
        segments: &[SegmentRecord],
        overall: Option<&OverallScore>,
    ) -> Self {
        let mut snapshot = Self::new();
        for f in factors {
            snapshot.insert(&f.factor_id, f.value, f.insufficient_data);
        }
        for s in segments {
            snapshot.insert(&s.segment_id, s.value, s.insufficient_data);
        }
        if let Some(o) = overall {
            snapshot.insert(OVERALL_METRIC, o.value, o.insufficient_data);
        }
        snapshot
    }

    pub fn insert(&mut self, metric_id: &str, value: f64, insufficient_data: bool) {
        self.values.insert(
            metric_id.to_string(),
            MetricValue { value, insufficient_data },
        );
    }

    /// Builder form of `insert` for a metric with data.
    pub fn with(mut self, metric_id: &str, value: f64) -> Self {
        self.insert(metric_id, value, false);
        self
    }

    pub fn get(&self, metric_id: &str) -> Option<MetricValue> {
        self.values.get(metric_id).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternMatch {
    pub topic_id: TopicId,
    pub pattern_id: PatternId,
    pub pattern_name: String,
    pub type_tag: String,
    pub match_score: f64,
    pub confidence: f64,
    pub matched: bool,
    pub satisfied_conditions: usize,
    pub total_conditions: usize,
    pub strategic_response: String,
    pub provenance: Provenance,
    pub computed_at: DateTime<Utc>,
}

// ── Catalog ──────────────────────────────────────────────────────────────────

/// The static pattern catalog, validated against a hierarchy.
#[derive(Debug, Clone)]
pub struct PatternCatalog {
    patterns: Vec<PatternConfig>,
}

impl PatternCatalog {
    /// Validate every pattern. Any malformed pattern rejects the whole
    /// catalog so a bad rule can never silently fail to match.
    pub fn build(
        patterns: Vec<PatternConfig>,
        hierarchy: &HierarchyCatalog,
        simulator: &MonteCarloSimulator,
    ) -> EngineResult<Self> {
        let metric_ids = hierarchy.metric_ids();
        let segment_ids: HashSet<&str> =
            hierarchy.segments.iter().map(|s| s.id.as_str()).collect();
        let mut seen = HashSet::new();

        for pattern in &patterns {
            let pid = &pattern.pattern_id;
            if !seen.insert(pid.clone()) {
                return Err(EngineError::validation(format!("duplicate pattern id '{pid}'")));
            }
            if pattern.trigger_conditions.is_empty() {
                return Err(EngineError::validation(format!(
                    "pattern '{pid}' has no trigger conditions"
                )));
            }
            for condition in &pattern.trigger_conditions {
                if !metric_ids.contains(&condition.metric_id) {
                    return Err(EngineError::validation(format!(
                        "pattern '{pid}' references unknown metric '{}'",
                        condition.metric_id
                    )));
                }
                if !(0.0..=1.0).contains(&condition.threshold) {
                    return Err(EngineError::validation(format!(
                        "pattern '{pid}': threshold {} on '{}' outside [0, 1]",
                        condition.threshold, condition.metric_id
                    )));
                }
            }
            for segment in &pattern.segments_involved {
                if !segment_ids.contains(segment.as_str()) {
                    return Err(EngineError::validation(format!(
                        "pattern '{pid}' involves unknown segment '{segment}'"
                    )));
                }
            }
            for (field, value) in [
                ("base_confidence", pattern.base_confidence),
                ("evidence_strength", pattern.evidence_strength),
            ] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(EngineError::validation(format!(
                        "pattern '{pid}': {field} {value} outside [0, 1]"
                    )));
                }
            }
            let mut kpis = HashSet::new();
            for anchor in &pattern.kpi_anchors {
                if !kpis.insert(anchor.kpi_id.as_str()) {
                    return Err(EngineError::validation(format!(
                        "pattern '{pid}' declares KPI '{}' twice",
                        anchor.kpi_id
                    )));
                }
                simulator
                    .validate_anchor(anchor)
                    .map_err(|e| EngineError::validation(format!("pattern '{pid}': {e}")))?;
            }
        }

        log::info!("pattern catalog loaded: {} patterns", patterns.len());
        Ok(Self { patterns })
    }

    pub fn patterns(&self) -> &[PatternConfig] {
        &self.patterns
    }

    pub fn get(&self, pattern_id: &str) -> Option<&PatternConfig> {
        self.patterns.iter().find(|p| p.pattern_id == pattern_id)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

// ── Matcher ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PatternMatcher {
    partial_match_threshold: f64,
}

impl PatternMatcher {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            partial_match_threshold: config.partial_match_threshold,
        }
    }

    pub fn partial_match_threshold(&self) -> f64 {
        self.partial_match_threshold
    }

    pub fn evaluate(
        &self,
        topic_id: &str,
        pattern: &PatternConfig,
        snapshot: &MetricSnapshot,
        run_token: Option<&str>,
    ) -> PatternMatch {
        let total = pattern.trigger_conditions.len();
        let satisfied = pattern
            .trigger_conditions
            .iter()
            .filter(|c| match snapshot.get(&c.metric_id) {
                Some(m) if !m.insufficient_data => c.comparator.holds(m.value, c.threshold),
                Some(_) => false,
                None => {
                    log::debug!(
                        "pattern {}: metric '{}' absent for topic {topic_id}",
                        pattern.pattern_id,
                        c.metric_id
                    );
                    false
                }
            })
            .count();

        let match_score = if total > 0 {
            satisfied as f64 / total as f64
        } else {
            0.0
        };
        let matched = total > 0 && match_score >= self.partial_match_threshold;
        let confidence =
            clamp_unit(pattern.base_confidence * match_score * pattern.evidence_strength);

        PatternMatch {
            topic_id: topic_id.to_string(),
            pattern_id: pattern.pattern_id.clone(),
            pattern_name: pattern.name.clone(),
            type_tag: pattern.type_tag.clone(),
            match_score,
            confidence,
            matched,
            satisfied_conditions: satisfied,
            total_conditions: total,
            strategic_response: pattern.strategic_response.clone(),
            provenance: Provenance::new(Stage::PatternMatching, pattern.pattern_id.clone())
                .with_inputs(pattern.trigger_conditions.iter().map(|c| c.metric_id.clone()))
                .with_run_token(run_token),
            computed_at: Utc::now(),
        }
    }

    /// Evaluate every catalog pattern, in catalog order.
    pub fn evaluate_all(
        &self,
        topic_id: &str,
        catalog: &PatternCatalog,
        snapshot: &MetricSnapshot,
        run_token: Option<&str>,
    ) -> Vec<PatternMatch> {
        catalog
            .patterns()
            .iter()
            .map(|p| self.evaluate(topic_id, p, snapshot, run_token))
            .collect()
    }
}

/// Matched patterns only, by confidence descending (ties by pattern id),
/// truncated to `top_k`.
pub fn rank_matches(evaluations: &[PatternMatch], top_k: usize) -> Vec<PatternMatch> {
    let mut matched: Vec<PatternMatch> =
        evaluations.iter().filter(|m| m.matched).cloned().collect();
    matched.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.pattern_id.cmp(&b.pattern_id))
    });
    matched.truncate(top_k);
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, TriggerCondition};

    fn catalog(config: &EngineConfig) -> EngineResult<PatternCatalog> {
        PatternCatalog::build(
            config.patterns.clone(),
            &config.hierarchy,
            &MonteCarloSimulator::new(&config.simulation),
        )
    }

    #[test]
    fn comparators() {
        assert!(Comparator::Gt.holds(0.7, 0.6));
        assert!(!Comparator::Gt.holds(0.6, 0.6));
        assert!(Comparator::Ge.holds(0.6, 0.6));
        assert!(Comparator::Lt.holds(0.4, 0.5));
        assert!(Comparator::Le.holds(0.5, 0.5));
        assert!(Comparator::Eq.holds(0.1 + 0.2, 0.3));
    }

    #[test]
    fn comparator_serde_symbols() {
        let c: Comparator = serde_json::from_str("\">=\"").unwrap();
        assert_eq!(c, Comparator::Ge);
        assert_eq!(serde_json::to_string(&Comparator::Lt).unwrap(), "\"<\"");
    }

    #[test]
    fn unknown_metric_rejected_at_load() {
        let mut config = EngineConfig::default_test();
        config.patterns[0].trigger_conditions.push(TriggerCondition {
            metric_id: "F99".into(),
            comparator: Comparator::Gt,
            threshold: 0.1,
        });
        let err = catalog(&config).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("F99"));
    }

    #[test]
    fn layer_ids_are_not_metrics() {
        let mut config = EngineConfig::default_test();
        config.patterns[0].trigger_conditions[0].metric_id = "L1".into();
        assert!(catalog(&config).is_err());
    }

    #[test]
    fn invalid_kpi_anchor_rejected_at_load() {
        let mut config = EngineConfig::default_test();
        config.patterns[0].kpi_anchors[0]
            .parameters
            .insert("low".into(), 12.0);
        config.patterns[0].kpi_anchors[0]
            .parameters
            .insert("high".into(), 6.0);
        assert!(catalog(&config).unwrap_err().is_validation());
    }

    #[test]
    fn empty_conditions_rejected() {
        let mut config = EngineConfig::default_test();
        config.patterns[1].trigger_conditions.clear();
        assert!(catalog(&config).is_err());
    }

    #[test]
    fn insufficient_metric_counts_as_unsatisfied() {
        let config = EngineConfig::default_test();
        let catalog = catalog(&config).unwrap();
        let matcher = PatternMatcher::new(&config.matching);
        let mut snapshot = MetricSnapshot::new().with("F1", 0.7);
        snapshot.insert("S2", 0.0, true);
        let m = matcher.evaluate("t1", catalog.get("P1").unwrap(), &snapshot, None);
        assert_eq!(m.satisfied_conditions, 1);
        assert!(!m.matched);
    }

    #[test]
    fn confidence_is_product_of_terms() {
        let config = EngineConfig::default_test();
        let catalog = catalog(&config).unwrap();
        let matcher = PatternMatcher::new(&config.matching);
        let snapshot = MetricSnapshot::new().with("F1", 0.7).with("S2", 0.4);
        let m = matcher.evaluate("t1", catalog.get("P1").unwrap(), &snapshot, None);
        assert!((m.confidence - 0.8 * 1.0 * 0.9).abs() < 1e-12);
    }

    #[test]
    fn ranking_sorts_filters_and_truncates() {
        let config = EngineConfig::default_test();
        let catalog = catalog(&config).unwrap();
        let matcher = PatternMatcher::new(&config.matching);
        let snapshot = MetricSnapshot::new()
            .with("F1", 0.9)
            .with("S2", 0.1)
            .with("S3", 0.9)
            .with("S4", 0.9)
            .with("S5", 0.9)
            .with("overall", 0.2);
        let evaluations = matcher.evaluate_all("t1", &catalog, &snapshot, None);
        assert_eq!(evaluations.len(), 2);

        let ranked = rank_matches(&evaluations, 4);
        assert_eq!(ranked.len(), 2);
        // P1: 0.8 * 1.0 * 0.9 = 0.72; P2: 0.7 * 0.75 * 0.8 = 0.42
        assert_eq!(ranked[0].pattern_id, "P1");
        assert_eq!(ranked[1].pattern_id, "P2");

        let top1 = rank_matches(&evaluations, 1);
        assert_eq!(top1.len(), 1);
        assert_eq!(top1[0].pattern_id, "P1");
    }
}
