//! Segment aggregator: factors to segments, segments to one overall score.
//!
//! Factors flagged insufficient_data are left out of their segment.
//! Segments flagged insufficient_data are left out of the overall score.

use crate::{
    aggregation::{weighted_mean, WeightedInput},
    config::{HierarchyCatalog, SegmentConfig},
    factor_aggregator::FactorRecord,
    provenance::{Provenance, Stage},
    types::{SegmentId, TopicId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentRecord {
    pub topic_id: TopicId,
    pub segment_id: SegmentId,
    pub weight_among_segments: f64,
    pub value: f64,
    pub confidence: f64,
    pub insufficient_data: bool,
    pub input_count: usize,
    pub provenance: Provenance,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverallScore {
    pub topic_id: TopicId,
    pub value: f64,
    pub confidence: f64,
    pub insufficient_data: bool,
    pub input_count: usize,
    pub provenance: Provenance,
    pub computed_at: DateTime<Utc>,
}

pub fn aggregate_segment(
    topic_id: &str,
    segment: &SegmentConfig,
    weight_among_segments: f64,
    factors: &[&FactorRecord],
    run_token: Option<&str>,
) -> SegmentRecord {
    let inputs: Vec<WeightedInput> = factors
        .iter()
        .filter(|f| !f.insufficient_data)
        .map(|f| WeightedInput {
            id: f.factor_id.clone(),
            value: f.value,
            confidence: f.confidence,
            weight: f.weight_in_segment,
        })
        .collect();
    let outcome = weighted_mean(&inputs);
    if outcome.renormalized {
        log::debug!(
            "segment {topic_id}/{}: factor weights renormalised over {} inputs",
            segment.id,
            outcome.input_count
        );
    }

    SegmentRecord {
        topic_id: topic_id.to_string(),
        segment_id: segment.id.clone(),
        weight_among_segments,
        value: outcome.value,
        confidence: outcome.confidence,
        insufficient_data: outcome.insufficient_data,
        input_count: outcome.input_count,
        provenance: Provenance::new(Stage::SegmentAggregation, "weighted_mean")
            .with_inputs(inputs.iter().map(|i| i.id.clone()))
            .with_run_token(run_token),
        computed_at: Utc::now(),
    }
}

pub fn aggregate_overall(
    topic_id: &str,
    segments: &[SegmentRecord],
    run_token: Option<&str>,
) -> OverallScore {
    let inputs: Vec<WeightedInput> = segments
        .iter()
        .filter(|s| !s.insufficient_data)
        .map(|s| WeightedInput {
            id: s.segment_id.clone(),
            value: s.value,
            confidence: s.confidence,
            weight: s.weight_among_segments,
        })
        .collect();
    let outcome = weighted_mean(&inputs);

    OverallScore {
        topic_id: topic_id.to_string(),
        value: outcome.value,
        confidence: outcome.confidence,
        insufficient_data: outcome.insufficient_data,
        input_count: outcome.input_count,
        provenance: Provenance::new(Stage::OverallAggregation, "weighted_mean")
            .with_inputs(inputs.iter().map(|i| i.id.clone()))
            .with_run_token(run_token),
        computed_at: Utc::now(),
    }
}

/// Aggregate every catalog segment, then the overall score.
pub fn aggregate_segments(
    topic_id: &str,
    hierarchy: &HierarchyCatalog,
    factors: &[FactorRecord],
    run_token: Option<&str>,
) -> (Vec<SegmentRecord>, OverallScore) {
    let weights = hierarchy.segment_weights();
    let segments: Vec<SegmentRecord> = hierarchy
        .segments
        .iter()
        .map(|segment| {
            let members: Vec<&FactorRecord> = factors
                .iter()
                .filter(|f| f.topic_id == topic_id && f.parent_segment_id == segment.id)
                .collect();
            let weight = weights.get(&segment.id).copied().unwrap_or(0.0);
            aggregate_segment(topic_id, segment, weight, &members, run_token)
        })
        .collect();
    let overall = aggregate_overall(topic_id, &segments, run_token);
    (segments, overall)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn factor(id: &str, segment: &str, value: f64, weight: f64) -> FactorRecord {
        FactorRecord {
            topic_id: "t1".into(),
            factor_id: id.into(),
            parent_segment_id: segment.into(),
            weight_in_segment: weight,
            value,
            confidence: 0.8,
            insufficient_data: false,
            input_count: 2,
            provenance: Provenance::new(Stage::FactorAggregation, "test"),
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn insufficient_factors_are_excluded() {
        let config = EngineConfig::default_test();
        let mut empty = factor("F2", "S1", 0.0, 0.5);
        empty.insufficient_data = true;
        empty.confidence = 0.0;
        let factors = vec![factor("F1", "S1", 0.7, 0.5), empty];

        let (segments, _) = aggregate_segments("t1", &config.hierarchy, &factors, None);
        let s1 = segments.iter().find(|s| s.segment_id == "S1").unwrap();
        assert!((s1.value - 0.7).abs() < 1e-12);
        assert_eq!(s1.input_count, 1);
    }

    #[test]
    fn overall_uses_equal_fifths_by_default() {
        let config = EngineConfig::default_test();
        let factors = vec![
            factor("F1", "S1", 1.0, 0.5),
            factor("F2", "S1", 1.0, 0.5),
            factor("F3", "S2", 0.0, 0.5),
            factor("F4", "S2", 0.0, 0.5),
            factor("F5", "S3", 0.5, 1.0),
            factor("F6", "S4", 0.5, 1.0),
            factor("F7", "S5", 0.5, 1.0),
        ];
        let (segments, overall) = aggregate_segments("t1", &config.hierarchy, &factors, None);
        assert_eq!(segments.len(), 5);
        assert!(segments.iter().all(|s| (s.weight_among_segments - 0.2).abs() < 1e-12));
        assert!((overall.value - 0.5).abs() < 1e-12);
        assert!(!overall.insufficient_data);
        assert_eq!(overall.provenance.stage, Stage::OverallAggregation);
    }

    #[test]
    fn configured_segment_weights_override_equal_split() {
        let mut config = EngineConfig::default_test();
        for (i, segment) in config.hierarchy.segments.iter_mut().enumerate() {
            segment.weight = Some(if i == 0 { 3.0 } else { 0.25 });
        }
        let factors = vec![factor("F1", "S1", 1.0, 1.0), factor("F3", "S2", 0.0, 1.0)];
        let (_, overall) = aggregate_segments("t1", &config.hierarchy, &factors, None);
        // S3..S5 are insufficient; S1 carries 3.0 against S2's 0.25.
        assert!((overall.value - 3.0 / 3.25).abs() < 1e-12);
    }

    #[test]
    fn no_factors_means_insufficient_everywhere() {
        let config = EngineConfig::default_test();
        let (segments, overall) = aggregate_segments("t1", &config.hierarchy, &[], None);
        assert!(segments.iter().all(|s| s.insufficient_data && s.value == 0.0));
        assert!(overall.insufficient_data);
        assert_eq!(overall.value, 0.0);
        assert_eq!(overall.confidence, 0.0);
    }
}
