//! Factor aggregator: weighted average of a factor's layers.
//!
//! Pure: reads layer records, never calls the text generator.

use crate::{
    aggregation::{weighted_mean, WeightedInput},
    config::{FactorConfig, HierarchyCatalog},
    layer_scorer::LayerRecord,
    provenance::{Provenance, Stage},
    types::{FactorId, SegmentId, TopicId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactorRecord {
    pub topic_id: TopicId,
    pub factor_id: FactorId,
    pub parent_segment_id: SegmentId,
    pub weight_in_segment: f64,
    pub value: f64,
    pub confidence: f64,
    pub insufficient_data: bool,
    pub input_count: usize,
    pub provenance: Provenance,
    pub computed_at: DateTime<Utc>,
}

/// Aggregate the layers belonging to one factor.
///
/// Zero layers is not an error: the record comes back with
/// `value = 0, confidence = 0, insufficient_data = true`.
pub fn aggregate_factor(
    topic_id: &str,
    segment_id: &str,
    factor: &FactorConfig,
    layers: &[&LayerRecord],
    run_token: Option<&str>,
) -> FactorRecord {
    let inputs: Vec<WeightedInput> = layers
        .iter()
        .map(|l| WeightedInput {
            id: l.layer_id.clone(),
            value: l.score,
            confidence: l.confidence,
            weight: l.weight_in_factor,
        })
        .collect();
    let outcome = weighted_mean(&inputs);
    if outcome.renormalized {
        log::debug!(
            "factor {topic_id}/{}: layer weights renormalised over {} inputs",
            factor.id,
            outcome.input_count
        );
    }

    FactorRecord {
        topic_id: topic_id.to_string(),
        factor_id: factor.id.clone(),
        parent_segment_id: segment_id.to_string(),
        weight_in_segment: factor.weight,
        value: outcome.value,
        confidence: outcome.confidence,
        insufficient_data: outcome.insufficient_data,
        input_count: outcome.input_count,
        provenance: Provenance::new(Stage::FactorAggregation, "weighted_mean")
            .with_inputs(inputs.iter().map(|i| i.id.clone()))
            .with_run_token(run_token),
        computed_at: Utc::now(),
    }
}

/// Aggregate every catalog factor from the given layer records.
/// Layers are matched to factors by `parent_factor_id`.
pub fn aggregate_factors(
    topic_id: &str,
    hierarchy: &HierarchyCatalog,
    layers: &[LayerRecord],
    run_token: Option<&str>,
) -> Vec<FactorRecord> {
    hierarchy
        .factors()
        .map(|(segment, factor)| {
            let members: Vec<&LayerRecord> = layers
                .iter()
                .filter(|l| l.topic_id == topic_id && l.parent_factor_id == factor.id)
                .collect();
            aggregate_factor(topic_id, &segment.id, factor, &members, run_token)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn layer(id: &str, factor: &str, score: f64, weight: f64) -> LayerRecord {
        LayerRecord::neutral("t1", id, factor, "analyst", weight, Provenance::new(Stage::Bootstrap, "test"))
            .with_assessment(score, 0.9, vec![format!("insight {id}")])
    }

    #[test]
    fn scenario_a_equal_thirds() {
        let factor = FactorConfig {
            id: "F1".into(),
            label: "F1".into(),
            weight: 1.0,
            layers: vec![],
        };
        let w = 1.0 / 3.0;
        let layers = [
            layer("L1", "F1", 0.2, w),
            layer("L2", "F1", 0.8, w),
            layer("L3", "F1", 0.5, w),
        ];
        let refs: Vec<&LayerRecord> = layers.iter().collect();
        let record = aggregate_factor("t1", "S1", &factor, &refs, None);
        assert!((record.value - 0.5).abs() < 1e-12);
        assert!(!record.insufficient_data);
        assert_eq!(record.input_count, 3);
        assert_eq!(record.provenance.stage, Stage::FactorAggregation);
        assert_eq!(record.provenance.inputs, vec!["L1", "L2", "L3"]);
    }

    #[test]
    fn scenario_d_zero_layers() {
        let factor = FactorConfig {
            id: "F9".into(),
            label: "F9".into(),
            weight: 1.0,
            layers: vec![],
        };
        let record = aggregate_factor("t1", "S1", &factor, &[], None);
        assert_eq!(record.value, 0.0);
        assert_eq!(record.confidence, 0.0);
        assert!(record.insufficient_data);
    }

    #[test]
    fn groups_layers_by_parent_factor() {
        let config = EngineConfig::default_test();
        let layers = vec![
            layer("L1", "F1", 0.9, 0.5),
            layer("L2", "F1", 0.7, 0.5),
            layer("L3", "F2", 0.1, 0.5),
        ];
        let factors = aggregate_factors("t1", &config.hierarchy, &layers, Some("run-1"));
        assert_eq!(factors.len(), 7);

        let f1 = factors.iter().find(|f| f.factor_id == "F1").unwrap();
        assert!((f1.value - 0.8).abs() < 1e-12);
        assert_eq!(f1.parent_segment_id, "S1");
        assert_eq!(f1.provenance.run_token.as_deref(), Some("run-1"));

        let f2 = factors.iter().find(|f| f.factor_id == "F2").unwrap();
        assert!((f2.value - 0.1).abs() < 1e-12);

        let f3 = factors.iter().find(|f| f.factor_id == "F3").unwrap();
        assert!(f3.insufficient_data);
    }
}
