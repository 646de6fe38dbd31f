//! Property checks for aggregation, matching and sampling.

use proptest::prelude::*;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use strata_core::{
    aggregation::{weighted_mean, WeightedInput},
    config::{EngineConfig, PatternConfig, TriggerCondition},
    monte_carlo::{draw_samples, summarize, DistributionFamily, OutcomeDistribution},
    pattern_matcher::{Comparator, MetricSnapshot, PatternMatcher},
};

const METRICS: [&str; 4] = ["F1", "F2", "S1", "S2"];
const COMPARATORS: [Comparator; 5] = [
    Comparator::Gt,
    Comparator::Ge,
    Comparator::Lt,
    Comparator::Le,
    Comparator::Eq,
];

/// Quarter steps, so metric values often sit exactly on a threshold.
fn on_grid() -> impl Strategy<Value = f64> {
    (0u8..=4).prop_map(|k| f64::from(k) / 4.0)
}

/// Move a threshold so its condition becomes harder to satisfy.
/// An equality threshold moves away from the current metric value.
fn tightened(condition: &TriggerCondition, actual: f64, delta: f64) -> f64 {
    match condition.comparator {
        Comparator::Gt | Comparator::Ge => condition.threshold + delta,
        Comparator::Lt | Comparator::Le => condition.threshold - delta,
        Comparator::Eq if actual > condition.threshold => condition.threshold - delta,
        Comparator::Eq => condition.threshold + delta,
    }
}

fn pattern_with(conditions: Vec<TriggerCondition>) -> PatternConfig {
    let mut pattern = EngineConfig::default_test().patterns[0].clone();
    pattern.trigger_conditions = conditions;
    pattern
}

fn inputs(pairs: &[(f64, f64)]) -> Vec<WeightedInput> {
    pairs
        .iter()
        .enumerate()
        .map(|(i, &(value, weight))| WeightedInput {
            id: format!("x{i}"),
            value,
            confidence: value,
            weight,
        })
        .collect()
}

proptest! {
    #[test]
    fn weighted_mean_stays_within_input_range(
        pairs in prop::collection::vec((0.0f64..=1.0, 0.01f64..10.0), 1..12)
    ) {
        let out = weighted_mean(&inputs(&pairs));
        let lo = pairs.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
        let hi = pairs.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
        prop_assert!(out.value >= lo - 1e-12 && out.value <= hi + 1e-12);
        prop_assert!(!out.insufficient_data);
    }

    #[test]
    fn scaling_all_weights_changes_nothing(
        pairs in prop::collection::vec((0.0f64..=1.0, 0.01f64..10.0), 1..12),
        k in 0.01f64..100.0,
    ) {
        let scaled: Vec<(f64, f64)> = pairs.iter().map(|&(v, w)| (v, w * k)).collect();
        let a = weighted_mean(&inputs(&pairs));
        let b = weighted_mean(&inputs(&scaled));
        prop_assert!((a.value - b.value).abs() < 1e-9);
        prop_assert!((a.confidence - b.confidence).abs() < 1e-9);
    }

    #[test]
    fn raising_a_gt_metric_never_lowers_the_match(
        f1 in 0.0f64..=1.0,
        bump in 0.0f64..=1.0,
        s2 in 0.0f64..=1.0,
    ) {
        let config = EngineConfig::default_test();
        let pattern: &PatternConfig = &config.patterns[0];
        let matcher = PatternMatcher::new(&config.matching);

        let raised = (f1 + bump).min(1.0);
        let before = matcher.evaluate("t", pattern, &MetricSnapshot::new().with("F1", f1).with("S2", s2), None);
        let after = matcher.evaluate("t", pattern, &MetricSnapshot::new().with("F1", raised).with("S2", s2), None);
        prop_assert!(after.match_score >= before.match_score);
        prop_assert!(after.confidence >= before.confidence);
    }

    #[test]
    fn tightening_one_threshold_never_raises_the_match(
        raw in prop::collection::vec((0..METRICS.len(), 0..COMPARATORS.len(), on_grid()), 1..6),
        values in prop::array::uniform4(on_grid()),
        pick in any::<prop::sample::Index>(),
        delta in 0.0f64..=0.5,
    ) {
        let config = EngineConfig::default_test();
        let matcher = PatternMatcher::new(&config.matching);
        let snapshot = METRICS
            .iter()
            .zip(values)
            .fold(MetricSnapshot::new(), |s, (id, v)| s.with(id, v));

        let conditions: Vec<TriggerCondition> = raw
            .iter()
            .map(|&(m, c, threshold)| TriggerCondition {
                metric_id: METRICS[m].to_string(),
                comparator: COMPARATORS[c],
                threshold,
            })
            .collect();
        let i = pick.index(conditions.len());
        let mut stricter = conditions.clone();
        stricter[i].threshold = tightened(&conditions[i], values[raw[i].0], delta);

        let before = matcher.evaluate("t", &pattern_with(conditions), &snapshot, None);
        let after = matcher.evaluate("t", &pattern_with(stricter), &snapshot, None);
        prop_assert!(
            after.match_score <= before.match_score,
            "{} -> {}", before.match_score, after.match_score
        );
        prop_assert!(after.confidence <= before.confidence);
        prop_assert!(after.matched <= before.matched);
    }

    #[test]
    fn same_seed_same_samples(seed in any::<u64>()) {
        let dist = OutcomeDistribution::Normal { mean: 2.0, std_dev: 1.5 };
        let a = draw_samples(&dist, 200, &mut Pcg64::seed_from_u64(seed)).unwrap();
        let b = draw_samples(&dist, 200, &mut Pcg64::seed_from_u64(seed)).unwrap();
        prop_assert_eq!(
            a.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
        );
    }
}

#[test]
fn tightening_a_tied_threshold_unsatisfies_it() {
    let config = EngineConfig::default_test();
    let matcher = PatternMatcher::new(&config.matching);
    let snapshot = MetricSnapshot::new().with("F1", 0.5);

    for comparator in [Comparator::Ge, Comparator::Le, Comparator::Eq] {
        let condition = TriggerCondition {
            metric_id: "F1".into(),
            comparator,
            threshold: 0.5,
        };
        let mut stricter = condition.clone();
        stricter.threshold = tightened(&condition, 0.5, 0.1);

        let before = matcher.evaluate("t", &pattern_with(vec![condition]), &snapshot, None);
        let after = matcher.evaluate("t", &pattern_with(vec![stricter]), &snapshot, None);
        assert_eq!(before.match_score, 1.0, "{}", comparator.symbol());
        assert_eq!(after.match_score, 0.0, "{}", comparator.symbol());
    }

    let lt = TriggerCondition {
        metric_id: "F1".into(),
        comparator: Comparator::Lt,
        threshold: 0.55,
    };
    let mut stricter = lt.clone();
    stricter.threshold = tightened(&lt, 0.5, 0.1);
    assert_eq!(matcher.evaluate("t", &pattern_with(vec![lt]), &snapshot, None).match_score, 1.0);
    assert_eq!(
        matcher.evaluate("t", &pattern_with(vec![stricter]), &snapshot, None).match_score,
        0.0
    );
}

#[test]
fn p5_to_p95_band_covers_ninety_percent_of_samples() {
    let dists = [
        OutcomeDistribution::Normal { mean: 0.0, std_dev: 1.0 },
        OutcomeDistribution::Triangular { low: 6.0, mode: 9.0, high: 12.0 },
        OutcomeDistribution::Beta { alpha: 8.0, beta: 2.0, low: 0.0, high: 1.0 },
        OutcomeDistribution::LogNormal { mu: 0.0, sigma: 0.5 },
    ];
    for (i, dist) in dists.iter().enumerate() {
        let samples = draw_samples(dist, 1000, &mut Pcg64::seed_from_u64(i as u64)).unwrap();
        let summary = summarize(&samples, 0.0);
        let inside = samples
            .iter()
            .filter(|&&x| x >= summary.p5 && x <= summary.p95)
            .count();
        assert!(inside >= 850, "{:?}: only {inside}/1000 inside band", dist.family());
        assert!(summary.p5 <= summary.median && summary.median <= summary.p95);
    }
}

#[test]
fn probability_positive_counts_strictly_above_reference() {
    let summary = summarize(&[-1.0, 0.0, 0.0, 1.0, 2.0], 0.0);
    assert!((summary.probability_positive - 0.4).abs() < 1e-12);
    assert_eq!(summary.sample_count, 5);
}

#[test]
fn zero_samples_is_rejected() {
    let dist = OutcomeDistribution::Normal { mean: 0.0, std_dev: 1.0 };
    let err = draw_samples(&dist, 0, &mut Pcg64::seed_from_u64(1)).unwrap_err();
    assert!(err.is_validation());
    assert_eq!(dist.family(), DistributionFamily::Normal);
}
