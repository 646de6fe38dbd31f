//! Weighted aggregation shared by the factor and segment aggregators.
//!
//! RULE: Weights are renormalised here, at aggregation time.
//! Catalog weights are not required to sum to 1; the result is always
//! a convex combination of the inputs.

use crate::types::clamp_unit;

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedInput {
    pub id: String,
    pub value: f64,
    pub confidence: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedOutcome {
    pub value: f64,
    pub confidence: f64,
    pub insufficient_data: bool,
    pub input_count: usize,
    /// True when the raw weights did not already sum to 1.
    pub renormalized: bool,
}

impl WeightedOutcome {
    pub fn insufficient() -> Self {
        Self {
            value: 0.0,
            confidence: 0.0,
            insufficient_data: true,
            input_count: 0,
            renormalized: false,
        }
    }
}

/// `Σ(v·w) / Σw` over values and confidences alike.
///
/// Zero inputs yield the insufficient-data outcome. Non-finite or negative
/// weights count as zero; if every weight is zero the inputs are weighted
/// equally.
pub fn weighted_mean(inputs: &[WeightedInput]) -> WeightedOutcome {
    if inputs.is_empty() {
        return WeightedOutcome::insufficient();
    }

    let weights: Vec<f64> = inputs
        .iter()
        .map(|i| if i.weight.is_finite() && i.weight > 0.0 { i.weight } else { 0.0 })
        .collect();
    let mut total: f64 = weights.iter().sum();
    let weights = if total > 0.0 {
        weights
    } else {
        total = inputs.len() as f64;
        vec![1.0; inputs.len()]
    };
    let renormalized = (total - 1.0).abs() > 1e-9;

    let value: f64 = inputs
        .iter()
        .zip(&weights)
        .map(|(i, w)| clamp_unit(i.value) * w)
        .sum::<f64>()
        / total;
    let confidence: f64 = inputs
        .iter()
        .zip(&weights)
        .map(|(i, w)| clamp_unit(i.confidence) * w)
        .sum::<f64>()
        / total;

    WeightedOutcome {
        value: clamp_unit(value),
        confidence: clamp_unit(confidence),
        insufficient_data: false,
        input_count: inputs.len(),
        renormalized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(value: f64, weight: f64) -> WeightedInput {
        WeightedInput {
            id: format!("x{value}"),
            value,
            confidence: value,
            weight,
        }
    }

    #[test]
    fn empty_is_insufficient() {
        let out = weighted_mean(&[]);
        assert!(out.insufficient_data);
        assert_eq!(out.value, 0.0);
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn weights_not_summing_to_one_are_renormalised() {
        let out = weighted_mean(&[input(0.2, 2.0), input(0.8, 2.0)]);
        assert!((out.value - 0.5).abs() < 1e-12);
        assert!(out.renormalized);
    }

    #[test]
    fn all_zero_weights_fall_back_to_equal() {
        let out = weighted_mean(&[input(0.1, 0.0), input(0.3, 0.0)]);
        assert!((out.value - 0.2).abs() < 1e-12);
        assert!(!out.insufficient_data);
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        let out = weighted_mean(&[input(1.4, 1.0)]);
        assert_eq!(out.value, 1.0);
    }
}
