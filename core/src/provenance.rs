//! Provenance tags for derived values.
//!
//! RULE: Every derived record is constructed with a Provenance.
//! Record constructors take it as a required argument, so a value
//! without a traceable origin cannot be built.

use crate::types::RunToken;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Bootstrap,
    LayerScoring,
    FactorAggregation,
    SegmentAggregation,
    OverallAggregation,
    PatternMatching,
    MonteCarlo,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::LayerScoring => "layer_scoring",
            Self::FactorAggregation => "factor_aggregation",
            Self::SegmentAggregation => "segment_aggregation",
            Self::OverallAggregation => "overall_aggregation",
            Self::PatternMatching => "pattern_matching",
            Self::MonteCarlo => "monte_carlo",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub stage: Stage,
    /// What produced the value: a prompt template slug, a pattern id,
    /// a distribution family.
    pub source: String,
    /// Upstream record ids the value was computed from.
    pub inputs: Vec<String>,
    pub run_token: Option<RunToken>,
}

impl Provenance {
    pub fn new(stage: Stage, source: impl Into<String>) -> Self {
        Self {
            stage,
            source: source.into(),
            inputs: Vec::new(),
            run_token: None,
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_run_token(mut self, run_token: Option<&str>) -> Self {
        self.run_token = run_token.map(str::to_string);
        self
    }
}
