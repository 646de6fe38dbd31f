//! Monte Carlo simulator: KPI outcome distributions for matched patterns.
//!
//! This module:
//!   1. Validates a KPI anchor's distribution family and parameters
//!   2. Draws `sample_count` samples from a seeded per-KPI stream
//!   3. Summarises mean, median, std dev, p5/p95 and P(sample > reference)
//!
//! Invalid parameters are rejected before any sampling happens.
//! KPIs of one pattern are sampled in parallel; a failing KPI never
//! aborts its siblings.

use crate::{
    config::{PatternConfig, SimulationConfig},
    error::{EngineError, EngineResult},
    provenance::{Provenance, Stage},
    rng::{fresh_seed, KpiRng},
    types::{KpiId, PatternId, TopicId},
};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand_distr::{Beta, Distribution, LogNormal, Normal, Triangular};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DistributionFamily {
    Normal,
    Triangular,
    Beta,
    LogNormal,
}

impl DistributionFamily {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Triangular => "triangular",
            Self::Beta => "beta",
            Self::LogNormal => "lognormal",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "normal" => Some(Self::Normal),
            "triangular" => Some(Self::Triangular),
            "beta" => Some(Self::Beta),
            "lognormal" => Some(Self::LogNormal),
            _ => None,
        }
    }

    fn required(&self) -> &'static [&'static str] {
        match self {
            Self::Normal => &["mean", "std_dev"],
            Self::Triangular => &["low", "mode", "high"],
            Self::Beta => &["alpha", "beta"],
            Self::LogNormal => &["mu", "sigma"],
        }
    }

    fn optional(&self) -> &'static [&'static str] {
        match self {
            Self::Beta => &["low", "high"],
            _ => &[],
        }
    }
}

/// A declared outcome distribution attached to a pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiAnchor {
    pub kpi_id: KpiId,
    pub distribution_family: DistributionFamily,
    pub parameters: BTreeMap<String, f64>,
    /// Overrides `SimulationConfig::sample_count`.
    #[serde(default)]
    pub sample_count: Option<usize>,
    /// Overrides `SimulationConfig::success_reference`.
    #[serde(default)]
    pub success_reference: Option<f64>,
}

/// Validated distribution parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutcomeDistribution {
    Normal { mean: f64, std_dev: f64 },
    Triangular { low: f64, mode: f64, high: f64 },
    /// Beta(alpha, beta) rescaled onto [low, high].
    Beta { alpha: f64, beta: f64, low: f64, high: f64 },
    LogNormal { mu: f64, sigma: f64 },
}

impl OutcomeDistribution {
    /// Validate a family + parameter map. Unknown, missing and
    /// non-finite parameters are all rejected.
    pub fn from_parameters(
        family: DistributionFamily,
        parameters: &BTreeMap<String, f64>,
    ) -> EngineResult<Self> {
        for key in parameters.keys() {
            if !family.required().contains(&key.as_str())
                && !family.optional().contains(&key.as_str())
            {
                return Err(EngineError::validation(format!(
                    "{} distribution does not take parameter '{key}'",
                    family.name()
                )));
            }
        }
        let get = |key: &str| -> EngineResult<f64> {
            let value = parameters.get(key).copied().ok_or_else(|| {
                EngineError::validation(format!(
                    "{} distribution requires parameter '{key}'",
                    family.name()
                ))
            })?;
            if !value.is_finite() {
                return Err(EngineError::validation(format!(
                    "parameter '{key}' must be finite, got {value}"
                )));
            }
            Ok(value)
        };
        let get_or = |key: &str, default: f64| -> EngineResult<f64> {
            if parameters.contains_key(key) {
                get(key)
            } else {
                Ok(default)
            }
        };

        let dist = match family {
            DistributionFamily::Normal => Self::Normal {
                mean: get("mean")?,
                std_dev: get("std_dev")?,
            },
            DistributionFamily::Triangular => Self::Triangular {
                low: get("low")?,
                mode: get("mode")?,
                high: get("high")?,
            },
            DistributionFamily::Beta => Self::Beta {
                alpha: get("alpha")?,
                beta: get("beta")?,
                low: get_or("low", 0.0)?,
                high: get_or("high", 1.0)?,
            },
            DistributionFamily::LogNormal => Self::LogNormal {
                mu: get("mu")?,
                sigma: get("sigma")?,
            },
        };
        dist.validate()?;
        Ok(dist)
    }

    pub fn family(&self) -> DistributionFamily {
        match self {
            Self::Normal { .. } => DistributionFamily::Normal,
            Self::Triangular { .. } => DistributionFamily::Triangular,
            Self::Beta { .. } => DistributionFamily::Beta,
            Self::LogNormal { .. } => DistributionFamily::LogNormal,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        match *self {
            Self::Normal { std_dev, .. } if std_dev < 0.0 => Err(EngineError::validation(
                format!("normal std_dev must be >= 0, got {std_dev}"),
            )),
            Self::Triangular { low, mode, high } if !(low <= mode && mode <= high) => {
                Err(EngineError::validation(format!(
                    "triangular requires low <= mode <= high, got low={low} mode={mode} high={high}"
                )))
            }
            Self::Triangular { low, high, .. } if low >= high => Err(EngineError::validation(
                format!("triangular requires low < high, got low={low} high={high}"),
            )),
            Self::Beta { alpha, beta, .. } if alpha <= 0.0 || beta <= 0.0 => {
                Err(EngineError::validation(format!(
                    "beta requires alpha > 0 and beta > 0, got alpha={alpha} beta={beta}"
                )))
            }
            Self::Beta { low, high, .. } if low >= high => Err(EngineError::validation(
                format!("beta range requires low < high, got low={low} high={high}"),
            )),
            Self::LogNormal { sigma, .. } if sigma < 0.0 => Err(EngineError::validation(
                format!("lognormal sigma must be >= 0, got {sigma}"),
            )),
            _ => Ok(()),
        }
    }

    fn sampler(&self) -> EngineResult<Sampler> {
        self.validate()?;
        let invalid = |e: &dyn std::fmt::Display| {
            EngineError::validation(format!("{} parameters rejected: {e}", self.family().name()))
        };
        Ok(match *self {
            Self::Normal { mean, std_dev } => {
                Sampler::Normal(Normal::new(mean, std_dev).map_err(|e| invalid(&e))?)
            }
            Self::Triangular { low, mode, high } => {
                Sampler::Triangular(Triangular::new(low, high, mode).map_err(|e| invalid(&e))?)
            }
            Self::Beta { alpha, beta, low, high } => Sampler::Beta {
                inner: Beta::new(alpha, beta).map_err(|e| invalid(&e))?,
                low,
                span: high - low,
            },
            Self::LogNormal { mu, sigma } => {
                Sampler::LogNormal(LogNormal::new(mu, sigma).map_err(|e| invalid(&e))?)
            }
        })
    }
}

enum Sampler {
    Normal(Normal<f64>),
    Triangular(Triangular<f64>),
    Beta { inner: Beta<f64>, low: f64, span: f64 },
    LogNormal(LogNormal<f64>),
}

impl Sampler {
    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            Self::Normal(d) => d.sample(rng),
            Self::Triangular(d) => d.sample(rng),
            Self::Beta { inner, low, span } => low + span * inner.sample(rng),
            Self::LogNormal(d) => d.sample(rng),
        }
    }
}

/// Summary statistics of one sample set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SampleSummary {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub p5: f64,
    pub p95: f64,
    pub ci90_low: f64,
    pub ci90_high: f64,
    /// Fraction of samples strictly above the success reference.
    pub probability_positive: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationResult {
    pub topic_id: TopicId,
    pub pattern_id: PatternId,
    pub kpi_id: KpiId,
    pub distribution_family: DistributionFamily,
    pub sample_count: usize,
    /// The seed the caller pinned, if any.
    pub seed: Option<u64>,
    pub success_reference: f64,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub p5: f64,
    pub p95: f64,
    pub ci90_low: f64,
    pub ci90_high: f64,
    pub probability_positive: f64,
    pub provenance: Provenance,
    pub computed_at: DateTime<Utc>,
}

// ── Sampling ─────────────────────────────────────────────────────────────────

/// Draw `sample_count` samples and summarise them.
///
/// Returns the raw samples alongside the summary so callers (and tests)
/// can check coverage of the reported bands.
pub fn draw_samples<R: Rng + ?Sized>(
    distribution: &OutcomeDistribution,
    sample_count: usize,
    rng: &mut R,
) -> EngineResult<Vec<f64>> {
    if sample_count == 0 {
        return Err(EngineError::validation("sample_count must be >= 1"));
    }
    let sampler = distribution.sampler()?;
    Ok((0..sample_count).map(|_| sampler.draw(rng)).collect())
}

pub fn summarize(samples: &[f64], success_reference: f64) -> SampleSummary {
    let n = samples.len();
    if n == 0 {
        return SampleSummary {
            mean: 0.0,
            median: 0.0,
            std_dev: 0.0,
            p5: 0.0,
            p95: 0.0,
            ci90_low: 0.0,
            ci90_high: 0.0,
            probability_positive: 0.0,
            sample_count: 0,
        };
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mean = sorted.iter().sum::<f64>() / n as f64;
    let std_dev = if n > 1 {
        let ss: f64 = sorted.iter().map(|x| (x - mean).powi(2)).sum();
        (ss / (n - 1) as f64).sqrt()
    } else {
        0.0
    };
    let p5 = percentile(&sorted, 0.05);
    let p95 = percentile(&sorted, 0.95);
    let above = sorted.iter().filter(|&&x| x > success_reference).count();

    SampleSummary {
        mean,
        median: percentile(&sorted, 0.5),
        std_dev,
        p5,
        p95,
        ci90_low: p5,
        ci90_high: p95,
        probability_positive: above as f64 / n as f64,
        sample_count: n,
    }
}

/// Linear interpolation between closest ranks. `sorted` must be ascending
/// and non-empty.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

// ── Simulator ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MonteCarloSimulator {
    sample_count: usize,
    success_reference: f64,
    seed: Option<u64>,
}

impl MonteCarloSimulator {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            sample_count: config.sample_count,
            success_reference: config.success_reference,
            seed: config.seed,
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Validate an anchor without sampling. Used at catalog load.
    pub fn validate_anchor(&self, anchor: &KpiAnchor) -> EngineResult<OutcomeDistribution> {
        if anchor.sample_count == Some(0) {
            return Err(EngineError::validation(format!(
                "KPI '{}': sample_count must be >= 1",
                anchor.kpi_id
            )));
        }
        if let Some(reference) = anchor.success_reference {
            if !reference.is_finite() {
                return Err(EngineError::validation(format!(
                    "KPI '{}': success_reference must be finite",
                    anchor.kpi_id
                )));
            }
        }
        OutcomeDistribution::from_parameters(anchor.distribution_family, &anchor.parameters)
            .map_err(|e| EngineError::validation(format!("KPI '{}': {e}", anchor.kpi_id)))
    }

    pub fn simulate_anchor(
        &self,
        topic_id: &str,
        pattern_id: &str,
        anchor: &KpiAnchor,
        run_token: Option<&str>,
    ) -> EngineResult<SimulationResult> {
        let distribution = self.validate_anchor(anchor)?;
        let sample_count = anchor.sample_count.unwrap_or(self.sample_count);
        let success_reference = anchor.success_reference.unwrap_or(self.success_reference);
        let master_seed = self.seed.unwrap_or_else(fresh_seed);

        let mut rng = KpiRng::for_kpi(master_seed, pattern_id, &anchor.kpi_id);
        let samples = draw_samples(&distribution, sample_count, &mut rng)?;
        let summary = summarize(&samples, success_reference);

        log::debug!(
            "simulate {topic_id}/{pattern_id}/{}: {} n={} mean={:.4} p5={:.4} p95={:.4}",
            anchor.kpi_id,
            distribution.family().name(),
            sample_count,
            summary.mean,
            summary.p5,
            summary.p95,
        );

        let source = match self.seed {
            Some(seed) => format!("{}:seed={seed}", distribution.family().name()),
            None => distribution.family().name().to_string(),
        };
        Ok(SimulationResult {
            topic_id: topic_id.to_string(),
            pattern_id: pattern_id.to_string(),
            kpi_id: anchor.kpi_id.clone(),
            distribution_family: distribution.family(),
            sample_count,
            seed: self.seed,
            success_reference,
            mean: summary.mean,
            median: summary.median,
            std_dev: summary.std_dev,
            p5: summary.p5,
            p95: summary.p95,
            ci90_low: summary.ci90_low,
            ci90_high: summary.ci90_high,
            probability_positive: summary.probability_positive,
            provenance: Provenance::new(Stage::MonteCarlo, source)
                .with_inputs([format!("{pattern_id}/{}", anchor.kpi_id)])
                .with_run_token(run_token),
            computed_at: Utc::now(),
        })
    }

    /// Simulate every KPI anchor of a pattern in parallel.
    /// Each KPI's outcome is reported independently.
    pub fn simulate_pattern(
        &self,
        topic_id: &str,
        pattern: &PatternConfig,
        run_token: Option<&str>,
    ) -> BTreeMap<KpiId, EngineResult<SimulationResult>> {
        pattern
            .kpi_anchors
            .par_iter()
            .map(|anchor| {
                let outcome =
                    self.simulate_anchor(topic_id, &pattern.pattern_id, anchor, run_token);
                (anchor.kpi_id.clone(), outcome)
            })
            .collect()
    }
}
