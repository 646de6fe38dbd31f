//! Strata analysis engine.
//!
//! Evidence is scored layer by layer through persona prompts, rolled up
//! into factors, segments and one overall score, matched against a
//! catalog of strategic patterns, and the matched patterns' KPI anchors
//! are simulated by Monte Carlo sampling.

pub mod aggregation;
pub mod config;
pub mod content;
pub mod error;
pub mod event;
pub mod factor_aggregator;
pub mod generator;
pub mod layer_scorer;
pub mod monte_carlo;
pub mod orchestrator;
pub mod pattern_matcher;
pub mod persistence;
pub mod provenance;
pub mod rng;
pub mod segment_aggregator;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use orchestrator::{Orchestrator, PipelineOptions, PipelineState, PipelineSummary};
pub use persistence::{ResultStore, TopicResults};
pub use store::AnalysisStore;
