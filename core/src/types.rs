//! Shared primitive types used across the entire engine.

/// A topic: the unit of analysis owning one layer/factor/segment hierarchy.
pub type TopicId = String;

/// Stable catalog identifiers.
pub type LayerId = String;
pub type FactorId = String;
pub type SegmentId = String;
pub type PatternId = String;
pub type KpiId = String;

/// Identifies one pipeline run. Holds the per-topic lock while the run is live.
pub type RunToken = String;

/// Metric id of the topic-level overall score in the pattern metric namespace.
pub const OVERALL_METRIC: &str = "overall";

/// Clamp a score into [0, 1]. NaN maps to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
