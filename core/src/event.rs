//! Pipeline events: the per-topic audit trail.
//!
//! RULE: Every state transition and every notable outcome is recorded.
//! The orchestrator emits events; the store appends them to `pipeline_event`.

use crate::types::{LayerId, PatternId, RunToken, TopicId};
use serde::{Deserialize, Serialize};

/// Every event emitted during a pipeline run.
/// Variants may be added, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    // ── Lifecycle ──────────────────────────────────
    RunStarted {
        run_token: RunToken,
        resume_from: Option<String>,
    },
    StateEntered {
        state: String,
    },
    RunCompleted {
        layers_scored: usize,
        layers_degraded: usize,
        patterns_matched: usize,
        simulations: usize,
    },
    RunFailed {
        state: String,
        message: String,
    },
    RunCancelled {
        state: String,
    },

    // ── Stage outcomes ─────────────────────────────
    EvidenceUnavailable {
        message: String,
    },
    LayerBatchCompleted {
        batch_index: usize,
        layers: usize,
        degraded: usize,
    },
    LayerDegraded {
        layer_id: LayerId,
        reason: String,
    },
    CheckpointFailed {
        batch_index: usize,
        message: String,
    },
    PatternMatched {
        pattern_id: PatternId,
        match_score: f64,
        confidence: f64,
    },
    SimulationSkipped {
        pattern_id: PatternId,
        kpi_id: String,
        reason: String,
    },
    PersistRetried {
        attempt: u32,
        message: String,
    },
}

impl PipelineEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::StateEntered { .. } => "state_entered",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
            Self::EvidenceUnavailable { .. } => "evidence_unavailable",
            Self::LayerBatchCompleted { .. } => "layer_batch_completed",
            Self::LayerDegraded { .. } => "layer_degraded",
            Self::CheckpointFailed { .. } => "checkpoint_failed",
            Self::PatternMatched { .. } => "pattern_matched",
            Self::SimulationSkipped { .. } => "simulation_skipped",
            Self::PersistRetried { .. } => "persist_retried",
        }
    }
}

/// A row of the `pipeline_event` table.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub topic_id: TopicId,
    pub run_token: RunToken,
    pub event_type: String,
    pub payload: String, // JSON-serialised PipelineEvent
    pub created_at: String,
}

impl EventLogEntry {
    pub fn new(topic_id: &str, run_token: &str, event: &PipelineEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: None,
            topic_id: topic_id.to_string(),
            run_token: run_token.to_string(),
            event_type: event.type_name().to_string(),
            payload: serde_json::to_string(event)?,
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    pub fn event(&self) -> Result<PipelineEvent, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_payload_round_trips() {
        let event = PipelineEvent::LayerDegraded {
            layer_id: "L3".into(),
            reason: "timeout".into(),
        };
        let entry = EventLogEntry::new("t1", "run-1", &event).unwrap();
        assert_eq!(entry.event_type, "layer_degraded");
        assert!(entry.payload.contains("\"type\":\"layer_degraded\""));
        assert_eq!(entry.event().unwrap(), event);
    }
}
