//! Content store capability: read-only evidence for a topic.

use crate::{error::EngineResult, types::TopicId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceItem {
    pub title: String,
    pub url: String,
    pub text: String,
    #[serde(default)]
    pub quality_score: f64,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Evidence items for a topic, in the store's order.
    async fn evidence(&self, topic_id: &str) -> EngineResult<Vec<EvidenceItem>>;
}

#[derive(Debug, Clone, Deserialize)]
struct EvidenceFile {
    topics: HashMap<TopicId, Vec<EvidenceItem>>,
}

/// In-memory content store, optionally seeded from a JSON file of the form
/// `{"topics": {"<topic_id>": [{title, url, text, quality_score}, ...]}}`.
#[derive(Debug, Clone, Default)]
pub struct StaticContentStore {
    topics: HashMap<TopicId, Vec<EvidenceItem>>,
}

impl StaticContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let file: EvidenceFile = serde_json::from_str(&content)?;
        Ok(Self { topics: file.topics })
    }

    pub fn with_topic(mut self, topic_id: &str, items: Vec<EvidenceItem>) -> Self {
        self.insert(topic_id, items);
        self
    }

    pub fn insert(&mut self, topic_id: &str, items: Vec<EvidenceItem>) {
        self.topics.insert(topic_id.to_string(), items);
    }

    pub fn topic_ids(&self) -> Vec<TopicId> {
        let mut ids: Vec<TopicId> = self.topics.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ContentStore for StaticContentStore {
    async fn evidence(&self, topic_id: &str) -> EngineResult<Vec<EvidenceItem>> {
        Ok(self.topics.get(topic_id).cloned().unwrap_or_default())
    }
}
