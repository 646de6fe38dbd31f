use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Persistence failed after {attempts} attempts: {message}")]
    Persistence { attempts: u32, message: String },

    #[error("Topic '{topic_id}' is locked by another run")]
    TopicBusy { topic_id: String },

    #[error("Pattern '{pattern_id}' not found in catalog")]
    PatternNotFound { pattern_id: String },

    #[error("Illegal pipeline transition: {from} -> {to}")]
    IllegalTransition { from: &'static str, to: &'static str },

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
