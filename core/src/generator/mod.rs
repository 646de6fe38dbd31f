//! Text-generation capability consumed by the layer scorer.
//!
//! The generator is a black box: callers must tolerate empty, truncated
//! and non-conforming output. Availability is checked once, when the
//! orchestrator is built.

pub mod http;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

pub use http::HttpTextGenerator;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("text generator unavailable")]
    Unavailable,

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Checked once at startup. An unavailable generator means every
    /// layer degrades without a call being attempted.
    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &str;
}

/// Stand-in used when no generator is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableGenerator;

#[async_trait]
impl TextGenerator for UnavailableGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable)
    }

    fn is_available(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

type Responder = dyn Fn(&str) -> Result<String, GenerationError> + Send + Sync;

/// Deterministic generator driven by a closure over the prompt.
/// Used by tests and offline runs.
pub struct ScriptedGenerator {
    responder: Box<Responder>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, GenerationError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answers with the same text.
    pub fn constant(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(text.clone()))
    }

    /// Always fails with a provider error.
    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(move |_| Err(GenerationError::Provider(message.clone())))
    }

    /// Sleep before answering; used to exercise call timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(prompt)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
