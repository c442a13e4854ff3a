//! Fact extraction from inbound mail.
//!
//! An ordered strategy chain: LLM extraction first, the deterministic pattern
//! fallback second. A strategy error falls through to the next strategy; an
//! empty result is a success but the next strategy is still consulted. The
//! chain fails only when every strategy errored.

pub mod llm;
pub mod patterns;

pub use llm::LlmExtraction;
pub use patterns::PatternExtraction;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::ExtractionFormat;
use crate::llm::TextGenerator;
use crate::memory::RawFacts;

/// A failed extraction attempt.
#[derive(Debug, thiserror::Error)]
#[error("{strategy} extraction failed: {reason}")]
pub struct StrategyError {
    pub strategy: &'static str,
    pub reason: String,
}

/// One way of pulling facts out of a message body.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extracts facts from a message body. An empty map is a valid outcome.
    async fn extract(&self, message: &str) -> Result<RawFacts, StrategyError>;
}

/// Ordered extraction chain over interchangeable strategies.
pub struct FactExtractor {
    strategies: Vec<Arc<dyn ExtractionStrategy>>,
}

impl FactExtractor {
    pub fn new(strategies: Vec<Arc<dyn ExtractionStrategy>>) -> Self {
        Self { strategies }
    }

    /// The standard chain: LLM extraction backed by the pattern fallback.
    pub fn standard(llm: Arc<dyn TextGenerator>, format: ExtractionFormat) -> Self {
        Self::new(vec![
            Arc::new(LlmExtraction::new(llm, format)),
            Arc::new(PatternExtraction),
        ])
    }

    /// Runs the chain. The first strategy producing a non-empty map wins.
    pub async fn extract(&self, message: &str) -> Result<RawFacts, StrategyError> {
        let mut last_error: Option<StrategyError> = None;
        let mut any_succeeded = false;

        for (index, strategy) in self.strategies.iter().enumerate() {
            match strategy.extract(message).await {
                Ok(facts) if !facts.is_empty() => {
                    if index > 0 {
                        warn!(
                            strategy = strategy.name(),
                            "Extraction degraded, fallback strategy supplied facts"
                        );
                    }
                    debug!(strategy = strategy.name(), count = facts.len(), "Extraction succeeded");
                    return Ok(facts);
                }
                Ok(_) => {
                    debug!(strategy = strategy.name(), "Extraction found no facts");
                    any_succeeded = true;
                }
                Err(e) => {
                    warn!(strategy = strategy.name(), error = %e, "Extraction strategy failed");
                    last_error = Some(e);
                }
            }
        }

        if any_succeeded {
            return Ok(RawFacts::new());
        }
        Err(last_error.unwrap_or_else(|| StrategyError {
            strategy: "none",
            reason: "no extraction strategies configured".to_string(),
        }))
    }
}
