//! LLM integration for mail-assist.
//!
//! One backend: any OpenAI-compatible chat-completions endpoint, reached
//! directly over HTTP. The `TextGenerator` trait is the seam the pipeline and
//! tests mock against.

pub mod openai;
pub mod provider;

pub use openai::OpenAiGenerator;
pub use provider::*;

use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigError, LlmError};

/// Default model when `MAIL_ASSIST_MODEL` is unset.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default API base when `MAIL_ASSIST_API_BASE` is unset.
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Default per-request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Configuration for creating a text generator.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Request timeout; a timed-out call surfaces as a request failure.
    pub timeout: Duration,
}

impl LlmConfig {
    /// Loads from the environment. `OPENAI_API_KEY` is required; everything
    /// else has defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;

        let timeout_secs = std::env::var("MAIL_ASSIST_LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            api_base: std::env::var("MAIL_ASSIST_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            api_key: secrecy::SecretString::from(api_key),
            model: std::env::var("MAIL_ASSIST_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Create a text generator from configuration.
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn TextGenerator>, LlmError> {
    let generator = OpenAiGenerator::new(config)?;
    tracing::info!("Using OpenAI-compatible endpoint (model: {})", config.model);
    Ok(Arc::new(generator))
}
