//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::llm::LlmConfig;

/// Default owner role used when none is configured.
pub const DEFAULT_ROLE: &str = "Professional Email Assistant";

/// Memory knobs for the profile store.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum retained messages per correspondent (oldest evicted first).
    pub max_history: usize,
    /// How many recent messages go into generated context. Callers keep this
    /// at or below `max_history`; a larger window only renders what is retained.
    pub context_window: usize,
    /// Stored excerpt cap, in characters.
    pub max_excerpt_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_history: 10,
            context_window: 3,
            max_excerpt_chars: 2000,
        }
    }
}

/// Wire format requested from the LLM extraction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractionFormat {
    /// One `key: value` line per fact.
    #[default]
    KeyValue,
    /// A single JSON object.
    Json,
}

impl FromStr for ExtractionFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lines" | "key-value" | "kv" => Ok(Self::KeyValue),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidValue {
                key: "MAIL_ASSIST_EXTRACTION_FORMAT".to_string(),
                message: format!("unknown format {other:?}, expected \"lines\" or \"json\""),
            }),
        }
    }
}

/// Assistant configuration, assembled from the environment.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Owner mailbox address; falls back to the mail account's from-address
    /// when a mailbox is configured, otherwise empty.
    pub owner_address: Option<String>,
    /// Owner role string rendered into prompts.
    pub owner_role: String,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub extraction: ExtractionFormat,
    /// When set, logs additionally go to a daily-rolling file in this directory.
    pub log_dir: Option<PathBuf>,
}

impl AssistantConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let memory = MemoryConfig {
            max_history: env_parse("MAIL_ASSIST_MAX_HISTORY", 10)?,
            context_window: env_parse("MAIL_ASSIST_CONTEXT_WINDOW", 3)?,
            max_excerpt_chars: env_parse("MAIL_ASSIST_MAX_EXCERPT_CHARS", 2000)?,
        };

        let extraction = match std::env::var("MAIL_ASSIST_EXTRACTION_FORMAT") {
            Ok(raw) => raw.parse()?,
            Err(_) => ExtractionFormat::default(),
        };

        Ok(Self {
            owner_address: std::env::var("MAIL_ASSIST_OWNER_ADDRESS").ok(),
            owner_role: std::env::var("MAIL_ASSIST_OWNER_ROLE")
                .unwrap_or_else(|_| DEFAULT_ROLE.to_string()),
            llm: LlmConfig::from_env()?,
            memory,
            extraction,
            log_dir: std::env::var("MAIL_ASSIST_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

/// Reads an env var and parses it, falling back to `default` when unset.
/// A present-but-unparseable value is a configuration error, not a silent default.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        Err(_) => Ok(default),
    }
}
