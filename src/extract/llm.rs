//! LLM-backed fact extraction.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ExtractionFormat;
use crate::extract::{ExtractionStrategy, StrategyError};
use crate::llm::{ChatMessage, CompletionRequest, TextGenerator};
use crate::memory::store::is_sentinel;
use crate::memory::RawFacts;

/// Max tokens for the extraction call (runs on every message, kept tight).
const EXTRACTION_MAX_TOKENS: u32 = 500;

/// Temperature for extraction (deterministic-ish).
const EXTRACTION_TEMPERATURE: f32 = 0.1;

/// Message chars interpolated into the prompt.
const EXTRACTION_INPUT_CAP: usize = 2000;

const EXTRACTION_SYSTEM_PROMPT: &str =
    "You extract structured facts about email senders. Follow the requested output format \
     exactly and never invent information the email does not state.";

/// Primary extraction strategy: asks the model for facts in a parseable format.
pub struct LlmExtraction {
    llm: Arc<dyn TextGenerator>,
    format: ExtractionFormat,
}

impl LlmExtraction {
    pub fn new(llm: Arc<dyn TextGenerator>, format: ExtractionFormat) -> Self {
        Self { llm, format }
    }
}

#[async_trait]
impl ExtractionStrategy for LlmExtraction {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn extract(&self, message: &str) -> Result<RawFacts, StrategyError> {
        let prompt = match self.format {
            ExtractionFormat::KeyValue => build_key_value_prompt(message),
            ExtractionFormat::Json => build_json_prompt(message),
        };

        let request = CompletionRequest::new(vec![
            ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ])
        .with_temperature(EXTRACTION_TEMPERATURE)
        .with_max_tokens(EXTRACTION_MAX_TOKENS);

        let response = self.llm.complete(request).await.map_err(|e| StrategyError {
            strategy: "llm",
            reason: format!("LLM call failed: {e}"),
        })?;

        match self.format {
            ExtractionFormat::KeyValue => Ok(parse_key_value_lines(&response.content)),
            ExtractionFormat::Json => {
                parse_json_facts(&response.content).map_err(|reason| StrategyError {
                    strategy: "llm",
                    reason,
                })
            }
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_key_value_prompt(message: &str) -> String {
    let preview: String = message.chars().take(EXTRACTION_INPUT_CAP).collect();
    format!(
        "Extract personal information about the sender from this email.\n\n\
         Respond with one fact per line in the exact format \"key: value\", e.g.:\n\
         name: [if mentioned]\n\
         age: [if mentioned]\n\
         company: [if mentioned]\n\
         location: [if mentioned]\n\
         job_title: [if mentioned]\n\
         interest: [if mentioned]\n\n\
         Only output lines for facts the email actually states. No commentary.\n\n\
         Email:\n{preview}"
    )
}

fn build_json_prompt(message: &str) -> String {
    let preview: String = message.chars().take(EXTRACTION_INPUT_CAP).collect();
    format!(
        "Analyze this email and extract personal information about the sender.\n\n\
         Email:\n{preview}\n\n\
         Respond with ONLY a JSON object. Use any of these keys that apply:\n\
         name, age, company, job_title, location, phone, interest, education, \
         experience, project, expertise, goal\n\n\
         Omit keys the email gives no information for."
    )
}

// ── Response parsing ────────────────────────────────────────────────

/// Lenient line parser: each fact is a `key: value` line. Headings, bullet
/// lines, and sentinel values are skipped.
fn parse_key_value_lines(raw: &str) -> RawFacts {
    let mut facts = RawFacts::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with('-') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if key.is_empty() || is_sentinel(value) {
            continue;
        }
        facts.insert(key, serde_json::Value::String(value.to_string()));
    }
    facts
}

/// Lenient JSON parser: unwraps markdown fences, drops nulls and sentinel
/// strings, and passes non-string values through for store-side coercion.
fn parse_json_facts(raw: &str) -> Result<RawFacts, String> {
    let json_str = extract_json_object(raw);
    let value: serde_json::Value =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;
    let Some(object) = value.as_object() else {
        return Err("response was not a JSON object".to_string());
    };

    let mut facts = RawFacts::new();
    for (raw_key, value) in object {
        let key = raw_key.trim().to_lowercase();
        if key.is_empty() || value.is_null() {
            continue;
        }
        if let Some(s) = value.as_str()
            && is_sentinel(s)
        {
            continue;
        }
        facts.insert(key, value.clone());
    }
    Ok(facts)
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let inner = after[..end].trim();
                if inner.starts_with('{') {
                    return inner.to_string();
                }
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
