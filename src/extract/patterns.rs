//! Deterministic pattern fallback for fact extraction.
//!
//! Scans for introduction phrases ("my name is ", "work at ", ...) and
//! captures a short slice after the first occurrence. No model involved, so
//! this strategy never errors; it simply finds nothing in unfamiliar text.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::extract::{ExtractionStrategy, StrategyError};
use crate::identity::title_case;
use crate::memory::RawFacts;

/// Characters captured after a matched phrase.
const CAPTURE_CHARS: usize = 20;

/// Per-field phrase tables, tried in order. The first phrase that yields a
/// valid value wins; a phrase that matches but yields nothing does not
/// consume the field.
const FIELD_PHRASES: &[(&str, &[&str])] = &[
    ("name", &["my name is ", "i'm ", "i am ", "call me "]),
    ("age", &[" years old", "age is ", "i'm "]),
    ("company", &["work at ", "from ", "company "]),
    ("location", &["based in ", "from ", "live in "]),
];

static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Fallback extraction strategy over fixed phrase tables.
pub struct PatternExtraction;

#[async_trait]
impl ExtractionStrategy for PatternExtraction {
    fn name(&self) -> &'static str {
        "patterns"
    }

    async fn extract(&self, message: &str) -> Result<RawFacts, StrategyError> {
        Ok(scan(message))
    }
}

fn scan(text: &str) -> RawFacts {
    // ASCII lowering is byte-length preserving, so indices found in `lowered`
    // are valid char boundaries in `text`.
    let lowered: String = text.chars().map(|c| c.to_ascii_lowercase()).collect();
    let mut facts = RawFacts::new();

    for (field, phrases) in FIELD_PHRASES {
        for phrase in *phrases {
            let Some(idx) = lowered.find(phrase) else {
                continue;
            };
            let start = idx + phrase.len();
            let slice: String = text[start..].chars().take(CAPTURE_CHARS).collect();

            let value = if *field == "age" {
                longest_digit_run(&slice)
            } else {
                clause_value(&slice)
            };

            if let Some(value) = value {
                facts.insert(field.to_string(), serde_json::Value::String(value));
                break;
            }
        }
    }

    facts
}

/// The longest ASCII digit run anywhere in the slice; ties go to the first.
fn longest_digit_run(slice: &str) -> Option<String> {
    let mut best: Option<&str> = None;
    for m in DIGIT_RUN.find_iter(slice) {
        let run = m.as_str();
        if best.is_none_or(|b| run.len() > b.len()) {
            best = Some(run);
        }
    }
    best.map(str::to_string)
}

/// First clause of the slice (up to a period, comma, or newline), trimmed and
/// title-cased. Single-character clauses are noise, not values.
fn clause_value(slice: &str) -> Option<String> {
    let clause = slice.split(['.', ',', '\n']).next()?.trim();
    if clause.chars().count() > 1 {
        Some(title_case(clause))
    } else {
        None
    }
}
