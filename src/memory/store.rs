//! Per-correspondent profile memory and conversation claims.
//!
//! One `ProfileStore` owns all mutable session state: bounded message history
//! and accumulated facts per correspondent, plus the set of claimed
//! conversation ids. Everything sits behind a single mutex; claiming a
//! conversation is one check-and-insert, so concurrent deliveries of the same
//! conversation resolve to exactly one owner.
//!
//! Profiles are keyed by the raw `From` header value. Normalization to a bare
//! address happens only for stats display.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MemoryConfig;
use crate::identity::{normalize_address, title_case};

/// Raw extraction output, before store-side coercion.
pub type RawFacts = BTreeMap<String, serde_json::Value>;

/// Values that mean "nothing was learned". Never stored.
const SENTINEL_VALUES: &[&str] = &["", "none", "n/a", "not mentioned", "null", "[if mentioned]"];

/// Case-insensitive sentinel check on a trimmed value.
pub(crate) fn is_sentinel(value: &str) -> bool {
    let lowered = value.trim().to_lowercase();
    SENTINEL_VALUES.contains(&lowered.as_str())
}

/// One message received from a correspondent. `sent_response` is set only on
/// the record appended after a reply actually went out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub excerpt: String,
    pub conversation_id: String,
    pub sent_response: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Profile {
    history: VecDeque<MessageRecord>,
    facts: BTreeMap<String, String>,
}

#[derive(Default)]
struct StoreInner {
    profiles: HashMap<String, Profile>,
    processed: HashSet<String>,
}

/// Session counters, keyed by normalized address for display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_correspondents: usize,
    pub processed_conversations: usize,
    pub correspondents_with_facts: usize,
    pub history_counts: BTreeMap<String, usize>,
    pub learned_facts: BTreeMap<String, BTreeMap<String, String>>,
}

/// Session-scoped memory: profiles plus the claimed-conversation set.
pub struct ProfileStore {
    max_history: usize,
    max_excerpt_chars: usize,
    inner: Mutex<StoreInner>,
}

impl ProfileStore {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            max_history: config.max_history,
            max_excerpt_chars: config.max_excerpt_chars,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Atomically claims a conversation. `true` means the caller owns it;
    /// `false` means it was already claimed (or fully processed).
    pub fn claim(&self, conversation_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.processed.insert(conversation_id.to_string())
    }

    /// Undoes a claim after a failed run, making the conversation retryable.
    pub fn release(&self, conversation_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.processed.remove(conversation_id);
    }

    pub fn is_processed(&self, conversation_id: &str) -> bool {
        self.inner.lock().unwrap().processed.contains(conversation_id)
    }

    /// Appends a message record, truncating the body to the configured excerpt
    /// cap (character-safe) and evicting the oldest records past `max_history`.
    pub fn append_message(
        &self,
        correspondent: &str,
        body: &str,
        conversation_id: &str,
        sent_response: Option<&str>,
    ) {
        let excerpt: String = body.chars().take(self.max_excerpt_chars).collect();
        let record = MessageRecord {
            excerpt,
            conversation_id: conversation_id.to_string(),
            sent_response: sent_response.map(str::to_string),
            received_at: Utc::now(),
        };

        let mut inner = self.inner.lock().unwrap();
        let profile = inner.profiles.entry(correspondent.to_string()).or_default();
        profile.history.push_back(record);
        while profile.history.len() > self.max_history {
            profile.history.pop_front();
        }
    }

    /// Merges extracted facts into the profile, last writer wins per key.
    /// Keys are lowercased and trimmed; values are coerced to scalar strings;
    /// sentinel values and empty keys are dropped. Returns what was accepted.
    pub fn merge_facts(
        &self,
        correspondent: &str,
        facts: RawFacts,
    ) -> BTreeMap<String, String> {
        let mut accepted = BTreeMap::new();
        for (raw_key, raw_value) in facts {
            let key = raw_key.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            let Some(value) = coerce_scalar(&raw_value) else {
                continue;
            };
            if is_sentinel(&value) {
                continue;
            }
            accepted.insert(key, value);
        }

        if accepted.is_empty() {
            return accepted;
        }

        let mut inner = self.inner.lock().unwrap();
        let profile = inner.profiles.entry(correspondent.to_string()).or_default();
        for (key, value) in &accepted {
            profile.facts.insert(key.clone(), value.clone());
        }
        debug!(correspondent = %correspondent, count = accepted.len(), "Merged facts into profile");
        accepted
    }

    /// Renders the context block fed into reply generation. Deterministic for
    /// a given store state: facts sorted by key, history oldest-first over the
    /// last `window` records.
    pub fn build_context(&self, correspondent: &str, window: usize) -> String {
        let inner = self.inner.lock().unwrap();
        let profile = inner.profiles.get(correspondent);
        let mut context = String::new();

        if let Some(profile) = profile
            && !profile.facts.is_empty()
        {
            context.push_str("Known information about sender:\n");
            for (key, value) in &profile.facts {
                context.push_str(&format!("- {}: {}\n", title_case(key), value));
            }
            context.push('\n');
        }

        match profile {
            Some(profile) if !profile.history.is_empty() => {
                let count = profile.history.len().min(window);
                context.push_str(&format!(
                    "Previous {} emails from {}:\n",
                    count, correspondent
                ));
                let recent = profile.history.iter().skip(profile.history.len() - count);
                for (i, record) in recent.enumerate() {
                    let preview: String = record.excerpt.chars().take(100).collect();
                    context.push_str(&format!("{}. {}...\n", i + 1, preview));
                }
            }
            _ => context.push_str("No previous interactions."),
        }

        context
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = MemoryStats {
            processed_conversations: inner.processed.len(),
            ..Default::default()
        };
        for (correspondent, profile) in &inner.profiles {
            let display_key = normalize_address(correspondent);
            if !profile.history.is_empty() {
                stats.total_correspondents += 1;
                stats.history_counts.insert(display_key.clone(), profile.history.len());
            }
            if !profile.facts.is_empty() {
                stats.correspondents_with_facts += 1;
                stats.learned_facts.insert(display_key, profile.facts.clone());
            }
        }
        stats
    }

    /// Current facts for a correspondent (empty map if unknown).
    pub fn facts(&self, correspondent: &str) -> BTreeMap<String, String> {
        self.inner
            .lock()
            .unwrap()
            .profiles
            .get(correspondent)
            .map(|p| p.facts.clone())
            .unwrap_or_default()
    }

    /// Retained history for a correspondent, oldest first.
    pub fn history(&self, correspondent: &str) -> Vec<MessageRecord> {
        self.inner
            .lock()
            .unwrap()
            .profiles
            .get(correspondent)
            .map(|p| p.history.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Coerces an extracted value to a stored scalar string. Idempotent: feeding
/// a stored value back through yields the same string.
fn coerce_scalar(value: &serde_json::Value) -> Option<String> {
    use serde_json::Value;
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => items.first().and_then(coerce_scalar),
        Value::Object(_) => serde_json::to_string(value).ok(),
        Value::Null => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn small_store(max_history: usize) -> ProfileStore {
        ProfileStore::new(MemoryConfig {
            max_history,
            context_window: 3,
            max_excerpt_chars: 2000,
        })
    }

    // ── Claims ──────────────────────────────────────────────────────

    #[test]
    fn test_claim_then_duplicate_claim() {
        let store = small_store(10);
        assert!(store.claim("t1"));
        assert!(!store.claim("t1"));
        assert!(store.is_processed("t1"));
    }

    #[test]
    fn test_release_makes_claim_retryable() {
        let store = small_store(10);
        assert!(store.claim("t1"));
        store.release("t1");
        assert!(!store.is_processed("t1"));
        assert!(store.claim("t1"));
    }

    #[test]
    fn test_claim_is_atomic_across_threads() {
        let store = Arc::new(small_store(10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.claim("race-1"))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);
    }

    // ── History ─────────────────────────────────────────────────────

    #[test]
    fn test_history_bounded_fifo() {
        let store = small_store(3);
        for i in 1..=5 {
            store.append_message("a@x.com", &format!("mail {i}"), &format!("t{i}"), None);
        }
        let history = store.history("a@x.com");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].excerpt, "mail 3");
        assert_eq!(history[2].excerpt, "mail 5");
    }

    #[test]
    fn test_append_truncates_excerpt_char_safe() {
        let store = ProfileStore::new(MemoryConfig {
            max_history: 10,
            context_window: 3,
            max_excerpt_chars: 5,
        });
        store.append_message("a@x.com", "héllö wörld", "t1", None);
        let history = store.history("a@x.com");
        assert_eq!(history[0].excerpt, "héllö");
    }

    #[test]
    fn test_sent_response_recorded() {
        let store = small_store(10);
        store.append_message("a@x.com", "question", "t1", None);
        store.append_message("a@x.com", "question", "t1", Some("answer"));
        let history = store.history("a@x.com");
        assert_eq!(history[0].sent_response, None);
        assert_eq!(history[1].sent_response.as_deref(), Some("answer"));
    }

    // ── Fact merge ──────────────────────────────────────────────────

    #[test]
    fn test_merge_last_writer_wins() {
        let store = small_store(10);
        store.merge_facts("a@x.com", RawFacts::from([("name".to_string(), json!("Ann"))]));
        let accepted = store.merge_facts(
            "a@x.com",
            RawFacts::from([
                ("name".to_string(), json!("Annabelle")),
                ("age".to_string(), json!("30")),
            ]),
        );
        assert_eq!(accepted.len(), 2);
        let facts = store.facts("a@x.com");
        assert_eq!(facts.get("name").map(String::as_str), Some("Annabelle"));
        assert_eq!(facts.get("age").map(String::as_str), Some("30"));
    }

    #[test]
    fn test_merge_rejects_sentinels() {
        let store = small_store(10);
        store.merge_facts("a@x.com", RawFacts::from([("name".to_string(), json!("Ann"))]));
        let accepted = store.merge_facts(
            "a@x.com",
            RawFacts::from([
                ("location".to_string(), json!("not mentioned")),
                ("company".to_string(), json!("None")),
                ("phone".to_string(), json!("  ")),
                ("interest".to_string(), json!("N/A")),
            ]),
        );
        assert!(accepted.is_empty());
        assert_eq!(store.facts("a@x.com").len(), 1);
    }

    #[test]
    fn test_merge_normalizes_keys() {
        let store = small_store(10);
        let accepted = store.merge_facts(
            "a@x.com",
            RawFacts::from([(" Job Title ".to_string(), json!("Engineer"))]),
        );
        assert_eq!(accepted.get("job title").map(String::as_str), Some("Engineer"));
    }

    #[test]
    fn test_merge_empty_key_dropped() {
        let store = small_store(10);
        let accepted =
            store.merge_facts("a@x.com", RawFacts::from([("  ".to_string(), json!("x"))]));
        assert!(accepted.is_empty());
        assert!(store.facts("a@x.com").is_empty());
    }

    #[test]
    fn test_merge_does_not_create_empty_profiles() {
        let store = small_store(10);
        store.merge_facts("ghost@x.com", RawFacts::new());
        let stats = store.stats();
        assert_eq!(stats.total_correspondents, 0);
        assert_eq!(stats.correspondents_with_facts, 0);
    }

    // ── Coercion ────────────────────────────────────────────────────

    #[test]
    fn test_coerce_scalars() {
        assert_eq!(coerce_scalar(&json!("Jane")), Some("Jane".to_string()));
        assert_eq!(coerce_scalar(&json!("  Jane  ")), Some("Jane".to_string()));
        assert_eq!(coerce_scalar(&json!(29)), Some("29".to_string()));
        assert_eq!(coerce_scalar(&json!(2.5)), Some("2.5".to_string()));
        assert_eq!(coerce_scalar(&json!(true)), Some("true".to_string()));
        assert_eq!(coerce_scalar(&json!(null)), None);
    }

    #[test]
    fn test_coerce_array_takes_first() {
        assert_eq!(coerce_scalar(&json!(["rust", "go"])), Some("rust".to_string()));
        assert_eq!(coerce_scalar(&json!([42, 7])), Some("42".to_string()));
        assert_eq!(coerce_scalar(&json!([])), None);
    }

    #[test]
    fn test_coerce_object_to_json_text() {
        let coerced = coerce_scalar(&json!({"city": "Austin"})).unwrap();
        assert_eq!(coerced, r#"{"city":"Austin"}"#);
    }

    #[test]
    fn test_coerce_is_idempotent() {
        let first = coerce_scalar(&json!(29)).unwrap();
        let second = coerce_scalar(&serde_json::Value::String(first.clone())).unwrap();
        assert_eq!(first, second);
    }

    // ── Context rendering ───────────────────────────────────────────

    #[test]
    fn test_context_unknown_correspondent() {
        let store = small_store(10);
        assert_eq!(store.build_context("nobody@x.com", 3), "No previous interactions.");
    }

    #[test]
    fn test_context_facts_and_history_format() {
        let store = small_store(10);
        store.merge_facts(
            "Jane <jane@x.com>",
            RawFacts::from([
                ("name".to_string(), json!("Jane")),
                ("age".to_string(), json!("29")),
            ]),
        );
        store.append_message("Jane <jane@x.com>", "Hi there", "t1", None);

        let context = store.build_context("Jane <jane@x.com>", 3);
        assert_eq!(
            context,
            "Known information about sender:\n\
             - Age: 29\n\
             - Name: Jane\n\
             \n\
             Previous 1 emails from Jane <jane@x.com>:\n\
             1. Hi there...\n"
        );
    }

    #[test]
    fn test_context_window_takes_most_recent() {
        let store = small_store(10);
        for i in 1..=4 {
            store.append_message("a@x.com", &format!("mail {i}"), &format!("t{i}"), None);
        }
        let context = store.build_context("a@x.com", 2);
        assert!(context.contains("Previous 2 emails from a@x.com:"));
        assert!(!context.contains("mail 2"));
        assert!(context.contains("1. mail 3...\n"));
        assert!(context.contains("2. mail 4...\n"));
    }

    #[test]
    fn test_context_preview_capped_at_100_chars() {
        let store = small_store(10);
        store.append_message("a@x.com", &"x".repeat(500), "t1", None);
        let context = store.build_context("a@x.com", 3);
        let line = context.lines().last().unwrap();
        assert_eq!(line, format!("1. {}...", "x".repeat(100)));
    }

    #[test]
    fn test_context_deterministic() {
        let store = small_store(10);
        store.merge_facts(
            "a@x.com",
            RawFacts::from([
                ("zeta".to_string(), json!("z")),
                ("alpha".to_string(), json!("a")),
            ]),
        );
        store.append_message("a@x.com", "hello", "t1", None);
        let first = store.build_context("a@x.com", 3);
        let second = store.build_context("a@x.com", 3);
        assert_eq!(first, second);
        // Alphabetical fact order.
        let alpha_pos = first.find("- Alpha").unwrap();
        let zeta_pos = first.find("- Zeta").unwrap();
        assert!(alpha_pos < zeta_pos);
    }

    // ── Stats ───────────────────────────────────────────────────────

    #[test]
    fn test_stats_counts_and_display_keys() {
        let store = small_store(10);
        store.claim("t1");
        store.claim("t2");
        store.append_message("Jane <jane@x.com>", "hi", "t1", None);
        store.append_message("Jane <jane@x.com>", "again", "t2", None);
        store.merge_facts(
            "Jane <jane@x.com>",
            RawFacts::from([("name".to_string(), json!("Jane"))]),
        );
        store.merge_facts("bob@x.com", RawFacts::from([("age".to_string(), json!(41))]));

        let stats = store.stats();
        assert_eq!(stats.processed_conversations, 2);
        // bob has facts but no history.
        assert_eq!(stats.total_correspondents, 1);
        assert_eq!(stats.correspondents_with_facts, 2);
        assert_eq!(stats.history_counts.get("jane@x.com"), Some(&2));
        assert_eq!(
            stats.learned_facts.get("bob@x.com").and_then(|f| f.get("age")),
            Some(&"41".to_string())
        );
    }

    // ── Sentinels ───────────────────────────────────────────────────

    #[test]
    fn test_is_sentinel() {
        assert!(is_sentinel(""));
        assert!(is_sentinel("  "));
        assert!(is_sentinel("None"));
        assert!(is_sentinel("NOT MENTIONED"));
        assert!(is_sentinel("n/a"));
        assert!(is_sentinel("null"));
        assert!(is_sentinel("[if mentioned]"));
        assert!(!is_sentinel("Jane"));
        assert!(!is_sentinel("0"));
    }
}
