//! Pipeline data types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message delivered for processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMail {
    /// Raw `From` header value; also the profile key.
    pub sender: String,
    pub subject: String,
    pub body: String,
    /// Thread identity; the idempotency key.
    pub conversation_id: String,
    pub received_at: DateTime<Utc>,
}

/// Outcome of processing one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProcessOutcome {
    /// The conversation was already claimed; nothing changed.
    AlreadyProcessed,
    /// A reply was generated and awaits approval.
    Replied(ProcessedReply),
}

impl ProcessOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlreadyProcessed => "already_processed",
            Self::Replied(_) => "replied",
        }
    }
}

/// A generated reply plus what was learned along the way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedReply {
    pub correspondent: String,
    pub conversation_id: String,
    pub reply: String,
    /// Facts accepted by the profile merge for this message.
    pub extracted_facts: BTreeMap<String, String>,
    /// True when synthesis failed and the fixed fallback text was used.
    pub fallback_used: bool,
    pub processed_at: DateTime<Utc>,
}

/// Live counters rendered into freeform prompts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SystemStatus {
    pub monitoring_active: bool,
    pub remembered_correspondents: usize,
    pub processed_conversations: usize,
}
