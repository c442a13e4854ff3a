//! Reply and freeform answer synthesis.

use std::sync::Arc;

use crate::error::LlmError;
use crate::identity::UserIdentity;
use crate::llm::{ChatMessage, CompletionRequest, TextGenerator};
use crate::pipeline::types::SystemStatus;

/// Max tokens for a generated reply.
const REPLY_MAX_TOKENS: u32 = 1000;

/// Temperature for reply generation.
const REPLY_TEMPERATURE: f32 = 0.7;

/// Message chars interpolated into the prompt.
const REPLY_INPUT_CAP: usize = 2000;

/// Wraps the text generator for the two synthesis paths: replies to mail and
/// freeform owner questions. An empty completion is unusable output and
/// surfaces as an error; callers decide how to recover.
pub struct ResponseSynthesizer {
    llm: Arc<dyn TextGenerator>,
}

impl ResponseSynthesizer {
    pub fn new(llm: Arc<dyn TextGenerator>) -> Self {
        Self { llm }
    }

    /// Generates a reply to a correspondent's message with profile context.
    pub async fn reply(
        &self,
        correspondent: &str,
        message: &str,
        context: &str,
        identity: &UserIdentity,
    ) -> Result<String, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_reply_system_prompt(identity)),
            ChatMessage::user(build_reply_user_prompt(correspondent, message, context)),
        ])
        .with_temperature(REPLY_TEMPERATURE)
        .with_max_tokens(REPLY_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        self.non_empty(response.content)
    }

    /// Answers a freeform owner question with system status in the preamble.
    pub async fn freeform(
        &self,
        prompt: &str,
        identity: &UserIdentity,
        status: &SystemStatus,
    ) -> Result<String, LlmError> {
        let request = CompletionRequest::new(vec![ChatMessage::user(build_freeform_prompt(
            prompt, identity, status,
        ))])
        .with_temperature(REPLY_TEMPERATURE)
        .with_max_tokens(REPLY_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        self.non_empty(response.content)
    }

    fn non_empty(&self, content: String) -> Result<String, LlmError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "empty completion".to_string(),
            });
        }
        Ok(trimmed.to_string())
    }
}

/// The reply sent when synthesis fails. Deterministic and always safe to send.
pub fn fallback_reply(identity: &UserIdentity) -> String {
    format!(
        "Thank you for your email. I appreciate you reaching out and will get back to you soon.\n\n\
         Best regards,\n{}",
        identity.display_name
    )
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_reply_system_prompt(identity: &UserIdentity) -> String {
    format!(
        "You are {name} responding to an email sent to your {address} account.\n\n\
         Your information:\n\
         - Name: {name}\n\
         - Email: {address}\n\
         - Role: {role}\n\n\
         Write a personal, helpful response as {name}. Be professional but friendly. \
         Keep it concise. Never invent facts about the sender beyond the provided context.",
        name = identity.display_name,
        address = identity.address,
        role = identity.role,
    )
}

fn build_reply_user_prompt(correspondent: &str, message: &str, context: &str) -> String {
    let preview: String = message.chars().take(REPLY_INPUT_CAP).collect();
    format!(
        "Email from: {correspondent}\n\
         Content: {preview}\n\n\
         Context about sender:\n{context}"
    )
}

fn build_freeform_prompt(prompt: &str, identity: &UserIdentity, status: &SystemStatus) -> String {
    let monitoring = if status.monitoring_active {
        "Active"
    } else {
        "Inactive"
    };
    format!(
        "You are an AI email assistant helping {name} run their mailbox.\n\n\
         Your capabilities include:\n\
         - Monitoring incoming emails\n\
         - Extracting and remembering information about senders\n\
         - Maintaining conversation history and context\n\
         - Generating personalized responses\n\
         - Answering questions about the email system\n\n\
         Owner information:\n\
         - Name: {name}\n\
         - Email: {address}\n\
         - Role: {role}\n\n\
         Current email system status:\n\
         - Monitoring: {monitoring}\n\
         - Remembered senders: {remembered}\n\
         - Processed conversations: {processed}\n\n\
         User question: {prompt}\n\n\
         Answer helpfully and concretely, referring to your owner by name when relevant.",
        name = identity.display_name,
        address = identity.address,
        role = identity.role,
        remembered = status.remembered_correspondents,
        processed = status.processed_conversations,
    )
}
