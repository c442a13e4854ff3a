//! Conversation processor: the exactly-once reply path.
//!
//! Every inbound message runs through the same four steps: claim the
//! conversation, extract facts into the sender's profile, record the
//! message, synthesize a reply against the remembered context. The claim
//! is taken before any other work and released only if a step fails while
//! no reply exists yet, so a conversation is answered at most once no
//! matter how many times it is delivered.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::extract::FactExtractor;
use crate::identity::UserIdentity;
use crate::memory::ProfileStore;
use crate::pipeline::types::{ProcessOutcome, ProcessedReply, SystemStatus};
use crate::reply::{fallback_reply, ResponseSynthesizer};

/// Drives one message from arrival to a reply awaiting approval.
pub struct ProcessingPipeline {
    store: Arc<ProfileStore>,
    extractor: FactExtractor,
    synthesizer: ResponseSynthesizer,
    /// How many history records feed the reply context.
    context_window: usize,
}

impl ProcessingPipeline {
    pub fn new(
        store: Arc<ProfileStore>,
        extractor: FactExtractor,
        synthesizer: ResponseSynthesizer,
        context_window: usize,
    ) -> Self {
        Self {
            store,
            extractor,
            synthesizer,
            context_window,
        }
    }

    /// Processes one conversation end to end.
    ///
    /// The claim check is the only gate: a conversation that was claimed
    /// before (by this call or any concurrent one) is skipped without
    /// touching the profile. On extraction failure the claim is released
    /// so a later delivery can retry; once a reply exists the claim is
    /// never given back.
    pub async fn process(
        &self,
        correspondent: &str,
        message: &str,
        conversation_id: &str,
        identity: &UserIdentity,
    ) -> Result<ProcessOutcome, PipelineError> {
        if !self.store.claim(conversation_id) {
            info!(conversation_id = %conversation_id, "Conversation already processed, skipping");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        match self
            .run_claimed(correspondent, message, conversation_id, identity)
            .await
        {
            Ok(reply) => Ok(ProcessOutcome::Replied(reply)),
            Err(e) => {
                self.store.release(conversation_id);
                warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "Processing failed, claim released for retry"
                );
                Err(e)
            }
        }
    }

    async fn run_claimed(
        &self,
        correspondent: &str,
        message: &str,
        conversation_id: &str,
        identity: &UserIdentity,
    ) -> Result<ProcessedReply, PipelineError> {
        let raw_facts =
            self.extractor
                .extract(message)
                .await
                .map_err(|e| PipelineError::Extraction {
                    conversation_id: conversation_id.to_string(),
                    reason: e.to_string(),
                })?;

        let extracted_facts = self.store.merge_facts(correspondent, raw_facts);
        self.store
            .append_message(correspondent, message, conversation_id, None);

        let context = self.store.build_context(correspondent, self.context_window);

        // Synthesis failure is not a pipeline failure: the fixed fallback
        // text goes out for review instead, flagged so the operator can see
        // the reply was not generated.
        let (reply, fallback_used) = match self
            .synthesizer
            .reply(correspondent, message, &context, identity)
            .await
        {
            Ok(text) => (text, false),
            Err(e) => {
                warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "Reply synthesis failed, using fallback text"
                );
                (fallback_reply(identity), true)
            }
        };

        info!(
            conversation_id = %conversation_id,
            facts = extracted_facts.len(),
            fallback_used,
            "Conversation processed"
        );

        Ok(ProcessedReply {
            correspondent: correspondent.to_string(),
            conversation_id: conversation_id.to_string(),
            reply,
            extracted_facts,
            fallback_used,
            processed_at: Utc::now(),
        })
    }

    /// Records the reply that actually went out as a second history record.
    ///
    /// Called only after the transport reported success; this is the sole
    /// place a `sent_response` is ever written.
    pub fn record_sent_response(
        &self,
        correspondent: &str,
        message: &str,
        conversation_id: &str,
        reply: &str,
    ) {
        self.store
            .append_message(correspondent, message, conversation_id, Some(reply));
        debug!(conversation_id = %conversation_id, "Sent response recorded");
    }

    /// Answers a direct operator question about the system or its memory.
    ///
    /// Failures degrade to an apology line instead of an error so the
    /// console stays usable when the backend is down.
    pub async fn answer_freeform(
        &self,
        prompt: &str,
        identity: &UserIdentity,
        status: SystemStatus,
    ) -> String {
        match self.synthesizer.freeform(prompt, identity, &status).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Freeform answer failed");
                format!("Unable to answer right now: {e}")
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{ExtractionFormat, MemoryConfig};
    use crate::error::LlmError;
    use crate::extract::LlmExtraction;
    use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, TextGenerator};

    /// Pops one scripted response per completion call. Panics when a call
    /// arrives that the test did not script, which catches paths that hit
    /// the LLM when they must not.
    struct ScriptedLlm {
        responses: Mutex<VecDeque<Result<String, ()>>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<&str, ()>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("mock ran out of scripted responses");
            match next {
                Ok(content) => Ok(CompletionResponse {
                    content,
                    input_tokens: 0,
                    output_tokens: 0,
                    finish_reason: FinishReason::Stop,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "scripted".to_string(),
                    reason: "scripted failure".to_string(),
                }),
            }
        }
    }

    fn identity() -> UserIdentity {
        UserIdentity::from_address("john.smith@example.com", "Professional Email Assistant")
    }

    /// Pipeline over a fresh store with the standard extraction chain.
    fn pipeline_with(responses: Vec<Result<&str, ()>>) -> (Arc<ProfileStore>, ProcessingPipeline) {
        let llm = ScriptedLlm::new(responses);
        let store = Arc::new(ProfileStore::new(MemoryConfig::default()));
        let pipeline = ProcessingPipeline::new(
            Arc::clone(&store),
            FactExtractor::standard(llm.clone(), ExtractionFormat::KeyValue),
            ResponseSynthesizer::new(llm),
            3,
        );
        (store, pipeline)
    }

    #[tokio::test]
    async fn test_process_learns_facts_and_replies() {
        let (store, pipeline) = pipeline_with(vec![
            Ok("name: Jane\nage: 29\ncompany: Acme"),
            Ok("Hi Jane! Great to hear from Acme."),
        ]);

        let outcome = pipeline
            .process(
                "Jane Doe <jane@example.com>",
                "Hi, I'm Jane from Acme. I'm 29 years old.",
                "t1",
                &identity(),
            )
            .await
            .unwrap();

        let ProcessOutcome::Replied(reply) = outcome else {
            panic!("Expected Replied, got AlreadyProcessed");
        };
        assert_eq!(reply.reply, "Hi Jane! Great to hear from Acme.");
        assert!(!reply.fallback_used);
        assert_eq!(reply.extracted_facts.get("name").unwrap(), "Jane");
        assert_eq!(reply.extracted_facts.get("age").unwrap(), "29");
        assert_eq!(reply.extracted_facts.get("company").unwrap(), "Acme");

        assert!(store.is_processed("t1"));
        let history = store.history("Jane Doe <jane@example.com>");
        assert_eq!(history.len(), 1);
        assert!(history[0].sent_response.is_none());
    }

    #[tokio::test]
    async fn test_process_is_idempotent() {
        let (store, pipeline) = pipeline_with(vec![Ok("name: Jane"), Ok("Hello Jane!")]);

        let first = pipeline
            .process("jane@example.com", "Hi, it's Jane.", "t2", &identity())
            .await
            .unwrap();
        assert!(matches!(first, ProcessOutcome::Replied(_)));

        // No scripted responses remain: a second LLM call would panic the
        // mock, so reaching AlreadyProcessed proves nothing ran.
        let second = pipeline
            .process("jane@example.com", "Hi, it's Jane.", "t2", &identity())
            .await
            .unwrap();
        assert!(matches!(second, ProcessOutcome::AlreadyProcessed));
        assert_eq!(store.history("jane@example.com").len(), 1);
    }

    #[tokio::test]
    async fn test_extraction_falls_back_to_patterns() {
        let (store, pipeline) = pipeline_with(vec![Err(()), Ok("Hi Jane!")]);

        let outcome = pipeline
            .process(
                "jane@example.com",
                "Hi, I'm Jane. I work at Acme Corp.",
                "t3",
                &identity(),
            )
            .await
            .unwrap();

        let ProcessOutcome::Replied(reply) = outcome else {
            panic!("Expected Replied, got AlreadyProcessed");
        };
        assert_eq!(reply.extracted_facts.get("name").unwrap(), "Jane");
        assert_eq!(reply.extracted_facts.get("company").unwrap(), "Acme Corp");
        assert!(store.is_processed("t3"));
    }

    #[tokio::test]
    async fn test_synthesis_failure_uses_fallback_and_keeps_claim() {
        let (store, pipeline) = pipeline_with(vec![Ok("name: Jane"), Err(())]);

        let outcome = pipeline
            .process("jane@example.com", "Hi, it's Jane.", "t4", &identity())
            .await
            .unwrap();

        let ProcessOutcome::Replied(reply) = outcome else {
            panic!("Expected Replied, got AlreadyProcessed");
        };
        assert!(reply.fallback_used);
        assert_eq!(reply.reply, fallback_reply(&identity()));
        assert!(store.is_processed("t4"));
    }

    #[tokio::test]
    async fn test_extraction_failure_releases_claim_for_retry() {
        // Single-strategy chain so the scripted error cannot be rescued by
        // the pattern fallback.
        let llm = ScriptedLlm::new(vec![Err(()), Ok("name: Jane"), Ok("Hello Jane!")]);
        let store = Arc::new(ProfileStore::new(MemoryConfig::default()));
        let pipeline = ProcessingPipeline::new(
            Arc::clone(&store),
            FactExtractor::new(vec![Arc::new(LlmExtraction::new(
                llm.clone(),
                ExtractionFormat::KeyValue,
            ))]),
            ResponseSynthesizer::new(llm),
            3,
        );

        let err = pipeline
            .process("jane@example.com", "Hi, it's Jane.", "t5", &identity())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Extraction { .. }));
        assert!(!store.is_processed("t5"));
        assert!(store.history("jane@example.com").is_empty());

        // Retry is a fresh attempt, not an AlreadyProcessed skip.
        let retry = pipeline
            .process("jane@example.com", "Hi, it's Jane.", "t5", &identity())
            .await
            .unwrap();
        assert!(matches!(retry, ProcessOutcome::Replied(_)));
        assert!(store.is_processed("t5"));
    }

    #[tokio::test]
    async fn test_record_sent_response_appends_second_record() {
        let (store, pipeline) = pipeline_with(vec![Ok("name: Jane"), Ok("Hello Jane!")]);

        pipeline
            .process("jane@example.com", "Hi, it's Jane.", "t6", &identity())
            .await
            .unwrap();
        pipeline.record_sent_response("jane@example.com", "Hi, it's Jane.", "t6", "Hello Jane!");

        let history = store.history("jane@example.com");
        assert_eq!(history.len(), 2);
        assert!(history[0].sent_response.is_none());
        assert_eq!(history[1].sent_response.as_deref(), Some("Hello Jane!"));
        assert_eq!(history[1].conversation_id, "t6");
    }

    #[tokio::test]
    async fn test_concurrent_process_replies_once() {
        let (store, pipeline) = pipeline_with(vec![Ok("name: Jane"), Ok("Hello Jane!")]);

        let identity = identity();
        let (a, b) = tokio::join!(
            pipeline.process("jane@example.com", "Hi, it's Jane.", "t7", &identity),
            pipeline.process("jane@example.com", "Hi, it's Jane.", "t7", &identity),
        );

        let outcomes = [a.unwrap(), b.unwrap()];
        let replied = outcomes
            .iter()
            .filter(|o| matches!(o, ProcessOutcome::Replied(_)))
            .count();
        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o, ProcessOutcome::AlreadyProcessed))
            .count();
        assert_eq!(replied, 1);
        assert_eq!(skipped, 1);
        assert_eq!(store.history("jane@example.com").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_extraction_still_replies() {
        let (store, pipeline) = pipeline_with(vec![Ok("nothing here"), Ok("Hi!")]);

        let outcome = pipeline
            .process("sam@example.com", "Just checking in.", "t8", &identity())
            .await
            .unwrap();

        let ProcessOutcome::Replied(reply) = outcome else {
            panic!("Expected Replied, got AlreadyProcessed");
        };
        assert!(reply.extracted_facts.is_empty());
        assert_eq!(reply.reply, "Hi!");
        assert!(!reply.fallback_used);
        assert_eq!(store.history("sam@example.com").len(), 1);
    }

    #[tokio::test]
    async fn test_answer_freeform_passes_through() {
        let (_store, pipeline) = pipeline_with(vec![Ok("You have 3 senders remembered.")]);

        let status = SystemStatus {
            monitoring_active: true,
            remembered_correspondents: 3,
            processed_conversations: 5,
        };
        let answer = pipeline
            .answer_freeform("how many senders?", &identity(), status)
            .await;
        assert_eq!(answer, "You have 3 senders remembered.");
    }

    #[tokio::test]
    async fn test_answer_freeform_degrades_on_failure() {
        let (_store, pipeline) = pipeline_with(vec![Err(())]);

        let status = SystemStatus {
            monitoring_active: false,
            remembered_correspondents: 0,
            processed_conversations: 0,
        };
        let answer = pipeline
            .answer_freeform("anything there?", &identity(), status)
            .await;
        assert!(answer.starts_with("Unable to answer right now:"));
    }
}
