//! Assistant glue: wires the listener, pipeline, review queue, and console.
//!
//! The flow is deliberately one-directional. Mail comes in through
//! `ingest`, replies wait in the review queue, and only `review_pending`
//! moves them out through the transport. The operator console drives
//! everything else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::channels::console::render_mail;
use crate::channels::{ApprovalGate, Console, MailTransport};
use crate::error::Result;
use crate::identity::{normalize_address, title_case, UserIdentity};
use crate::memory::{MemoryStats, ProfileStore};
use crate::pipeline::types::{InboundMail, ProcessOutcome, SystemStatus};
use crate::pipeline::ProcessingPipeline;
use crate::review::{PendingReview, ReviewQueue};

pub struct Assistant {
    pipeline: Arc<ProcessingPipeline>,
    store: Arc<ProfileStore>,
    reviews: ReviewQueue,
    transport: Arc<dyn MailTransport>,
    approval: Arc<dyn ApprovalGate>,
    console: Arc<Console>,
    identity: UserIdentity,
    monitoring: Arc<AtomicBool>,
}

impl Assistant {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Arc<ProcessingPipeline>,
        store: Arc<ProfileStore>,
        reviews: ReviewQueue,
        transport: Arc<dyn MailTransport>,
        approval: Arc<dyn ApprovalGate>,
        console: Arc<Console>,
        identity: UserIdentity,
        monitoring: Arc<AtomicBool>,
    ) -> Self {
        Self {
            pipeline,
            store,
            reviews,
            transport,
            approval,
            console,
            identity,
            monitoring,
        }
    }

    /// Runs one inbound mail through the pipeline. A generated reply goes
    /// into the review queue; duplicates and failures are logged and
    /// dropped (a failed conversation is retried when redelivered).
    pub async fn ingest(&self, mail: InboundMail) {
        match self
            .pipeline
            .process(
                &mail.sender,
                &mail.body,
                &mail.conversation_id,
                &self.identity,
            )
            .await
        {
            Ok(ProcessOutcome::Replied(outcome)) => {
                eprintln!(
                    "\n📬 Reply drafted for {} (type 'review' to approve)",
                    mail.sender
                );
                self.reviews.push(PendingReview { mail, outcome }).await;
            }
            Ok(ProcessOutcome::AlreadyProcessed) => {
                debug!(conversation_id = %mail.conversation_id, "Duplicate delivery ignored");
            }
            Err(e) => {
                error!(
                    conversation_id = %mail.conversation_id,
                    error = %e,
                    "Failed to process mail, will retry on next delivery"
                );
            }
        }
    }

    /// Offers every waiting reply to the operator, sending the approved
    /// ones. A rejected reply is discarded for good; its conversation
    /// stays processed. A send failure puts the approved reply back at
    /// the front of the queue and stops the session.
    pub async fn review_pending(&self) -> Result<()> {
        while let Some(review) = self.reviews.pop().await {
            if review.outcome.fallback_used {
                eprintln!("⚠️  The reply below is the standard fallback (generation failed).");
            }

            let rendered = render_mail(&review.mail);
            if !self.approval.approve(&rendered, &review.outcome.reply).await {
                info!(
                    conversation_id = %review.outcome.conversation_id,
                    "Reply rejected by operator"
                );
                println!("Reply discarded.");
                continue;
            }

            let recipient = normalize_address(&review.mail.sender);
            match self
                .transport
                .reply(
                    &recipient,
                    &review.outcome.reply,
                    &review.outcome.conversation_id,
                )
                .await
            {
                Ok(()) => {
                    self.pipeline.record_sent_response(
                        &review.mail.sender,
                        &review.mail.body,
                        &review.outcome.conversation_id,
                        &review.outcome.reply,
                    );
                    println!("Reply sent to {recipient}.");
                }
                Err(e) => {
                    // Keep the approved reply first in line so the operator
                    // can retry it before anything newer.
                    self.reviews.push_front(review).await;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// The operator command loop. Blocks until `quit` or EOF.
    pub async fn run_console(&self) {
        println!("Type 'help' for commands.");

        loop {
            // Offer anything that arrived while the operator was away.
            if !self.reviews.is_empty().await
                && let Err(e) = self.review_pending().await
            {
                eprintln!("❌ Send failed: {e}");
            }

            eprint!("> ");
            let Some(line) = self.console.read_line().await else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match line {
                "help" => print_help(),
                "review" => {
                    if self.reviews.is_empty().await {
                        println!("Nothing waiting for review.");
                    } else if let Err(e) = self.review_pending().await {
                        eprintln!("❌ Send failed: {e}");
                    }
                }
                "memory" => println!("{}", render_stats(&self.store.stats())),
                "profile" => println!(
                    "Acting as {} <{}> ({})",
                    self.identity.display_name, self.identity.address, self.identity.role
                ),
                "quit" | "exit" | "q" => break,
                _ => {
                    if let Some(address) = line.strip_prefix("profile ") {
                        println!("{}", self.render_profile(address.trim()));
                    } else if let Some(prompt) = line.strip_prefix("prompt ") {
                        let answer = self
                            .pipeline
                            .answer_freeform(prompt.trim(), &self.identity, self.system_status())
                            .await;
                        println!("\n{answer}\n");
                    } else {
                        println!("Unknown command, type 'help'.");
                    }
                }
            }
        }
    }

    /// Live counters for freeform prompts.
    pub fn system_status(&self) -> SystemStatus {
        let stats = self.store.stats();
        SystemStatus {
            monitoring_active: self.monitoring.load(Ordering::Relaxed),
            remembered_correspondents: stats.correspondents_with_facts,
            processed_conversations: stats.processed_conversations,
        }
    }

    /// What is remembered about one correspondent, looked up by address.
    fn render_profile(&self, address: &str) -> String {
        let needle = normalize_address(address).to_lowercase();
        let stats = self.store.stats();

        let facts = stats
            .learned_facts
            .iter()
            .find(|(sender, _)| sender.to_lowercase() == needle)
            .map(|(_, facts)| facts);
        let messages = stats
            .history_counts
            .iter()
            .find(|(sender, _)| sender.to_lowercase() == needle)
            .map(|(_, count)| *count);

        let mut out = String::new();
        if let Some(facts) = facts {
            out.push_str("Known facts:\n");
            for (key, value) in facts {
                out.push_str(&format!("  {}: {}\n", title_case(key), value));
            }
        }
        if let Some(count) = messages {
            out.push_str(&format!("Messages on record: {count}\n"));
        }
        if out.is_empty() {
            format!("Nothing remembered about {address}.")
        } else {
            out.trim_end().to_string()
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  review             approve or reject waiting replies");
    println!("  prompt <text>      ask the assistant a question");
    println!("  memory             show everything remembered");
    println!("  profile [address]  show the assistant identity, or one sender's profile");
    println!("  help               this list");
    println!("  quit               exit");
}

fn render_stats(stats: &MemoryStats) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Senders remembered:      {}\n",
        stats.total_correspondents
    ));
    out.push_str(&format!(
        "Conversations processed: {}\n",
        stats.processed_conversations
    ));
    out.push_str(&format!(
        "Senders with facts:      {}\n",
        stats.correspondents_with_facts
    ));

    if !stats.history_counts.is_empty() {
        out.push_str("\nHistory:\n");
        for (sender, count) in &stats.history_counts {
            out.push_str(&format!("  {sender}: {count} message(s)\n"));
        }
    }
    if !stats.learned_facts.is_empty() {
        out.push_str("\nLearned facts:\n");
        for (sender, facts) in &stats.learned_facts {
            out.push_str(&format!("  {sender}:\n"));
            for (key, value) in facts {
                out.push_str(&format!("    {key}: {value}\n"));
            }
        }
    }
    out.trim_end().to_string()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::result::Result;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::config::{ExtractionFormat, MemoryConfig};
    use crate::error::{Error, LlmError, MailError};
    use crate::extract::FactExtractor;
    use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, TextGenerator};
    use crate::reply::ResponseSynthesizer;

    struct ScriptedLlm {
        responses: Mutex<VecDeque<String>>,
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
            let content = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("mock ran out of scripted responses");
            Ok(CompletionResponse {
                content,
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    /// Records deliveries; optionally fails every attempt.
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String, String)>>,
        fail: bool,
    }

    impl RecordingTransport {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn reply(
            &self,
            recipient: &str,
            body: &str,
            conversation_id: &str,
        ) -> Result<(), MailError> {
            if self.fail {
                return Err(MailError::SendFailed {
                    recipient: recipient.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            self.sent.lock().unwrap().push((
                recipient.to_string(),
                body.to_string(),
                conversation_id.to_string(),
            ));
            Ok(())
        }
    }

    struct AutoGate {
        decision: bool,
    }

    #[async_trait]
    impl ApprovalGate for AutoGate {
        async fn approve(&self, _mail: &str, _reply: &str) -> bool {
            self.decision
        }
    }

    fn mail(conversation_id: &str) -> InboundMail {
        InboundMail {
            sender: "Jane Doe <jane@example.com>".to_string(),
            subject: "Hello".to_string(),
            body: "Hi, it's Jane.".to_string(),
            conversation_id: conversation_id.to_string(),
            received_at: Utc::now(),
        }
    }

    fn assistant_with(
        responses: Vec<&str>,
        decision: bool,
        transport: Arc<RecordingTransport>,
    ) -> (Assistant, Arc<ProfileStore>) {
        let llm = Arc::new(ScriptedLlm {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
        });
        let store = Arc::new(ProfileStore::new(MemoryConfig::default()));
        let pipeline = Arc::new(ProcessingPipeline::new(
            Arc::clone(&store),
            FactExtractor::standard(llm.clone(), ExtractionFormat::KeyValue),
            ResponseSynthesizer::new(llm),
            3,
        ));
        let assistant = Assistant::new(
            Arc::clone(&pipeline),
            Arc::clone(&store),
            ReviewQueue::new(),
            transport,
            Arc::new(AutoGate { decision }),
            Arc::new(Console::new()),
            UserIdentity::from_address("me@example.com", "Professional Email Assistant"),
            Arc::new(AtomicBool::new(true)),
        );
        (assistant, store)
    }

    #[tokio::test]
    async fn test_ingest_queues_reply_for_review() {
        let transport = RecordingTransport::new(false);
        let (assistant, store) =
            assistant_with(vec!["name: Jane", "Hi Jane!"], true, transport.clone());

        assistant.ingest(mail("t1")).await;

        assert_eq!(assistant.reviews.len().await, 1);
        assert!(store.is_processed("t1"));
        // Nothing goes out until the operator reviews.
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approved_reply_is_sent_and_recorded() {
        let transport = RecordingTransport::new(false);
        let (assistant, store) =
            assistant_with(vec!["name: Jane", "Hi Jane!"], true, transport.clone());

        assistant.ingest(mail("t2")).await;
        assistant.review_pending().await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "jane@example.com");
        assert_eq!(sent[0].1, "Hi Jane!");
        assert_eq!(sent[0].2, "t2");
        drop(sent);

        assert!(assistant.reviews.is_empty().await);
        let history = store.history("Jane Doe <jane@example.com>");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].sent_response.as_deref(), Some("Hi Jane!"));
    }

    #[tokio::test]
    async fn test_rejected_reply_is_dropped_but_claim_stays() {
        let transport = RecordingTransport::new(false);
        let (assistant, store) =
            assistant_with(vec!["name: Jane", "Hi Jane!"], false, transport.clone());

        assistant.ingest(mail("t3")).await;
        assistant.review_pending().await.unwrap();

        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(assistant.reviews.is_empty().await);
        // Rejection does not reopen the conversation.
        assert!(store.is_processed("t3"));
        assert_eq!(store.history("Jane Doe <jane@example.com>").len(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_requeues_reply_at_front() {
        let transport = RecordingTransport::new(true);
        let (assistant, store) =
            assistant_with(vec!["name: Jane", "Hi Jane!"], true, transport.clone());

        assistant.ingest(mail("t4")).await;
        let err = assistant.review_pending().await.unwrap_err();
        assert!(matches!(err, Error::Mail(MailError::SendFailed { .. })));

        // The approved reply is waiting again and no sent record exists.
        assert_eq!(assistant.reviews.len().await, 1);
        assert!(store.is_processed("t4"));
        assert_eq!(store.history("Jane Doe <jane@example.com>").len(), 1);
    }

    #[test]
    fn test_render_stats_lists_facts_and_history() {
        let store = ProfileStore::new(MemoryConfig::default());
        store.merge_facts(
            "Jane Doe <jane@example.com>",
            [("name".to_string(), serde_json::json!("Jane"))]
                .into_iter()
                .collect(),
        );
        store.append_message("Jane Doe <jane@example.com>", "Hi!", "t1", None);
        store.claim("t1");

        let rendered = render_stats(&store.stats());
        assert!(rendered.contains("Senders remembered:      1"));
        assert!(rendered.contains("Conversations processed: 1"));
        assert!(rendered.contains("jane@example.com: 1 message(s)"));
        assert!(rendered.contains("name: Jane"));
    }

    #[tokio::test]
    async fn test_render_profile_by_bare_address() {
        let transport = RecordingTransport::new(false);
        let (assistant, _store) =
            assistant_with(vec!["name: Jane\ncompany: Acme", "Hi Jane!"], true, transport);

        assistant.ingest(mail("t5")).await;

        let rendered = assistant.render_profile("jane@example.com");
        assert!(rendered.contains("Name: Jane"));
        assert!(rendered.contains("Company: Acme"));
        assert!(rendered.contains("Messages on record: 1"));

        let missing = assistant.render_profile("nobody@example.com");
        assert_eq!(missing, "Nothing remembered about nobody@example.com.");
    }
}
