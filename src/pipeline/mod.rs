//! Inbound mail processing.
//!
//! Every message from any source flows through the same path:
//! 1. `ProfileStore::claim()` takes the conversation, exactly once
//! 2. `FactExtractor::extract()` pulls facts into the sender's profile
//! 3. `ResponseSynthesizer::reply()` drafts a reply against the profile
//! 4. The reply waits in the review queue until an operator approves it
//!
//! Nothing is sent without approval. Every outbound reply goes through
//! the review queue.

pub mod processor;
pub mod types;

pub use processor::ProcessingPipeline;
pub use types::{InboundMail, ProcessOutcome, ProcessedReply, SystemStatus};
