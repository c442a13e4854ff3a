//! Review queue — generated replies waiting for operator approval.
//!
//! Nothing leaves the system without passing through this queue. The
//! listener task pushes, the console drains.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::pipeline::types::{InboundMail, ProcessedReply};

/// A generated reply paired with the mail that prompted it.
#[derive(Debug, Clone)]
pub struct PendingReview {
    pub mail: InboundMail,
    pub outcome: ProcessedReply,
}

/// FIFO queue of replies awaiting approval. Cheap to clone; all clones
/// share the same queue.
#[derive(Clone)]
pub struct ReviewQueue {
    inner: Arc<RwLock<VecDeque<PendingReview>>>,
}

impl ReviewQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// Queue a review behind any already waiting.
    pub async fn push(&self, review: PendingReview) {
        info!(
            conversation_id = %review.outcome.conversation_id,
            sender = %review.mail.sender,
            "Reply queued for review"
        );
        self.inner.write().await.push_back(review);
    }

    /// Requeue a review at the front, ahead of everything else. Used when
    /// sending an approved reply failed and it must be offered again first.
    pub async fn push_front(&self, review: PendingReview) {
        self.inner.write().await.push_front(review);
    }

    /// Take the oldest waiting review.
    pub async fn pop(&self) -> Option<PendingReview> {
        self.inner.write().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl Default for ReviewQueue {
    fn default() -> Self {
        Self::new()
    }
}
