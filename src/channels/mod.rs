//! Mail I/O: where messages come from and where approved replies go.

pub mod console;
pub mod imap;
pub mod smtp;

pub use console::{Console, ConsoleTransport};
pub use imap::{spawn_mail_listener, MailboxConfig};
pub use smtp::SmtpMailer;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::MailError;
use crate::pipeline::types::InboundMail;

/// Stream of inbound mail produced by a listener task.
pub type MailStream = Pin<Box<dyn Stream<Item = InboundMail> + Send>>;

/// Delivers approved replies back to correspondents.
#[async_trait]
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Delivers one reply. The caller decides whether a failed reply is
    /// offered for review again.
    async fn reply(
        &self,
        recipient: &str,
        body: &str,
        conversation_id: &str,
    ) -> Result<(), MailError>;
}

/// Asks the operator whether a generated reply may be sent.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Presents one mail/reply pair for review. `true` approves sending.
    async fn approve(&self, mail: &str, reply: &str) -> bool;
}
