//! Operator console: line input, approval prompts, and the print transport.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::error;

use crate::channels::{ApprovalGate, MailTransport};
use crate::error::MailError;
use crate::pipeline::types::InboundMail;

/// Interactive stdin console shared by the command loop and the approval
/// gate. The mutex keeps concurrent readers from interleaving lines.
/// Generic over the input so tests can script it.
pub struct Console<R = BufReader<Stdin>> {
    lines: Mutex<Lines<R>>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

impl<R: AsyncBufRead + Unpin> Console<R> {
    #[cfg(test)]
    fn with_reader(reader: R) -> Self {
        Self {
            lines: Mutex::new(reader.lines()),
        }
    }

    /// Reads one line. `None` means the input reached EOF or failed.
    pub async fn read_line(&self) -> Option<String> {
        match self.lines.lock().await.next_line().await {
            Ok(line) => line,
            Err(e) => {
                error!("Error reading stdin: {e}");
                None
            }
        }
    }

    /// Yes/no prompt. EOF counts as no.
    pub async fn confirm(&self, prompt: &str) -> bool {
        eprint!("{prompt} [Y/n] ");
        match self.read_line().await {
            Some(line) => parse_confirmation(&line),
            None => false,
        }
    }
}

/// Maps a typed answer to a decision. Empty input counts as yes.
fn parse_confirmation(line: &str) -> bool {
    let answer = line.trim().to_lowercase();
    answer.is_empty() || answer == "y" || answer == "yes"
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalGate for Console {
    async fn approve(&self, mail: &str, reply: &str) -> bool {
        println!("\n────────────────────────────────────────");
        println!("{mail}");
        println!("── Proposed reply ──────────────────────");
        println!("{reply}");
        println!("────────────────────────────────────────");
        self.confirm("Send this reply?").await
    }
}

/// Renders an inbound mail for the approval panel.
pub fn render_mail(mail: &InboundMail) -> String {
    let subject = if mail.subject.is_empty() {
        "(no subject)"
    } else {
        &mail.subject
    };
    format!(
        "From: {}\nSubject: {}\n\n{}",
        mail.sender, subject, mail.body
    )
}

/// Prints replies to stdout instead of sending them. Stands in for SMTP
/// when no mailbox is configured.
pub struct ConsoleTransport;

#[async_trait]
impl MailTransport for ConsoleTransport {
    fn name(&self) -> &str {
        "console"
    }

    async fn reply(
        &self,
        recipient: &str,
        body: &str,
        _conversation_id: &str,
    ) -> Result<(), MailError> {
        println!("\n→ To: {recipient}\n{body}\n");
        Ok(())
    }
}
