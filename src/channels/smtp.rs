//! SMTP delivery for approved replies.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::info;

use crate::channels::{MailTransport, MailboxConfig};
use crate::error::MailError;

/// Sends replies through the configured SMTP relay.
pub struct SmtpMailer {
    config: MailboxConfig,
}

impl SmtpMailer {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }

    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let transport = SmtpTransport::relay(&self.config.smtp_host)
            .map_err(|e| MailError::SendFailed {
                recipient: to.to_string(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(self.config.smtp_port)
            .credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.clone(),
            ))
            .build();

        let message = Message::builder()
            .from(
                self.config
                    .from_address
                    .parse()
                    .map_err(|_| MailError::InvalidAddress(self.config.from_address.clone()))?,
            )
            .to(to
                .parse()
                .map_err(|_| MailError::InvalidAddress(to.to_string()))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| MailError::SendFailed {
                recipient: to.to_string(),
                reason: format!("failed to build message: {e}"),
            })?;

        transport
            .send(&message)
            .map_err(|e| MailError::SendFailed {
                recipient: to.to_string(),
                reason: e.to_string(),
            })?;

        info!(recipient = %to, "Reply sent");
        Ok(())
    }
}

/// Reply subject for a conversation. Message-ID and generated fallbacks
/// read as opaque tokens, so those get a generic subject.
fn reply_subject(conversation_id: &str) -> String {
    if conversation_id.is_empty()
        || conversation_id.starts_with('<')
        || conversation_id.starts_with("gen-")
    {
        "Re: your message".to_string()
    } else {
        format!("Re: {conversation_id}")
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn reply(
        &self,
        recipient: &str,
        body: &str,
        conversation_id: &str,
    ) -> Result<(), MailError> {
        self.send(recipient, &reply_subject(conversation_id), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_subject_echoes_thread() {
        assert_eq!(reply_subject("Budget Report"), "Re: Budget Report");
    }

    #[test]
    fn test_reply_subject_generic_for_opaque_ids() {
        assert_eq!(reply_subject("<m1@example.com>"), "Re: your message");
        assert_eq!(reply_subject("gen-1234"), "Re: your message");
        assert_eq!(reply_subject(""), "Re: your message");
    }
}
