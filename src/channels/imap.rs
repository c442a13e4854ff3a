//! IMAP mailbox listener — polls for unseen mail over TLS.
//!
//! The protocol layer is a minimal hand-rolled IMAP client: LOGIN, SELECT,
//! SEARCH UNSEEN, FETCH RFC822, STORE \Seen, LOGOUT. Enough for a
//! single-folder poll loop, not a general IMAP implementation.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channels::MailStream;
use crate::error::MailError;
use crate::identity::normalize_address;
use crate::pipeline::types::InboundMail;

/// Read timeout on the IMAP socket.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed poll before the next tick.
const POLL_BACKOFF: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    pub poll_interval_secs: u64,
    pub allowed_senders: Vec<String>,
}

impl MailboxConfig {
    /// Returns `None` when `EMAIL_IMAP_HOST` is unset (mailbox disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = std::env::var("EMAIL_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        let poll_interval_secs: u64 = std::env::var("EMAIL_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let allowed_senders: Vec<String> = std::env::var("EMAIL_ALLOWED_SENDERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            poll_interval_secs,
            allowed_senders,
        })
    }
}

// ── Conversation identity ───────────────────────────────────────────

/// Strips one leading `Re:` / `Fwd:` / `Fw:` prefix, ASCII case-insensitive.
fn strip_thread_prefix(subject: &str) -> Option<&str> {
    ["re:", "fwd:", "fw:"].iter().find_map(|prefix| {
        subject
            .get(..prefix.len())
            .filter(|head| head.eq_ignore_ascii_case(prefix))
            .map(|_| subject[prefix.len()..].trim_start())
    })
}

/// Strips stacked reply/forward prefixes, preserving the case of what
/// remains. "Re: RE: Fwd: Hello" and "Hello" name the same thread.
pub fn normalize_subject(subject: &str) -> String {
    let mut rest = subject.trim();
    while let Some(next) = strip_thread_prefix(rest) {
        rest = next;
    }
    rest.to_string()
}

/// Thread identity for an inbound message: the normalized subject when
/// non-empty, else the Message-ID, else a generated id.
pub fn conversation_id_for(subject: &str, message_id: Option<&str>) -> String {
    let normalized = normalize_subject(subject);
    if !normalized.is_empty() {
        return normalized;
    }
    match message_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("gen-{}", Uuid::new_v4()),
    }
}

// ── Sender allowlist ────────────────────────────────────────────────

/// Checks a sender address against the allowlist.
///
/// - Empty list → deny all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact match
pub fn is_sender_allowed(allowed: &[String], address: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let address_lower = address.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            address_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(address)
        } else {
            address_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

// ── IMAP session ────────────────────────────────────────────────────

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// One tagged-command IMAP session, normally over TLS. Generic over the
/// stream so tests can drive the protocol from a scripted transcript.
struct ImapSession<S = TlsStream> {
    stream: S,
    tag: u32,
}

impl ImapSession {
    /// Connects, consumes the server greeting, and authenticates.
    fn open(config: &MailboxConfig) -> Result<Self, MailError> {
        let connect_err = |reason: String| MailError::Connect {
            host: config.imap_host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(config.imap_host.clone())
            .map_err(|e| connect_err(e.to_string()))?;
        let conn = ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Self {
            stream: StreamOwned::new(conn, tcp),
            tag: 0,
        };
        session.read_line()?; // server greeting

        let login = session.command(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.username, config.password
        ))?;
        if !response_ok(&login) {
            return Err(MailError::Login {
                username: config.username.clone(),
            });
        }
        Ok(session)
    }
}

impl<S: Read + Write> ImapSession<S> {
    /// Sends one tagged command and reads until the tagged completion line.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, MailError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        self.stream
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.stream.flush()?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    return Err(MailError::Protocol(
                        "connection closed mid-response".to_string(),
                    ))
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn unseen_ids(&mut self) -> Result<Vec<String>, MailError> {
        self.command("SELECT \"INBOX\"")?;
        let response = self.command("SEARCH UNSEEN")?;
        let mut ids = Vec::new();
        for line in &response {
            if let Some(rest) = line.strip_prefix("* SEARCH") {
                ids.extend(rest.split_whitespace().map(str::to_string));
            }
        }
        Ok(ids)
    }

    fn fetch_raw(&mut self, id: &str) -> Result<String, MailError> {
        let response = self.command(&format!("FETCH {id} RFC822"))?;
        // First line is the FETCH envelope, last is the tagged OK.
        Ok(response
            .iter()
            .skip(1)
            .take(response.len().saturating_sub(2))
            .cloned()
            .collect())
    }

    fn mark_seen(&mut self, id: &str) {
        // A failure here means the message is offered again next poll; the
        // processed-set dedup absorbs the repeat.
        if let Err(e) = self.command(&format!("STORE {id} +FLAGS (\\Seen)")) {
            warn!(error = %e, "Failed to mark message seen");
        }
    }

    /// Fetches every unseen message, marking each seen as it goes. On a
    /// stream failure mid-batch the messages fetched so far are returned;
    /// ids not yet fetched keep their unseen flag and are offered again
    /// next poll.
    fn collect_unseen(&mut self) -> Result<Vec<InboundMail>, MailError> {
        let ids = self.unseen_ids()?;
        let parser = MessageParser::default();
        let mut mails = Vec::new();
        for id in &ids {
            let raw = match self.fetch_raw(id) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(id = %id, error = %e, "Fetch failed mid-batch, keeping partial batch");
                    break;
                }
            };
            if let Some(parsed) = parser.parse(raw.as_bytes()) {
                mails.push(inbound_from_parsed(&parsed));
            }
            self.mark_seen(id);
        }
        Ok(mails)
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

fn response_ok(lines: &[String]) -> bool {
    lines.last().is_some_and(|l| l.contains("OK"))
}

// ── Fetching ────────────────────────────────────────────────────────

/// One blocking poll of the mailbox. Returns every unseen message,
/// marking each seen as it goes. Run inside `spawn_blocking`.
pub fn fetch_unseen(config: &MailboxConfig) -> Result<Vec<InboundMail>, MailError> {
    let mut session = ImapSession::open(config)?;
    let mails = session.collect_unseen()?;
    session.logout();
    Ok(mails)
}

fn inbound_from_parsed(parsed: &mail_parser::Message) -> InboundMail {
    let subject = parsed.subject().unwrap_or("").to_string();
    let conversation_id = conversation_id_for(&subject, parsed.message_id());
    InboundMail {
        sender: sender_header(parsed),
        subject,
        body: body_text(parsed),
        conversation_id,
        received_at: message_date(parsed),
    }
}

/// Rebuilds the `From` header value. Profiles are keyed by this string,
/// display name included when the header carried one.
fn sender_header(parsed: &mail_parser::Message) -> String {
    let Some(addr) = parsed.from().and_then(|a| a.first()) else {
        return "unknown".to_string();
    };
    let address = addr.address().unwrap_or("unknown");
    match addr.name() {
        Some(name) if !name.is_empty() => format!("{name} <{address}>"),
        _ => address.to_string(),
    }
}

/// Readable text from the message: plain body, stripped HTML body, or a
/// text attachment as a last resort.
fn body_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    "(no readable content)".to_string()
}

/// Message date when the header parses, else the time we saw it.
fn message_date(parsed: &mail_parser::Message) -> DateTime<Utc> {
    parsed
        .date()
        .and_then(|d| {
            chrono::NaiveDate::from_ymd_opt(
                i32::from(d.year),
                u32::from(d.month),
                u32::from(d.day),
            )
            .and_then(|date| {
                date.and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))
            })
            .map(|naive| naive.and_utc())
        })
        .unwrap_or_else(Utc::now)
}

/// Strips HTML tags and collapses whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Listener task ───────────────────────────────────────────────────

/// Spawns the poll loop. Returns the mail stream and a shutdown flag;
/// setting the flag stops the loop at its next tick.
pub fn spawn_mail_listener(config: MailboxConfig) -> (MailStream, Arc<AtomicBool>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    tokio::spawn(async move {
        info!(
            host = %config.imap_host,
            interval_secs = config.poll_interval_secs,
            "Mailbox listener started"
        );
        let own_address = config.from_address.to_lowercase();
        let mut tick = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));

        loop {
            tick.tick().await;
            if flag.load(Ordering::Relaxed) {
                info!("Mailbox listener shutting down");
                return;
            }

            let cfg = config.clone();
            match tokio::task::spawn_blocking(move || fetch_unseen(&cfg)).await {
                Ok(Ok(mails)) => {
                    for mail in mails {
                        let address = normalize_address(&mail.sender).to_lowercase();
                        // Our own sent mail can surface as unseen; never
                        // answer ourselves.
                        if address == own_address {
                            continue;
                        }
                        if !is_sender_allowed(&config.allowed_senders, &address) {
                            warn!(sender = %mail.sender, "Blocked mail from unlisted sender");
                            continue;
                        }
                        if tx.send(mail).is_err() {
                            info!("Mail stream closed, listener exiting");
                            return;
                        }
                    }
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Mailbox poll failed");
                    tokio::time::sleep(POLL_BACKOFF).await;
                }
                Err(e) => {
                    error!(error = %e, "Mailbox poll task panicked");
                    tokio::time::sleep(POLL_BACKOFF).await;
                }
            }
        }
    });

    (Box::pin(UnboundedReceiverStream::new(rx)), shutdown)
}

// ── Tests ───────────────────────────────────────────────────────────
