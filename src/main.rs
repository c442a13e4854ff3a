use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use mail_assist::assistant::Assistant;
use mail_assist::channels::{
    spawn_mail_listener, ApprovalGate, Console, ConsoleTransport, MailTransport, MailboxConfig,
    SmtpMailer,
};
use mail_assist::config::AssistantConfig;
use mail_assist::extract::FactExtractor;
use mail_assist::identity::UserIdentity;
use mail_assist::llm::create_generator;
use mail_assist::memory::ProfileStore;
use mail_assist::pipeline::ProcessingPipeline;
use mail_assist::reply::ResponseSynthesizer;
use mail_assist::review::ReviewQueue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = AssistantConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    let mailbox = MailboxConfig::from_env();

    eprintln!("📫 Mail Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!(
        "   Memory: {} messages per sender, context window {}",
        config.memory.max_history, config.memory.context_window
    );
    match &mailbox {
        Some(cfg) => eprintln!(
            "   Mailbox: {} (poll every {}s, allowed: {})",
            cfg.imap_host,
            cfg.poll_interval_secs,
            if cfg.allowed_senders.iter().any(|s| s == "*") {
                "everyone".to_string()
            } else if cfg.allowed_senders.is_empty() {
                "none (deny all)".to_string()
            } else {
                cfg.allowed_senders.join(", ")
            }
        ),
        None => eprintln!("   Mailbox: disabled (replies print to the console)"),
    }
    eprintln!();

    let llm = create_generator(&config.llm)?;
    let store = Arc::new(ProfileStore::new(config.memory.clone()));
    let pipeline = Arc::new(ProcessingPipeline::new(
        Arc::clone(&store),
        FactExtractor::standard(llm.clone(), config.extraction),
        ResponseSynthesizer::new(llm),
        config.memory.context_window,
    ));

    // The owner identity signs replies. An explicitly configured address
    // wins; otherwise the mail account's from-address is the owner.
    let owner_address = config
        .owner_address
        .clone()
        .or_else(|| mailbox.as_ref().map(|m| m.from_address.clone()))
        .unwrap_or_default();
    let identity = UserIdentity::from_address(&owner_address, config.owner_role.clone());

    let transport: Arc<dyn MailTransport> = match &mailbox {
        Some(cfg) => Arc::new(SmtpMailer::new(cfg.clone())),
        None => Arc::new(ConsoleTransport),
    };

    let console = Arc::new(Console::new());
    let approval: Arc<dyn ApprovalGate> = console.clone();
    let monitoring = Arc::new(AtomicBool::new(mailbox.is_some()));

    let assistant = Arc::new(Assistant::new(
        pipeline,
        store,
        ReviewQueue::new(),
        transport,
        approval,
        console,
        identity,
        monitoring,
    ));

    let shutdown = if let Some(cfg) = mailbox {
        let (mut stream, shutdown) = spawn_mail_listener(cfg);
        let ingester = Arc::clone(&assistant);
        tokio::spawn(async move {
            while let Some(mail) = stream.next().await {
                ingester.ingest(mail).await;
            }
        });
        Some(shutdown)
    } else {
        None
    };

    assistant.run_console().await;

    if let Some(flag) = shutdown {
        flag.store(true, Ordering::Relaxed);
    }
    eprintln!("Bye.");
    Ok(())
}

/// Stderr-style console logging always; additionally a daily-rolling file
/// when `log_dir` is configured. The returned guard must outlive the
/// process body so buffered file logs flush on exit.
fn init_tracing(
    config: &AssistantConfig,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
