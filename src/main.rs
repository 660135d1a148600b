use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use receipt_relay::config::RelayConfig;
use receipt_relay::mail::{AccountDirectory, ImapFetcher, MailForwarder, SmtpForwarder};
use receipt_relay::pipeline::retention::spawn_retention_task;
use receipt_relay::pipeline::{ProcessingOrchestrator, spawn_cycle_task};
use receipt_relay::store::{Database, LibSqlBackend};
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Tracing: stderr + daily-rolling file, env-filter controlled
    let file_appender = tracing_appender::rolling::daily("./logs", "receipt-relay.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(file_writer.and(std::io::stderr))
        .init();

    let config = RelayConfig::from_env();
    let accounts = AccountDirectory::from_env();

    eprintln!("Receipt Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Accounts: {}", accounts.list_active().len());
    eprintln!("   Poll interval: {} min", config.poll_interval_minutes);
    eprintln!("   Lookback: {} days", config.lookback_days);
    eprintln!(
        "   Forward target: {}",
        if config.forward_target.is_some() {
            "configured"
        } else {
            "NOT CONFIGURED — cycles will abort"
        }
    );

    if accounts.is_empty() {
        anyhow::bail!("No email accounts configured (set EMAIL_ACCOUNTS or EMAIL_USERNAME)");
    }

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&config.db_path))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open database at {}: {e}", config.db_path))?,
    );
    eprintln!("   Database: {}", config.db_path);

    let fetcher = Arc::new(ImapFetcher::new(config.batch_limit));
    let forwarder: Arc<dyn MailForwarder> = Arc::new(
        SmtpForwarder::from_env()
            .ok_or_else(|| anyhow::anyhow!("EMAIL_SMTP_HOST not set, cannot forward"))?,
    );

    let orchestrator = Arc::new(ProcessingOrchestrator::new(
        config.clone(),
        accounts,
        Arc::clone(&db),
        fetcher,
        forwarder,
    ));

    let (cycle_handle, cycle_shutdown) = spawn_cycle_task(
        Arc::clone(&orchestrator),
        Duration::from_secs(config.poll_interval_minutes * 60),
    );
    let (retention_handle, retention_shutdown) = spawn_retention_task(
        Arc::clone(&db),
        Duration::from_secs(config.retention_interval_minutes * 60),
    );

    tokio::signal::ctrl_c().await?;
    eprintln!("Shutting down...");
    cycle_shutdown.store(true, Ordering::Relaxed);
    retention_shutdown.store(true, Ordering::Relaxed);
    cycle_handle.abort();
    retention_handle.abort();

    Ok(())
}
