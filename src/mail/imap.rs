//! IMAP fetcher — raw IMAP over rustls, blocking, run under
//! `spawn_blocking`.
//!
//! Speaks just enough IMAP for the relay: LOGIN, SELECT, SEARCH SINCE /
//! SEARCH HEADER, FETCH RFC822. Messages are never flagged or mutated on
//! the server; deduplication happens against the processed-email history.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::error::MailError;
use crate::mail::{Account, MailFetcher};
use crate::pipeline::types::{EmailMessage, redact_address};

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// IMAP-backed `MailFetcher`.
#[derive(Debug, Clone)]
pub struct ImapFetcher {
    /// Cap on messages fetched per account per call.
    batch_limit: usize,
}

impl ImapFetcher {
    pub fn new(batch_limit: usize) -> Self {
        Self { batch_limit }
    }
}

#[async_trait]
impl MailFetcher for ImapFetcher {
    async fn fetch_window(
        &self,
        account: &Account,
        lookback_days: u32,
    ) -> Result<Vec<EmailMessage>, MailError> {
        let account = account.clone();
        let batch_limit = self.batch_limit;
        tokio::task::spawn_blocking(move || fetch_window_blocking(&account, lookback_days, batch_limit))
            .await
            .map_err(|e| MailError::Fetch(format!("fetch task panicked: {e}")))?
    }

    async fn fetch_by_id(
        &self,
        account: &Account,
        message_id: &str,
    ) -> Result<Option<EmailMessage>, MailError> {
        let account = account.clone();
        let message_id = message_id.to_string();
        tokio::task::spawn_blocking(move || fetch_by_id_blocking(&account, &message_id))
            .await
            .map_err(|e| MailError::Fetch(format!("fetch task panicked: {e}")))?
    }
}

// ── Blocking IMAP session ───────────────────────────────────────────

/// Open a TLS connection and log in.
fn connect(account: &Account) -> Result<TlsStream, MailError> {
    let tcp = TcpStream::connect((&*account.imap_host, account.imap_port)).map_err(|e| {
        MailError::Connect {
            host: account.imap_host.clone(),
            reason: e.to_string(),
        }
    })?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))
        .map_err(|e| MailError::Connect {
            host: account.imap_host.clone(),
            reason: e.to_string(),
        })?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name: rustls_pki_types::ServerName<'_> =
        rustls_pki_types::ServerName::try_from(account.imap_host.clone()).map_err(|e| {
            MailError::Connect {
                host: account.imap_host.clone(),
                reason: e.to_string(),
            }
        })?;
    let conn = rustls::ClientConnection::new(tls_config, server_name).map_err(|e| {
        MailError::Connect {
            host: account.imap_host.clone(),
            reason: e.to_string(),
        }
    })?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    // Greeting, then LOGIN and SELECT.
    let _greeting = read_line(&mut tls)?;
    let login_resp = send_cmd(
        &mut tls,
        "A1",
        &format!(
            "LOGIN \"{}\" \"{}\"",
            account.email,
            account.password.expose_secret()
        ),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err(MailError::Auth {
            account: redact_address(&account.email),
        });
    }
    let _select = send_cmd(&mut tls, "A2", "SELECT \"INBOX\"")?;

    Ok(tls)
}

fn read_line(tls: &mut TlsStream) -> Result<String, MailError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err(MailError::Fetch("IMAP connection closed".into())),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(MailError::Fetch(e.to_string())),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, MailError> {
    let full = format!("{tag} {cmd}\r\n");
    IoWrite::write_all(tls, full.as_bytes()).map_err(|e| MailError::Fetch(e.to_string()))?;
    IoWrite::flush(tls).map_err(|e| MailError::Fetch(e.to_string()))?;
    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

/// Pull message sequence numbers out of a `* SEARCH` response.
fn parse_search_ids(lines: &[String]) -> Vec<String> {
    let mut ids = Vec::new();
    for line in lines {
        if line.starts_with("* SEARCH") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 2 {
                ids.extend(parts[2..].iter().map(|s| s.to_string()));
            }
        }
    }
    ids
}

/// FETCH one message and parse it.
fn fetch_message(
    tls: &mut TlsStream,
    tag_counter: &mut u32,
    id: &str,
    account_email: &str,
) -> Result<Option<EmailMessage>, MailError> {
    let fetch_tag = format!("A{tag_counter}");
    *tag_counter += 1;
    let fetch_resp = send_cmd(tls, &fetch_tag, &format!("FETCH {id} RFC822"))?;

    let raw: String = fetch_resp
        .iter()
        .skip(1)
        .take(fetch_resp.len().saturating_sub(2))
        .cloned()
        .collect();

    Ok(EmailMessage::from_rfc822(raw.as_bytes(), account_email))
}

fn fetch_window_blocking(
    account: &Account,
    lookback_days: u32,
    batch_limit: usize,
) -> Result<Vec<EmailMessage>, MailError> {
    let mut tls = connect(account)?;

    // IMAP date format: 13-Jul-2026.
    let since = (Utc::now() - chrono::Duration::days(i64::from(lookback_days)))
        .format("%d-%b-%Y")
        .to_string();
    let search_resp = send_cmd(&mut tls, "A3", &format!("SEARCH SINCE {since}"))?;
    let mut ids = parse_search_ids(&search_resp);

    let total = ids.len();
    if total > batch_limit {
        warn!(
            account = %redact_address(&account.email),
            total,
            batch_limit,
            "Truncating fetch to the most recent messages"
        );
        // Higher sequence numbers are newer.
        ids = ids.split_off(total - batch_limit);
    }

    let mut tag_counter = 4_u32;
    let mut results = Vec::with_capacity(ids.len());
    for id in &ids {
        match fetch_message(&mut tls, &mut tag_counter, id, &account.email) {
            Ok(Some(msg)) => results.push(msg),
            Ok(None) => debug!(seq = %id, "Unparseable message skipped"),
            Err(e) => warn!(seq = %id, error = %e, "Message fetch failed, continuing"),
        }
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    debug!(
        account = %redact_address(&account.email),
        fetched = results.len(),
        since = %since,
        "IMAP fetch complete"
    );
    Ok(results)
}

fn fetch_by_id_blocking(
    account: &Account,
    message_id: &str,
) -> Result<Option<EmailMessage>, MailError> {
    let mut tls = connect(account)?;

    let safe_id = message_id.replace('"', "\\\"");
    let search_resp = send_cmd(
        &mut tls,
        "A3",
        &format!("SEARCH HEADER Message-ID \"{safe_id}\""),
    )?;
    let ids = parse_search_ids(&search_resp);

    // Most recent match if the server somehow has several.
    let Some(id) = ids.last() else {
        return Ok(None);
    };

    let mut tag_counter = 4_u32;
    let result = fetch_message(&mut tls, &mut tag_counter, id, &account.email)?;

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_parsing() {
        let lines = vec![
            "* SEARCH 3 7 12\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert_eq!(parse_search_ids(&lines), vec!["3", "7", "12"]);
    }

    #[test]
    fn empty_search_response() {
        let lines = vec![
            "* SEARCH\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert!(parse_search_ids(&lines).is_empty());
    }

    #[test]
    fn search_ignores_unrelated_lines() {
        let lines = vec![
            "* 12 EXISTS\r\n".to_string(),
            "* SEARCH 5\r\n".to_string(),
            "A3 OK done\r\n".to_string(),
        ];
        assert_eq!(parse_search_ids(&lines), vec!["5"]);
    }
}
