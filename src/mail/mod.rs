//! Mail transport — fetcher/forwarder traits and the account directory.
//!
//! The processing core only sees these traits; the IMAP and SMTP adapters
//! are pure I/O with no classification logic.

pub mod imap;
pub mod smtp;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use tracing::warn;

use crate::error::MailError;
use crate::pipeline::types::EmailMessage;

pub use imap::ImapFetcher;
pub use smtp::SmtpForwarder;

// ── Traits ──────────────────────────────────────────────────────────

/// Fetches mail for a monitored account.
#[async_trait]
pub trait MailFetcher: Send + Sync {
    /// Fetch messages received in the last `lookback_days` days.
    async fn fetch_window(
        &self,
        account: &Account,
        lookback_days: u32,
    ) -> Result<Vec<EmailMessage>, MailError>;

    /// Fetch a single message by its Message-ID header, if still present.
    async fn fetch_by_id(
        &self,
        account: &Account,
        message_id: &str,
    ) -> Result<Option<EmailMessage>, MailError>;
}

/// Sends mail out — forwarded receipts and operator notifications.
#[async_trait]
pub trait MailForwarder: Send + Sync {
    /// Forward an email to the target address, wrapped in the relay's
    /// presentation template.
    async fn forward(&self, email: &EmailMessage, target: &str) -> Result<(), MailError>;

    /// Send a plain notification (command confirmations, settings summaries).
    async fn notify(&self, target: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

// ── Accounts ────────────────────────────────────────────────────────

/// One monitored mailbox.
#[derive(Debug, Clone)]
pub struct Account {
    pub email: String,
    pub password: SecretString,
    pub imap_host: String,
    pub imap_port: u16,
}

/// JSON shape of one entry in `EMAIL_ACCOUNTS`.
#[derive(Debug, Deserialize)]
struct AccountEntry {
    email: String,
    password: String,
    #[serde(default = "default_imap_host")]
    imap_host: String,
    #[serde(default = "default_imap_port")]
    imap_port: u16,
}

fn default_imap_host() -> String {
    "imap.gmail.com".to_string()
}

fn default_imap_port() -> u16 {
    993
}

/// The configured set of monitored accounts.
#[derive(Debug, Clone, Default)]
pub struct AccountDirectory {
    accounts: Vec<Account>,
}

impl AccountDirectory {
    /// Build the directory from environment variables.
    ///
    /// `EMAIL_ACCOUNTS` holds a JSON array of account objects. A legacy
    /// single-account setup via `EMAIL_USERNAME`/`EMAIL_PASSWORD`/
    /// `EMAIL_IMAP_HOST` is folded in when not already present. Accounts
    /// deduplicate on address, case-insensitively.
    pub fn from_env() -> Self {
        let mut directory = Self::default();

        if let Ok(json) = std::env::var("EMAIL_ACCOUNTS") {
            match serde_json::from_str::<Vec<AccountEntry>>(&json) {
                Ok(entries) => {
                    for entry in entries {
                        directory.push(Account {
                            email: entry.email,
                            password: SecretString::from(entry.password),
                            imap_host: entry.imap_host,
                            imap_port: entry.imap_port,
                        });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to parse EMAIL_ACCOUNTS, ignoring");
                }
            }
        }

        if let (Ok(user), Ok(pass)) = (
            std::env::var("EMAIL_USERNAME"),
            std::env::var("EMAIL_PASSWORD"),
        ) && !user.is_empty()
        {
            directory.push(Account {
                email: user,
                password: SecretString::from(pass),
                imap_host: std::env::var("EMAIL_IMAP_HOST")
                    .unwrap_or_else(|_| default_imap_host()),
                imap_port: std::env::var("EMAIL_IMAP_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(993),
            });
        }

        directory
    }

    /// Add an account unless its address is already present.
    pub fn push(&mut self, account: Account) {
        let exists = self
            .accounts
            .iter()
            .any(|a| a.email.eq_ignore_ascii_case(&account.email));
        if !exists {
            self.accounts.push(account);
        }
    }

    /// All active accounts.
    pub fn list_active(&self) -> &[Account] {
        &self.accounts
    }

    /// Lower-cased addresses of every monitored account.
    pub fn addresses(&self) -> Vec<String> {
        self.accounts.iter().map(|a| a.email.to_lowercase()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(email: &str) -> Account {
        Account {
            email: email.into(),
            password: SecretString::from("pw"),
            imap_host: "imap.example.com".into(),
            imap_port: 993,
        }
    }

    #[test]
    fn directory_deduplicates_by_address() {
        let mut dir = AccountDirectory::default();
        dir.push(account("me@example.com"));
        dir.push(account("ME@Example.COM"));
        dir.push(account("other@example.com"));
        assert_eq!(dir.list_active().len(), 2);
    }

    #[test]
    fn addresses_are_lowercased() {
        let mut dir = AccountDirectory::default();
        dir.push(account("Me@Example.COM"));
        assert_eq!(dir.addresses(), vec!["me@example.com".to_string()]);
    }

    #[test]
    fn account_entry_json_defaults() {
        let entries: Vec<AccountEntry> =
            serde_json::from_str(r#"[{"email": "a@b.com", "password": "pw"}]"#).unwrap();
        assert_eq!(entries[0].imap_host, "imap.gmail.com");
        assert_eq!(entries[0].imap_port, 993);
    }

    #[test]
    fn password_debug_is_redacted() {
        let a = account("me@example.com");
        let dbg = format!("{a:?}");
        assert!(!dbg.contains("pw"), "debug output must not leak passwords: {dbg}");
    }
}
