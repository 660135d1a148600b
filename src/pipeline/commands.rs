//! Operator commands — mail from the forwarding target steers preferences.
//!
//! The operator replies to a forwarded receipt (or mails the relay
//! directly) with a command in the body. The first recognized command line
//! wins; one command per email.

use std::sync::Arc;

use tracing::{info, warn};

use crate::mail::MailForwarder;
use crate::pipeline::types::EmailMessage;
use crate::store::Database;
use crate::store::model::PreferenceKind;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// `STOP <item>` — block a sender or category.
    Stop(String),
    /// `MORE <item>` — always forward a sender or category.
    More(String),
    /// `SETTINGS` — reply with the current preference list.
    Settings,
}

/// Scan a message body for the first recognized command line.
pub fn parse_command(body: &str) -> Option<OperatorCommand> {
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else { continue };
        let args = parts.collect::<Vec<_>>().join(" ");

        match cmd.to_uppercase().as_str() {
            "STOP" if !args.is_empty() => return Some(OperatorCommand::Stop(args)),
            "MORE" if !args.is_empty() => return Some(OperatorCommand::More(args)),
            "SETTINGS" => return Some(OperatorCommand::Settings),
            _ => {}
        }
    }
    None
}

/// Executes operator commands against the preference store.
pub struct CommandInterpreter {
    db: Arc<dyn Database>,
    forwarder: Arc<dyn MailForwarder>,
    /// The operator's address — both command source and confirmation target.
    operator_address: String,
}

impl CommandInterpreter {
    pub fn new(
        db: Arc<dyn Database>,
        forwarder: Arc<dyn MailForwarder>,
        operator_address: String,
    ) -> Self {
        Self {
            db,
            forwarder,
            operator_address: operator_address.to_lowercase(),
        }
    }

    /// Is this email from the operator?
    pub fn is_command_sender(&self, email: &EmailMessage) -> bool {
        !self.operator_address.is_empty()
            && email.sender.to_lowercase().contains(&self.operator_address)
    }

    /// Parse and execute the command in this email, if any.
    /// Returns `true` when a command was executed.
    pub async fn handle(&self, email: &EmailMessage) -> bool {
        let Some(command) = parse_command(&email.body) else {
            return false;
        };

        match command {
            OperatorCommand::Stop(item) => {
                if self.add_preference(&item, PreferenceKind::BlockedSender).await {
                    self.confirm(&format!("Blocked sender/category: {item}")).await;
                }
                true
            }
            OperatorCommand::More(item) => {
                if self.add_preference(&item, PreferenceKind::AlwaysForward).await {
                    self.confirm(&format!("Always forwarding: {item}")).await;
                }
                true
            }
            OperatorCommand::Settings => {
                self.send_settings_summary().await;
                true
            }
        }
    }

    /// Add a preference; duplicate pairs are a logged no-op, never an error.
    async fn add_preference(&self, item: &str, kind: PreferenceKind) -> bool {
        match self.db.add_preference(item, kind).await {
            Ok(true) => {
                info!(item, ?kind, "Preference added");
                true
            }
            Ok(false) => {
                info!(item, ?kind, "Preference already exists");
                true
            }
            Err(e) => {
                warn!(item, error = %e, "Failed to add preference");
                false
            }
        }
    }

    async fn confirm(&self, message: &str) {
        if let Err(e) = self
            .forwarder
            .notify(&self.operator_address, "Receipt Relay command confirmed", message)
            .await
        {
            warn!(error = %e, "Failed to send command confirmation");
        }
    }

    async fn send_settings_summary(&self) {
        let summary = match self.db.list_preferences().await {
            Ok(prefs) if prefs.is_empty() => "No active preferences.".to_string(),
            Ok(prefs) => {
                let mut lines = vec!["Current preferences:".to_string()];
                for p in prefs {
                    lines.push(format!("- {:?}: {}", p.kind, p.item));
                }
                lines.join("\n")
            }
            Err(e) => {
                warn!(error = %e, "Failed to list preferences for summary");
                return;
            }
        };
        self.confirm(&summary).await;
    }
}
