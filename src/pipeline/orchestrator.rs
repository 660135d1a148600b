//! Processing orchestrator — one fetch/classify/forward cycle per tick.
//!
//! Cycle state machine: `running → completed | error`.
//! 1. Open a `ProcessingRun` row.
//! 2. Fetch recent mail for every account; per-account failures are
//!    accumulated, never fatal.
//! 3. Abort the cycle (`error`) when no forwarding target is configured.
//! 4. Per email: dedup → operator commands → resolution → forward/ignore →
//!    shadow telemetry → persist with a retention expiry.
//! 5. Finalize the run and promote ripe shadow rules, once per cycle.
//!
//! A cycle guard skips a tick when the previous cycle is still running, so
//! overlapping executions cannot race the dedup check. The persistence step
//! additionally rides on the store's unique-constraint insert-or-skip.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classify::{ClassificationResolver, ReceiptClassifier};
use crate::config::RelayConfig;
use crate::error::PipelineError;
use crate::learning::LearningEngine;
use crate::mail::{AccountDirectory, MailFetcher, MailForwarder};
use crate::pipeline::commands::CommandInterpreter;
use crate::pipeline::types::{EmailMessage, redact_address};
use crate::store::model::{EmailStatus, NewProcessedEmail, RunStatus};
use crate::store::{Database, RunTotals};

/// Outcome of one cycle, for logging and tests.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub run_id: i64,
    pub totals: RunTotals,
    pub status: RunStatus,
}

/// The per-cycle driver.
pub struct ProcessingOrchestrator {
    config: RelayConfig,
    accounts: AccountDirectory,
    db: Arc<dyn Database>,
    fetcher: Arc<dyn MailFetcher>,
    forwarder: Arc<dyn MailForwarder>,
    resolver: ClassificationResolver,
    learning: LearningEngine,
    commands: CommandInterpreter,
    /// Held for the duration of a cycle; a busy guard skips the tick.
    cycle_guard: tokio::sync::Mutex<()>,
}

impl ProcessingOrchestrator {
    pub fn new(
        config: RelayConfig,
        accounts: AccountDirectory,
        db: Arc<dyn Database>,
        fetcher: Arc<dyn MailFetcher>,
        forwarder: Arc<dyn MailForwarder>,
    ) -> Self {
        let mut self_addresses = accounts.addresses();
        self_addresses.extend(config.self_addresses.iter().cloned());

        let classifier = ReceiptClassifier::new(self_addresses, config.forward_target.clone());
        let resolver = ClassificationResolver::new(classifier, Arc::clone(&db));
        let learning = LearningEngine::new(
            Arc::clone(&db),
            config.promote_confidence,
            config.promote_match_count,
        );
        let commands = CommandInterpreter::new(
            Arc::clone(&db),
            Arc::clone(&forwarder),
            config.forward_target.clone().unwrap_or_default(),
        );

        Self {
            config,
            accounts,
            db,
            fetcher,
            forwarder,
            resolver,
            learning,
            commands,
            cycle_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn learning(&self) -> &LearningEngine {
        &self.learning
    }

    pub fn resolver(&self) -> &ClassificationResolver {
        &self.resolver
    }

    /// Run one cycle. Returns `None` when a previous cycle is still running
    /// or the run row could not even be opened.
    pub async fn run_cycle(&self) -> Option<CycleSummary> {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            warn!("Previous cycle still running, skipping this tick");
            return None;
        };

        let run_id = match self
            .db
            .start_run(self.config.poll_interval_minutes as i64)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "Could not open a processing run");
                return None;
            }
        };

        let mut totals = RunTotals::default();
        let mut soft_errors: Vec<String> = Vec::new();

        let (status, error_message) = match self.process_cycle(&mut totals, &mut soft_errors).await
        {
            Ok(()) => {
                // Promotion runs once per cycle, after every email.
                match self.learning.auto_promote_rules().await {
                    Ok(promoted) if promoted > 0 => info!(promoted, "Shadow rules promoted"),
                    Ok(_) => {}
                    Err(e) => soft_errors.push(format!("promotion failed: {e}")),
                }

                if soft_errors.is_empty() {
                    (RunStatus::Completed, None)
                } else {
                    (RunStatus::Completed, Some(soft_errors.join("; ")))
                }
            }
            Err(e) => (RunStatus::Error, Some(e.to_string())),
        };

        if let Err(e) = self
            .db
            .finish_run(run_id, totals, status, error_message.as_deref())
            .await
        {
            error!(run_id, error = %e, "Failed to finalize run");
        }

        info!(
            run_id,
            checked = totals.emails_checked,
            processed = totals.emails_processed,
            forwarded = totals.emails_forwarded,
            status = ?status,
            "Cycle finished"
        );

        Some(CycleSummary {
            run_id,
            totals,
            status,
        })
    }

    /// Steps 2–4: fetch, target check, per-email processing.
    async fn process_cycle(
        &self,
        totals: &mut RunTotals,
        soft_errors: &mut Vec<String>,
    ) -> Result<(), PipelineError> {
        let accounts = self.accounts.list_active();
        let fetches = futures::future::join_all(
            accounts
                .iter()
                .map(|account| self.fetcher.fetch_window(account, self.config.lookback_days)),
        )
        .await;

        let mut emails: Vec<EmailMessage> = Vec::new();
        for (account, result) in accounts.iter().zip(fetches) {
            match result {
                Ok(batch) => {
                    debug!(
                        account = %redact_address(&account.email),
                        fetched = batch.len(),
                        "Account fetch complete"
                    );
                    emails.extend(batch);
                }
                Err(e) => {
                    warn!(
                        account = %redact_address(&account.email),
                        error = %e,
                        "Account fetch failed, continuing with other accounts"
                    );
                    soft_errors.push(format!("{}: {e}", redact_address(&account.email)));
                }
            }
        }

        totals.emails_checked = emails.len() as i64;

        let target = self
            .config
            .forward_target
            .as_deref()
            .ok_or(PipelineError::MissingForwardTarget)?;

        for email in &emails {
            self.process_email(email, target, totals, soft_errors).await;
        }

        Ok(())
    }

    /// Step 4 for a single email. Never fails the cycle; every failure ends
    /// up in the email's status/reason or in the run's soft errors.
    async fn process_email(
        &self,
        email: &EmailMessage,
        target: &str,
        totals: &mut RunTotals,
        soft_errors: &mut Vec<String>,
    ) {
        // 4a. Dedup. A store error here is not fatal: the insert below is
        // itself insert-or-skip on the unique message id.
        match self.db.processed_email_exists(&email.message_id).await {
            Ok(true) => {
                debug!(message_id = %email.message_id, "Already processed, skipping");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Dedup lookup failed, relying on insert-or-skip");
            }
        }

        // 4b. Operator commands bypass classification entirely.
        let (status, reason) = if self.commands.is_command_sender(email) {
            if self.commands.handle(email).await {
                (EmailStatus::CommandExecuted, "Operator command".to_string())
            } else {
                (EmailStatus::Ignored, "Operator mail without command".to_string())
            }
        } else {
            // 4c. Resolve and forward.
            let resolution = self.resolver.resolve(email).await;
            if resolution.forward {
                match self.forwarder.forward(email, target).await {
                    Ok(()) => (EmailStatus::Forwarded, resolution.reason),
                    Err(e) => {
                        warn!(
                            message_id = %email.message_id,
                            error = %e,
                            "Forwarding failed"
                        );
                        (EmailStatus::Error, format!("Forward failed: {e}"))
                    }
                }
            } else {
                (EmailStatus::Ignored, resolution.reason)
            }
        };

        // 4d. Shadow telemetry — observes every email, affects nothing.
        if let Err(e) = self.learning.run_shadow_mode(email).await {
            warn!(error = %e, "Shadow evaluation failed");
        }

        // 4e. Persist with a retention expiry for the body sweeper.
        let classifier = self.resolver.classifier();
        let record = NewProcessedEmail {
            email_id: email.message_id.clone(),
            subject: email.subject.clone(),
            sender: email.sender.clone(),
            body: Some(email.body.clone()),
            received_at: email.date,
            status,
            account_email: email.account_email.clone(),
            category: Some(classifier.categorize(email).to_string()),
            amount: classifier.extract_amount(email),
            reason: Some(reason),
            retention_expires_at: Utc::now() + chrono::Duration::hours(self.config.retention_hours),
        };

        match self.db.insert_processed_email(&record).await {
            Ok(true) => {
                totals.emails_processed += 1;
                if status == EmailStatus::Forwarded {
                    totals.emails_forwarded += 1;
                }
            }
            Ok(false) => {
                debug!(message_id = %email.message_id, "Lost insert race, row already present");
            }
            Err(e) => {
                warn!(message_id = %email.message_id, error = %e, "Failed to persist email");
                soft_errors.push(format!("persist {}: {e}", email.message_id));
            }
        }
    }
}

/// Spawn the periodic cycle task.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop after
/// the current tick.
pub fn spawn_cycle_task(
    orchestrator: Arc<ProcessingOrchestrator>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Processing loop started");
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Processing loop shutting down");
                return;
            }

            orchestrator.run_cycle().await;
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::error::MailError;
    use crate::mail::Account;
    use crate::store::LibSqlBackend;
    use crate::store::model::NewRule;
    use secrecy::SecretString;

    // ── Test doubles ────────────────────────────────────────────────

    /// Fetcher serving canned batches per account address.
    #[derive(Default)]
    struct FakeFetcher {
        batches: HashMap<String, Vec<EmailMessage>>,
        failing_accounts: Vec<String>,
    }

    #[async_trait]
    impl MailFetcher for FakeFetcher {
        async fn fetch_window(
            &self,
            account: &Account,
            _lookback_days: u32,
        ) -> Result<Vec<EmailMessage>, MailError> {
            if self.failing_accounts.contains(&account.email) {
                return Err(MailError::Fetch("connection refused".into()));
            }
            Ok(self.batches.get(&account.email).cloned().unwrap_or_default())
        }

        async fn fetch_by_id(
            &self,
            _account: &Account,
            _message_id: &str,
        ) -> Result<Option<EmailMessage>, MailError> {
            Ok(None)
        }
    }

    /// Forwarder that records forwards and can be told to fail.
    #[derive(Default)]
    struct FakeForwarder {
        forwarded: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl MailForwarder for FakeForwarder {
        async fn forward(&self, email: &EmailMessage, _target: &str) -> Result<(), MailError> {
            if self.fail {
                return Err(MailError::Send("smtp down".into()));
            }
            self.forwarded.lock().unwrap().push(email.message_id.clone());
            Ok(())
        }

        async fn notify(&self, _t: &str, _s: &str, _b: &str) -> Result<(), MailError> {
            Ok(())
        }
    }

    fn account(addr: &str) -> Account {
        Account {
            email: addr.into(),
            password: SecretString::from("pw"),
            imap_host: "imap.example.com".into(),
            imap_port: 993,
        }
    }

    fn email(id: &str, subject: &str, body: &str, sender: &str, account: &str) -> EmailMessage {
        EmailMessage {
            message_id: id.into(),
            subject: subject.into(),
            body: body.into(),
            html_body: None,
            sender: sender.into(),
            date: Utc::now(),
            account_email: account.into(),
        }
    }

    fn receipt(id: &str, account: &str) -> EmailMessage {
        email(
            id,
            "Your Order Confirmation",
            "Order #123456. Total: $50.00",
            "orders@shop.com",
            account,
        )
    }

    fn chatter(id: &str, account: &str) -> EmailMessage {
        email(id, "Lunch?", "tacos at noon?", "friend@mail.com", account)
    }

    struct Harness {
        orchestrator: ProcessingOrchestrator,
        db: Arc<dyn Database>,
        forwarder: Arc<FakeForwarder>,
    }

    async fn harness(
        batches: HashMap<String, Vec<EmailMessage>>,
        failing_accounts: Vec<String>,
        forward_target: Option<&str>,
        forwarder_fails: bool,
    ) -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());

        let mut accounts = AccountDirectory::default();
        for addr in batches.keys().chain(failing_accounts.iter()) {
            accounts.push(account(addr));
        }

        let fetcher = Arc::new(FakeFetcher {
            batches,
            failing_accounts,
        });
        let forwarder = Arc::new(FakeForwarder {
            fail: forwarder_fails,
            ..Default::default()
        });

        let config = RelayConfig {
            forward_target: forward_target.map(String::from),
            ..Default::default()
        };

        let orchestrator = ProcessingOrchestrator::new(
            config,
            accounts,
            Arc::clone(&db),
            fetcher,
            Arc::clone(&forwarder) as Arc<dyn MailForwarder>,
        );

        Harness {
            orchestrator,
            db,
            forwarder,
        }
    }

    fn one_account(emails: Vec<EmailMessage>) -> HashMap<String, Vec<EmailMessage>> {
        HashMap::from([("me@example.com".to_string(), emails)])
    }

    // ── Cycles ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn full_cycle_forwards_receipts_and_ignores_chatter() {
        let h = harness(
            one_account(vec![
                receipt("<r1@x>", "me@example.com"),
                chatter("<c1@x>", "me@example.com"),
            ]),
            vec![],
            Some("partner@example.com"),
            false,
        )
        .await;

        let summary = h.orchestrator.run_cycle().await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.totals.emails_checked, 2);
        assert_eq!(summary.totals.emails_processed, 2);
        assert_eq!(summary.totals.emails_forwarded, 1);

        let forwarded = h.db.get_processed_email("<r1@x>").await.unwrap().unwrap();
        assert_eq!(forwarded.status, EmailStatus::Forwarded);
        assert_eq!(forwarded.reason.as_deref(), Some("Detected as receipt"));
        assert_eq!(forwarded.amount, "50.00".parse().ok());
        assert!(forwarded.retention_expires_at > Utc::now());

        let ignored = h.db.get_processed_email("<c1@x>").await.unwrap().unwrap();
        assert_eq!(ignored.status, EmailStatus::Ignored);

        assert_eq!(h.forwarder.forwarded.lock().unwrap().as_slice(), ["<r1@x>"]);

        let run = h.db.get_run(summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert!(run.error_message.is_none());
    }

    #[tokio::test]
    async fn missing_forward_target_aborts_cycle() {
        let h = harness(
            one_account(vec![receipt("<r1@x>", "me@example.com")]),
            vec![],
            None,
            false,
        )
        .await;

        let summary = h.orchestrator.run_cycle().await.unwrap();
        assert_eq!(summary.status, RunStatus::Error);
        // Nothing was processed.
        assert_eq!(summary.totals.emails_processed, 0);
        assert!(h.db.get_processed_email("<r1@x>").await.unwrap().is_none());

        let run = h.db.get_run(summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.error_message.unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn second_cycle_deduplicates() {
        let h = harness(
            one_account(vec![receipt("<r1@x>", "me@example.com")]),
            vec![],
            Some("partner@example.com"),
            false,
        )
        .await;

        let first = h.orchestrator.run_cycle().await.unwrap();
        assert_eq!(first.totals.emails_processed, 1);

        // Same batch served again: checked but neither reprocessed nor
        // re-forwarded.
        let second = h.orchestrator.run_cycle().await.unwrap();
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.totals.emails_checked, 1);
        assert_eq!(second.totals.emails_processed, 0);
        assert_eq!(second.totals.emails_forwarded, 0);

        assert_eq!(h.forwarder.forwarded.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_within_one_batch_processed_once() {
        let h = harness(
            one_account(vec![
                receipt("<dup@x>", "me@example.com"),
                receipt("<dup@x>", "me@example.com"),
            ]),
            vec![],
            Some("partner@example.com"),
            false,
        )
        .await;

        let summary = h.orchestrator.run_cycle().await.unwrap();
        assert_eq!(summary.totals.emails_checked, 2);
        assert_eq!(summary.totals.emails_processed, 1);
    }

    #[tokio::test]
    async fn account_failure_does_not_abort_others() {
        let mut batches = one_account(vec![receipt("<r1@x>", "me@example.com")]);
        batches.insert("second@example.com".into(), vec![]);

        let h = harness(
            batches,
            vec!["broken@example.com".into()],
            Some("partner@example.com"),
            false,
        )
        .await;

        let summary = h.orchestrator.run_cycle().await.unwrap();
        // Healthy accounts were processed, the failure is recorded.
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.totals.emails_processed, 1);

        let run = h.db.get_run(summary.run_id).await.unwrap().unwrap();
        assert!(run.error_message.unwrap().contains("b***@example.com"));
    }

    #[tokio::test]
    async fn forward_failure_marks_email_error() {
        let h = harness(
            one_account(vec![receipt("<r1@x>", "me@example.com")]),
            vec![],
            Some("partner@example.com"),
            true,
        )
        .await;

        let summary = h.orchestrator.run_cycle().await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.totals.emails_processed, 1);
        assert_eq!(summary.totals.emails_forwarded, 0);

        let row = h.db.get_processed_email("<r1@x>").await.unwrap().unwrap();
        assert_eq!(row.status, EmailStatus::Error);
        assert!(row.reason.unwrap().contains("Forward failed"));
    }

    #[tokio::test]
    async fn operator_command_email_is_executed_not_classified() {
        let cmd = email(
            "<cmd@x>",
            "Re: Fwd: receipt",
            "STOP marketing",
            "partner@example.com",
            "me@example.com",
        );
        let h = harness(
            one_account(vec![cmd]),
            vec![],
            Some("partner@example.com"),
            false,
        )
        .await;

        let summary = h.orchestrator.run_cycle().await.unwrap();
        assert_eq!(summary.totals.emails_forwarded, 0);

        let row = h.db.get_processed_email("<cmd@x>").await.unwrap().unwrap();
        assert_eq!(row.status, EmailStatus::CommandExecuted);
        assert_eq!(h.db.list_preferences().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn operator_mail_without_command_is_ignored() {
        let note = email(
            "<note@x>",
            "Re: Fwd: receipt",
            "thanks, got it!",
            "partner@example.com",
            "me@example.com",
        );
        let h = harness(
            one_account(vec![note]),
            vec![],
            Some("partner@example.com"),
            false,
        )
        .await;

        h.orchestrator.run_cycle().await.unwrap();
        let row = h.db.get_processed_email("<note@x>").await.unwrap().unwrap();
        assert_eq!(row.status, EmailStatus::Ignored);
    }

    #[tokio::test]
    async fn cycle_runs_shadow_mode_and_promotes() {
        let h = harness(
            one_account(vec![receipt("<r1@x>", "me@example.com")]),
            vec![],
            Some("partner@example.com"),
            false,
        )
        .await;

        // A shadow rule two matches away from both thresholds.
        let rule_id = h
            .db
            .insert_rule(&NewRule {
                email_pattern: Some("*@shop.com".into()),
                subject_pattern: None,
                priority: 10,
                purpose: "learned".into(),
                confidence: 0.85,
                is_shadow_mode: true,
            })
            .await
            .unwrap();
        h.db.update_rule_stats(rule_id, 2, 0.85).await.unwrap();

        h.orchestrator.run_cycle().await.unwrap();

        // 3 matches, confidence 0.90 → promoted at cycle end.
        let active = h.db.list_active_rules().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].match_count, 3);
        assert!(active[0].purpose.starts_with("(AUTO) "));
        assert!(h.db.list_shadow_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn busy_guard_skips_overlapping_cycle() {
        let h = harness(
            one_account(vec![]),
            vec![],
            Some("partner@example.com"),
            false,
        )
        .await;

        let _held = h.orchestrator.cycle_guard.lock().await;
        assert!(h.orchestrator.run_cycle().await.is_none());
    }

    #[tokio::test]
    async fn empty_inbox_completes_cleanly() {
        let h = harness(
            one_account(vec![]),
            vec![],
            Some("partner@example.com"),
            false,
        )
        .await;

        let summary = h.orchestrator.run_cycle().await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.totals.emails_checked, 0);
    }
}
