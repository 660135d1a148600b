//! End-to-end cycle test: fetch → classify → forward → learn → persist,
//! against an in-memory database and fake transports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;

use receipt_relay::config::RelayConfig;
use receipt_relay::error::MailError;
use receipt_relay::mail::{Account, AccountDirectory, MailFetcher, MailForwarder};
use receipt_relay::pipeline::retention::sweep_once;
use receipt_relay::pipeline::types::EmailMessage;
use receipt_relay::pipeline::ProcessingOrchestrator;
use receipt_relay::store::model::{EmailStatus, NewRule, PreferenceKind, RunStatus};
use receipt_relay::store::{Database, LibSqlBackend};

// ── Fakes ───────────────────────────────────────────────────────────

struct ScriptedFetcher {
    batches: Mutex<HashMap<String, Vec<EmailMessage>>>,
}

#[async_trait]
impl MailFetcher for ScriptedFetcher {
    async fn fetch_window(
        &self,
        account: &Account,
        _lookback_days: u32,
    ) -> Result<Vec<EmailMessage>, MailError> {
        Ok(self
            .batches
            .lock()
            .unwrap()
            .get(&account.email)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_by_id(
        &self,
        _account: &Account,
        _message_id: &str,
    ) -> Result<Option<EmailMessage>, MailError> {
        Ok(None)
    }
}

#[derive(Default)]
struct CapturingForwarder {
    forwarded: Mutex<Vec<(String, String)>>,
    notified: Mutex<Vec<String>>,
}

#[async_trait]
impl MailForwarder for CapturingForwarder {
    async fn forward(&self, email: &EmailMessage, target: &str) -> Result<(), MailError> {
        self.forwarded
            .lock()
            .unwrap()
            .push((email.message_id.clone(), target.to_string()));
        Ok(())
    }

    async fn notify(&self, _target: &str, _subject: &str, body: &str) -> Result<(), MailError> {
        self.notified.lock().unwrap().push(body.to_string());
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

fn message(id: &str, subject: &str, body: &str, sender: &str) -> EmailMessage {
    EmailMessage {
        message_id: id.into(),
        subject: subject.into(),
        body: body.into(),
        html_body: None,
        sender: sender.into(),
        date: Utc::now(),
        account_email: "primary@example.com".into(),
    }
}

struct World {
    orchestrator: ProcessingOrchestrator,
    db: Arc<dyn Database>,
    fetcher: Arc<ScriptedFetcher>,
    forwarder: Arc<CapturingForwarder>,
}

async fn world(emails: Vec<EmailMessage>) -> World {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());

    let mut accounts = AccountDirectory::default();
    accounts.push(account("primary@example.com"));
    accounts.push(account("secondary@example.com"));

    let fetcher = Arc::new(ScriptedFetcher {
        batches: Mutex::new(HashMap::from([(
            "primary@example.com".to_string(),
            emails,
        )])),
    });
    let forwarder = Arc::new(CapturingForwarder::default());

    let config = RelayConfig {
        forward_target: Some("partner@example.com".into()),
        ..Default::default()
    };

    let orchestrator = ProcessingOrchestrator::new(
        config,
        accounts,
        Arc::clone(&db),
        Arc::clone(&fetcher) as Arc<dyn MailFetcher>,
        Arc::clone(&forwarder) as Arc<dyn MailForwarder>,
    );

    World {
        orchestrator,
        db,
        fetcher,
        forwarder,
    }
}

// ── The full story ──────────────────────────────────────────────────

#[tokio::test]
async fn mixed_inbox_end_to_end() {
    let w = world(vec![
        message(
            "<order@shop>",
            "Your Order Confirmation",
            "Order #123456. Total: $50.00",
            "orders@shop.com",
        ),
        message(
            "<promo@shop>",
            "Huge Sale! 50% Off Everything!",
            "Shop now before it ends!",
            "marketing@shop.com",
        ),
        message(
            "<ship@amazon>",
            "Your package has shipped",
            "Your item is on the way. Track it here.",
            "shipping@amazon.com",
        ),
        message(
            "<ship-paid@amazon>",
            "Your package has shipped",
            "On the way. Order Total: $25.99. Payment method: Visa.",
            "shipping@amazon.com",
        ),
    ])
    .await;

    let summary = w.orchestrator.run_cycle().await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.totals.emails_checked, 4);
    assert_eq!(summary.totals.emails_processed, 4);
    assert_eq!(summary.totals.emails_forwarded, 2);

    let forwarded: Vec<String> = w
        .forwarder
        .forwarded
        .lock()
        .unwrap()
        .iter()
        .map(|(id, _)| id.clone())
        .collect();
    assert!(forwarded.contains(&"<order@shop>".to_string()));
    assert!(forwarded.contains(&"<ship-paid@amazon>".to_string()));

    let promo = w.db.get_processed_email("<promo@shop>").await.unwrap().unwrap();
    assert_eq!(promo.status, EmailStatus::Ignored);

    let shipping = w.db.get_processed_email("<ship@amazon>").await.unwrap().unwrap();
    assert_eq!(shipping.status, EmailStatus::Ignored);
    assert_eq!(shipping.category.as_deref(), Some("amazon"));

    let order = w.db.get_processed_email("<order@shop>").await.unwrap().unwrap();
    assert_eq!(order.amount, "50.00".parse().ok());
    assert_eq!(order.account_email, "primary@example.com");
}

#[tokio::test]
async fn blocked_preference_rejects_even_strong_receipts() {
    let w = world(vec![message(
        "<order@shop>",
        "Your Order Confirmation",
        "Order #123456. Total: $50.00",
        "marketing@shop.com",
    )])
    .await;

    w.db.add_preference("marketing", PreferenceKind::BlockedSender)
        .await
        .unwrap();

    let summary = w.orchestrator.run_cycle().await.unwrap();
    assert_eq!(summary.totals.emails_forwarded, 0);

    let row = w.db.get_processed_email("<order@shop>").await.unwrap().unwrap();
    assert_eq!(row.status, EmailStatus::Ignored);
    assert!(row.reason.unwrap().contains("Blocked"));
}

#[tokio::test]
async fn reprocessing_the_same_inbox_is_idempotent() {
    let w = world(vec![message(
        "<order@shop>",
        "Your Order Confirmation",
        "Order #123456. Total: $50.00",
        "orders@shop.com",
    )])
    .await;

    let first = w.orchestrator.run_cycle().await.unwrap();
    let second = w.orchestrator.run_cycle().await.unwrap();
    let third = w.orchestrator.run_cycle().await.unwrap();

    assert_eq!(first.totals.emails_forwarded, 1);
    assert_eq!(second.totals.emails_processed, 0);
    assert_eq!(third.totals.emails_processed, 0);
    assert_eq!(w.forwarder.forwarded.lock().unwrap().len(), 1);

    // Three runs were recorded regardless.
    for summary in [&first, &second, &third] {
        let run = w.db.get_run(summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }
}

#[tokio::test]
async fn shadow_rule_matures_into_active_rule_over_cycles() {
    let w = world(vec![]).await;

    w.db.insert_rule(&NewRule {
        email_pattern: Some("*@freshmart.example".into()),
        subject_pattern: None,
        priority: 10,
        purpose: "Learned from orders@freshmart.example".into(),
        confidence: 0.7,
        is_shadow_mode: true,
    })
    .await
    .unwrap();

    // Four cycles, each delivering one fresh matching email. The shadow
    // rule gains +0.05 confidence and +1 match per cycle: 0.90/4 after the
    // fourth, which crosses both thresholds (0.9 / 3).
    for i in 0..4 {
        w.fetcher.batches.lock().unwrap().insert(
            "primary@example.com".to_string(),
            vec![message(
                &format!("<fm-{i}@x>"),
                "Weekly groceries",
                "nothing receipt-like here",
                "orders@freshmart.example",
            )],
        );
        w.orchestrator.run_cycle().await.unwrap();
    }

    let active = w.db.list_active_rules().await.unwrap();
    assert_eq!(active.len(), 1);
    let rule = &active[0];
    assert!(!rule.is_shadow_mode);
    assert_eq!(rule.match_count, 4);
    assert!(rule.confidence >= 0.9);
    assert_eq!(rule.purpose, "(AUTO) Learned from orders@freshmart.example");

    // The promoted rule now forces forwarding of mail the heuristics would
    // have ignored.
    w.fetcher.batches.lock().unwrap().insert(
        "primary@example.com".to_string(),
        vec![message(
            "<fm-final@x>",
            "Weekly groceries",
            "nothing receipt-like here",
            "orders@freshmart.example",
        )],
    );
    let summary = w.orchestrator.run_cycle().await.unwrap();
    assert_eq!(summary.totals.emails_forwarded, 1);

    let row = w.db.get_processed_email("<fm-final@x>").await.unwrap().unwrap();
    assert_eq!(row.status, EmailStatus::Forwarded);
    assert!(row.reason.unwrap().starts_with("Rule:"));
}

#[tokio::test]
async fn operator_stop_command_takes_effect_next_cycle() {
    let w = world(vec![
        message(
            "<order@shop>",
            "Your Order Confirmation",
            "Order #123456. Total: $50.00",
            "orders@spamco.example",
        ),
        message(
            "<cmd@op>",
            "Re: Fwd: Your Order Confirmation",
            "STOP spamco.example",
            "partner@example.com",
        ),
    ])
    .await;

    let summary = w.orchestrator.run_cycle().await.unwrap();
    // The receipt was forwarded and the command executed in the same cycle.
    assert_eq!(summary.totals.emails_forwarded, 1);
    let cmd = w.db.get_processed_email("<cmd@op>").await.unwrap().unwrap();
    assert_eq!(cmd.status, EmailStatus::CommandExecuted);
    assert!(!w.forwarder.notified.lock().unwrap().is_empty());

    // Next cycle: a new receipt from the blocked sender stays put.
    w.fetcher.batches.lock().unwrap().insert(
        "primary@example.com".to_string(),
        vec![message(
            "<order2@shop>",
            "Your Order Confirmation",
            "Order #654321. Total: $19.99",
            "orders@spamco.example",
        )],
    );
    let summary = w.orchestrator.run_cycle().await.unwrap();
    assert_eq!(summary.totals.emails_forwarded, 0);

    let row = w.db.get_processed_email("<order2@shop>").await.unwrap().unwrap();
    assert_eq!(row.status, EmailStatus::Ignored);
}

#[tokio::test]
async fn retention_sweeper_clears_bodies_after_expiry() {
    let w = world(vec![message(
        "<order@shop>",
        "Your Order Confirmation",
        "Order #123456. Total: $50.00",
        "orders@shop.com",
    )])
    .await;

    w.orchestrator.run_cycle().await.unwrap();

    // Body stored, not yet expired: sweeping is a no-op.
    assert_eq!(sweep_once(&w.db).await, 0);
    let row = w.db.get_processed_email("<order@shop>").await.unwrap().unwrap();
    assert!(row.body.is_some());

    // Emulate the clock passing the 24h window.
    let cleared = w
        .db
        .clear_expired_bodies(Utc::now() + chrono::Duration::hours(25))
        .await
        .unwrap();
    assert_eq!(cleared, 1);
    let row = w.db.get_processed_email("<order@shop>").await.unwrap().unwrap();
    assert!(row.body.is_none());
}
