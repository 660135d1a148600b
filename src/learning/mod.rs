//! Shadow-rule learning — rule generation, live telemetry, and promotion.
//!
//! Shadow rules run against every processed email but never influence the
//! forwarding decision. Each match bumps the rule's counters; once a rule
//! holds both promotion thresholds it becomes an active rule with an
//! `"(AUTO) "` purpose prefix. `scan_history` is the separate on-demand
//! batch job that mines the lookback window for missed receipts and files
//! them as candidates for human review.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use tracing::{info, warn};

use crate::classify::ReceiptClassifier;
use crate::error::DatabaseError;
use crate::mail::{Account, MailFetcher};
use crate::pipeline::types::{EmailMessage, redact_address};
use crate::store::Database;
use crate::store::model::NewCandidate;

/// Confidence a freshly generated rule starts with.
const INITIAL_RULE_CONFIDENCE: f64 = 0.7;

/// Bonus when a subject pattern could be derived. Applied without a clamp:
/// the sum tops out at 0.8, and later shadow increments do clamp at 1.0.
const SUBJECT_PATTERN_BONUS: f64 = 0.1;

/// Confidence added per shadow match, capped at 1.0.
const SHADOW_MATCH_INCREMENT: f64 = 0.05;

/// Subject words too generic to anchor a pattern on.
const NOISE_WORDS: &[&str] = &[
    "re:",
    "fwd:",
    "the",
    "and",
    "your",
    "order",
    "confirmation",
    "receipt",
];

/// A rule suggestion derived from a single email.
#[derive(Debug, Clone, PartialEq)]
pub struct SuggestedRule {
    pub email_pattern: String,
    pub subject_pattern: Option<String>,
    pub purpose: String,
    pub confidence: f64,
}

/// Derive a rule from one email's sender and subject.
///
/// The sender's domain becomes `*@domain`; the first subject word of at
/// least four characters outside the noise list becomes `*word*`.
pub fn suggest_rule(sender: &str, subject: &str) -> SuggestedRule {
    let sender_lower = sender.to_lowercase();
    let subject_lower = subject.to_lowercase();

    let domain_re = Regex::new(r"@([\w.-]+)").unwrap();
    let domain = domain_re
        .captures(&sender_lower)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| sender_lower.clone());

    let word_re = Regex::new(r"\w+").unwrap();
    let keyword = word_re
        .find_iter(&subject_lower)
        .map(|m| m.as_str())
        .find(|w| w.len() > 3 && !NOISE_WORDS.contains(w));

    let mut confidence = INITIAL_RULE_CONFIDENCE;
    let subject_pattern = keyword.map(|w| {
        confidence += SUBJECT_PATTERN_BONUS;
        format!("*{w}*")
    });

    SuggestedRule {
        email_pattern: format!("*@{domain}"),
        subject_pattern,
        purpose: format!("Learned from {sender}"),
        confidence,
    }
}

/// Drives shadow evaluation, promotion, and the retroactive scan.
pub struct LearningEngine {
    db: Arc<dyn Database>,
    promote_confidence: f64,
    promote_match_count: i64,
}

impl LearningEngine {
    pub fn new(db: Arc<dyn Database>, promote_confidence: f64, promote_match_count: i64) -> Self {
        Self {
            db,
            promote_confidence,
            promote_match_count,
        }
    }

    /// Evaluate every shadow rule against one email; bump counters on match.
    ///
    /// Telemetry only — nothing here feeds back into the forwarding decision.
    pub async fn run_shadow_mode(&self, email: &EmailMessage) -> Result<(), DatabaseError> {
        let sender = email.sender.to_lowercase();
        let subject = email.subject.to_lowercase();

        for rule in self.db.list_shadow_rules().await? {
            if !rule.matches(&sender, &subject) {
                continue;
            }
            let match_count = rule.match_count + 1;
            let confidence = (rule.confidence + SHADOW_MATCH_INCREMENT).min(1.0);
            self.db
                .update_rule_stats(rule.id, match_count, confidence)
                .await?;
        }

        Ok(())
    }

    /// Promote every shadow rule that holds both thresholds.
    /// Returns the number of rules promoted.
    pub async fn auto_promote_rules(&self) -> Result<usize, DatabaseError> {
        let candidates = self
            .db
            .list_promotable_rules(self.promote_confidence, self.promote_match_count)
            .await?;

        let promoted = candidates.len();
        for rule in candidates {
            let purpose = format!("(AUTO) {}", rule.purpose);
            self.db.promote_rule(rule.id, &purpose).await?;
            info!(
                rule_id = rule.id,
                email_pattern = rule.email_pattern.as_deref().unwrap_or("-"),
                subject_pattern = rule.subject_pattern.as_deref().unwrap_or("-"),
                "Auto-promoted rule"
            );
        }

        Ok(promoted)
    }

    /// Re-fetch the last `days` of mail and file missed receipts as
    /// learning candidates. Returns the count of newly created candidates.
    ///
    /// Runs the classifier without store overrides; anything already in the
    /// processed history is skipped. Candidates deduplicate on
    /// `(sender, subject_pattern)` — repeats bump the match counter instead.
    pub async fn scan_history(
        &self,
        fetcher: &dyn MailFetcher,
        accounts: &[Account],
        classifier: &ReceiptClassifier,
        days: u32,
    ) -> usize {
        info!(days, accounts = accounts.len(), "Starting retroactive scan");

        if accounts.is_empty() {
            warn!("No email accounts configured, nothing to scan");
            return 0;
        }

        let mut new_candidates = 0usize;
        // Guard against the same message arriving on two accounts in one scan.
        let mut seen: HashSet<String> = HashSet::new();

        for account in accounts {
            let fetched = match fetcher.fetch_window(account, days).await {
                Ok(emails) => emails,
                Err(e) => {
                    warn!(
                        account = %redact_address(&account.email),
                        error = %e,
                        "Scan fetch failed, skipping account"
                    );
                    continue;
                }
            };

            info!(
                account = %redact_address(&account.email),
                fetched = fetched.len(),
                "Scanning account history"
            );

            for email in &fetched {
                if !seen.insert(email.message_id.clone()) {
                    continue;
                }
                match self.consider_email(email, classifier).await {
                    Ok(true) => new_candidates += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, "Candidate bookkeeping failed, continuing scan");
                    }
                }
            }
        }

        info!(new_candidates, "Retroactive scan complete");
        new_candidates
    }

    /// Check one historical email; returns `Ok(true)` when a new candidate
    /// was created.
    async fn consider_email(
        &self,
        email: &EmailMessage,
        classifier: &ReceiptClassifier,
    ) -> Result<bool, DatabaseError> {
        if self.db.processed_email_exists(&email.message_id).await? {
            return Ok(false);
        }

        if !classifier.is_receipt(email) {
            return Ok(false);
        }

        let suggestion = suggest_rule(&email.sender, &email.subject);

        match self
            .db
            .find_candidate(&email.sender, suggestion.subject_pattern.as_deref())
            .await?
        {
            Some(existing) => {
                self.db.bump_candidate(existing.id).await?;
                Ok(false)
            }
            None => {
                self.db
                    .insert_candidate(&NewCandidate {
                        sender: email.sender.clone(),
                        subject_pattern: suggestion.subject_pattern,
                        confidence: suggestion.confidence,
                        example_subject: email.subject.clone(),
                    })
                    .await?;
                Ok(true)
            }
        }
    }
}
