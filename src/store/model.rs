//! Persisted entities — rules, preferences, candidates, history, runs.
//!
//! Status and type fields are closed enums, not free strings; the string
//! forms live in the libSQL backend only.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::classify::pattern::glob_match;

// ── Manual rules ────────────────────────────────────────────────────

/// A forwarding rule, authored by the user or learned by the relay.
///
/// A rule needs at least one pattern to be usable; a rule with both patterns
/// must match both to fire. Shadow rules are evaluated against live traffic
/// for telemetry only and never influence forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualRule {
    pub id: i64,
    /// Shell-glob pattern matched against the sender address.
    pub email_pattern: Option<String>,
    /// Shell-glob pattern matched against the subject.
    pub subject_pattern: Option<String>,
    /// Higher priority wins among matching rules. Ties are unordered.
    pub priority: i64,
    pub purpose: String,
    pub confidence: f64,
    pub is_shadow_mode: bool,
    pub match_count: i64,
    pub created_at: DateTime<Utc>,
}

impl ManualRule {
    /// A rule with no pattern at all can never fire.
    pub fn is_usable(&self) -> bool {
        self.email_pattern.is_some() || self.subject_pattern.is_some()
    }

    /// AND of the present patterns; an absent pattern is vacuously true.
    pub fn matches(&self, sender: &str, subject: &str) -> bool {
        if !self.is_usable() {
            return false;
        }
        if let Some(ref pattern) = self.email_pattern
            && !glob_match(pattern, sender)
        {
            return false;
        }
        if let Some(ref pattern) = self.subject_pattern
            && !glob_match(pattern, subject)
        {
            return false;
        }
        true
    }
}

/// Fields for creating a rule (id and timestamps assigned by the store).
#[derive(Debug, Clone)]
pub struct NewRule {
    pub email_pattern: Option<String>,
    pub subject_pattern: Option<String>,
    pub priority: i64,
    pub purpose: String,
    pub confidence: f64,
    pub is_shadow_mode: bool,
}

/// Default priority for rules created outside the priority UI.
pub const DEFAULT_RULE_PRIORITY: i64 = 10;

// ── Preferences ─────────────────────────────────────────────────────

/// What a preference item means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreferenceKind {
    BlockedSender,
    BlockedCategory,
    AlwaysForward,
}

/// A user-declared allow/block item, matched as a case-insensitive substring
/// against sender and subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub id: i64,
    pub item: String,
    pub kind: PreferenceKind,
    pub created_at: DateTime<Utc>,
}

// ── Learning candidates ─────────────────────────────────────────────

/// A provisional pattern awaiting human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningCandidate {
    pub id: i64,
    pub sender: String,
    pub subject_pattern: Option<String>,
    pub confidence: f64,
    pub matches: i64,
    pub example_subject: String,
    pub created_at: DateTime<Utc>,
}

/// Fields for creating a candidate.
#[derive(Debug, Clone)]
pub struct NewCandidate {
    pub sender: String,
    pub subject_pattern: Option<String>,
    pub confidence: f64,
    pub example_subject: String,
}

// ── Processed emails ────────────────────────────────────────────────

/// Terminal status of one processed email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailStatus {
    Forwarded,
    Blocked,
    Ignored,
    Error,
    CommandExecuted,
}

/// One row per unique message id — the deduplication record.
#[derive(Debug, Clone)]
pub struct ProcessedEmail {
    pub id: i64,
    /// Message-ID header; unique, enforced by the store.
    pub email_id: String,
    pub subject: String,
    pub sender: String,
    /// Plain-text body, kept until `retention_expires_at`.
    pub body: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub status: EmailStatus,
    pub account_email: String,
    pub category: Option<String>,
    pub amount: Option<Decimal>,
    pub reason: Option<String>,
    pub retention_expires_at: DateTime<Utc>,
}

/// Fields for recording a processed email.
#[derive(Debug, Clone)]
pub struct NewProcessedEmail {
    pub email_id: String,
    pub subject: String,
    pub sender: String,
    pub body: Option<String>,
    pub received_at: DateTime<Utc>,
    pub status: EmailStatus,
    pub account_email: String,
    pub category: Option<String>,
    pub amount: Option<Decimal>,
    pub reason: Option<String>,
    pub retention_expires_at: DateTime<Utc>,
}

// ── Processing runs ─────────────────────────────────────────────────

/// Cycle state: `Running` until the orchestrator finalizes the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

/// One row per orchestrator cycle.
#[derive(Debug, Clone)]
pub struct ProcessingRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub emails_checked: i64,
    pub emails_processed: i64,
    pub emails_forwarded: i64,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub check_interval_minutes: i64,
}
