//! The `Database` trait — single async interface for all persistence.
//!
//! Covers the rule store, the preference store, learning candidates, the
//! processed-email history, and processing runs. Backends are expected to
//! enforce the `email_id` uniqueness constraint atomically (insert-or-skip)
//! so deduplication stays correct even if two cycles ever overlap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::store::model::{
    EmailStatus, LearningCandidate, ManualRule, NewCandidate, NewProcessedEmail, NewRule,
    Preference, PreferenceKind, ProcessedEmail, ProcessingRun, RunStatus,
};

/// Counters the orchestrator writes back when finalizing a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunTotals {
    pub emails_checked: i64,
    pub emails_processed: i64,
    pub emails_forwarded: i64,
}

/// Backend-agnostic persistence trait.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Rules ───────────────────────────────────────────────────────

    /// All rules, highest priority first. Order within a priority band is
    /// whatever the backend returns — callers must not rely on it.
    async fn list_rules(&self) -> Result<Vec<ManualRule>, DatabaseError>;

    /// Active (non-shadow) rules, highest priority first.
    async fn list_active_rules(&self) -> Result<Vec<ManualRule>, DatabaseError>;

    /// Shadow rules only.
    async fn list_shadow_rules(&self) -> Result<Vec<ManualRule>, DatabaseError>;

    /// Insert a rule; returns its id.
    async fn insert_rule(&self, rule: &NewRule) -> Result<i64, DatabaseError>;

    /// Delete a rule by id (explicit user action only).
    async fn delete_rule(&self, id: i64) -> Result<(), DatabaseError>;

    /// Write back a shadow rule's telemetry counters.
    async fn update_rule_stats(
        &self,
        id: i64,
        match_count: i64,
        confidence: f64,
    ) -> Result<(), DatabaseError>;

    /// Shadow rules meeting both promotion thresholds.
    async fn list_promotable_rules(
        &self,
        min_confidence: f64,
        min_matches: i64,
    ) -> Result<Vec<ManualRule>, DatabaseError>;

    /// Flip a shadow rule to active with its new purpose text.
    async fn promote_rule(&self, id: i64, purpose: &str) -> Result<(), DatabaseError>;

    // ── Preferences ─────────────────────────────────────────────────

    /// All preferences, oldest first.
    async fn list_preferences(&self) -> Result<Vec<Preference>, DatabaseError>;

    /// Add a preference. Adding an existing `(item, kind)` pair is a no-op;
    /// returns `false` in that case.
    async fn add_preference(
        &self,
        item: &str,
        kind: PreferenceKind,
    ) -> Result<bool, DatabaseError>;

    // ── Learning candidates ─────────────────────────────────────────

    /// Look up a candidate by its dedup key `(sender, subject_pattern)`.
    async fn find_candidate(
        &self,
        sender: &str,
        subject_pattern: Option<&str>,
    ) -> Result<Option<LearningCandidate>, DatabaseError>;

    /// Insert a new candidate; returns its id.
    async fn insert_candidate(&self, candidate: &NewCandidate) -> Result<i64, DatabaseError>;

    /// Increment a candidate's match counter.
    async fn bump_candidate(&self, id: i64) -> Result<(), DatabaseError>;

    // ── Processed emails ────────────────────────────────────────────

    /// Has this message id been recorded already?
    async fn processed_email_exists(&self, email_id: &str) -> Result<bool, DatabaseError>;

    /// Record a processed email. Insert-or-skip on the unique `email_id`;
    /// returns `false` when a row already existed.
    async fn insert_processed_email(
        &self,
        email: &NewProcessedEmail,
    ) -> Result<bool, DatabaseError>;

    /// Fetch a processed email by message id.
    async fn get_processed_email(
        &self,
        email_id: &str,
    ) -> Result<Option<ProcessedEmail>, DatabaseError>;

    /// Update status and reason after an explicit reprocessing action.
    async fn update_processed_status(
        &self,
        email_id: &str,
        status: EmailStatus,
        reason: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Null out stored bodies whose retention has expired as of `now`.
    /// Returns the number of rows cleared.
    async fn clear_expired_bodies(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Processing runs ─────────────────────────────────────────────

    /// Open a run row with `Running` status; returns its id.
    async fn start_run(&self, check_interval_minutes: i64) -> Result<i64, DatabaseError>;

    /// Finalize a run with its counters, terminal status, and error text.
    async fn finish_run(
        &self,
        id: i64,
        totals: RunTotals,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Fetch a run by id.
    async fn get_run(&self, id: i64) -> Result<Option<ProcessingRun>, DatabaseError>;
}
