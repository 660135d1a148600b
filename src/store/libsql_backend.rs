//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    EmailStatus, LearningCandidate, ManualRule, NewCandidate, NewProcessedEmail, NewRule,
    Preference, PreferenceKind, ProcessedEmail, ProcessingRun, RunStatus,
};
use crate::store::traits::{Database, RunTotals};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_rules(&self, sql: &str) -> Result<Vec<ManualRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read rule row: {e}")))?
        {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 datetime string, defaulting to the epoch floor on
/// malformed rows rather than failing the whole query.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Convert an optional string to a libsql Value (NULL when absent).
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

fn kind_to_str(kind: PreferenceKind) -> &'static str {
    match kind {
        PreferenceKind::BlockedSender => "blocked_sender",
        PreferenceKind::BlockedCategory => "blocked_category",
        PreferenceKind::AlwaysForward => "always_forward",
    }
}

fn str_to_kind(s: &str) -> PreferenceKind {
    match s {
        "blocked_category" => PreferenceKind::BlockedCategory,
        "always_forward" => PreferenceKind::AlwaysForward,
        _ => PreferenceKind::BlockedSender,
    }
}

fn status_to_str(status: EmailStatus) -> &'static str {
    match status {
        EmailStatus::Forwarded => "forwarded",
        EmailStatus::Blocked => "blocked",
        EmailStatus::Ignored => "ignored",
        EmailStatus::Error => "error",
        EmailStatus::CommandExecuted => "command_executed",
    }
}

fn str_to_status(s: &str) -> EmailStatus {
    match s {
        "forwarded" => EmailStatus::Forwarded,
        "blocked" => EmailStatus::Blocked,
        "error" => EmailStatus::Error,
        "command_executed" => EmailStatus::CommandExecuted,
        _ => EmailStatus::Ignored,
    }
}

fn run_status_to_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Error => "error",
    }
}

fn str_to_run_status(s: &str) -> RunStatus {
    match s {
        "completed" => RunStatus::Completed,
        "error" => RunStatus::Error,
        _ => RunStatus::Running,
    }
}

/// Column order: id, email_pattern, subject_pattern, priority, purpose,
/// confidence, is_shadow_mode, match_count, created_at.
const RULE_COLUMNS: &str = "id, email_pattern, subject_pattern, priority, purpose, confidence, \
                            is_shadow_mode, match_count, created_at";

fn row_to_rule(row: &libsql::Row) -> Result<ManualRule, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("Failed to map rule row: {e}"));
    Ok(ManualRule {
        id: row.get(0).map_err(map)?,
        email_pattern: row.get(1).ok(),
        subject_pattern: row.get(2).ok(),
        priority: row.get(3).map_err(map)?,
        purpose: row.get(4).map_err(map)?,
        confidence: row.get(5).map_err(map)?,
        is_shadow_mode: row.get::<i64>(6).map_err(map)? != 0,
        match_count: row.get(7).map_err(map)?,
        created_at: parse_datetime(&row.get::<String>(8).map_err(map)?),
    })
}

/// Column order: id, email_id, subject, sender, body, received_at,
/// processed_at, status, account_email, category, amount, reason,
/// retention_expires_at.
const PROCESSED_COLUMNS: &str = "id, email_id, subject, sender, body, received_at, processed_at, \
                                 status, account_email, category, amount, reason, \
                                 retention_expires_at";

fn row_to_processed(row: &libsql::Row) -> Result<ProcessedEmail, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("Failed to map email row: {e}"));
    let amount: Option<String> = row.get(10).ok();
    Ok(ProcessedEmail {
        id: row.get(0).map_err(map)?,
        email_id: row.get(1).map_err(map)?,
        subject: row.get(2).map_err(map)?,
        sender: row.get(3).map_err(map)?,
        body: row.get(4).ok(),
        received_at: parse_datetime(&row.get::<String>(5).map_err(map)?),
        processed_at: parse_datetime(&row.get::<String>(6).map_err(map)?),
        status: str_to_status(&row.get::<String>(7).map_err(map)?),
        account_email: row.get(8).map_err(map)?,
        category: row.get(9).ok(),
        amount: amount.and_then(|a| a.parse::<Decimal>().ok()),
        reason: row.get(11).ok(),
        retention_expires_at: row
            .get::<String>(12)
            .ok()
            .map(|s| parse_datetime(&s))
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
    })
}

fn row_to_candidate(row: &libsql::Row) -> Result<LearningCandidate, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("Failed to map candidate row: {e}"));
    Ok(LearningCandidate {
        id: row.get(0).map_err(map)?,
        sender: row.get(1).map_err(map)?,
        subject_pattern: row.get(2).ok(),
        confidence: row.get(3).map_err(map)?,
        matches: row.get(4).map_err(map)?,
        example_subject: row.get(5).map_err(map)?,
        created_at: parse_datetime(&row.get::<String>(6).map_err(map)?),
    })
}

// ── Database trait ──────────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn list_rules(&self) -> Result<Vec<ManualRule>, DatabaseError> {
        self.query_rules(&format!(
            "SELECT {RULE_COLUMNS} FROM manual_rules ORDER BY priority DESC"
        ))
        .await
    }

    async fn list_active_rules(&self) -> Result<Vec<ManualRule>, DatabaseError> {
        self.query_rules(&format!(
            "SELECT {RULE_COLUMNS} FROM manual_rules WHERE is_shadow_mode = 0 \
             ORDER BY priority DESC"
        ))
        .await
    }

    async fn list_shadow_rules(&self) -> Result<Vec<ManualRule>, DatabaseError> {
        self.query_rules(&format!(
            "SELECT {RULE_COLUMNS} FROM manual_rules WHERE is_shadow_mode = 1 \
             ORDER BY priority DESC"
        ))
        .await
    }

    async fn insert_rule(&self, rule: &NewRule) -> Result<i64, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO manual_rules
                    (email_pattern, subject_pattern, priority, purpose, confidence,
                     is_shadow_mode, match_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                params![
                    opt_text(rule.email_pattern.as_deref()),
                    opt_text(rule.subject_pattern.as_deref()),
                    rule.priority,
                    rule.purpose.clone(),
                    rule.confidence,
                    rule.is_shadow_mode as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert rule: {e}")))?;
        Ok(self.conn().last_insert_rowid())
    }

    async fn delete_rule(&self, id: i64) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute("DELETE FROM manual_rules WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to delete rule: {e}")))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "manual_rule".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_rule_stats(
        &self,
        id: i64,
        match_count: i64,
        confidence: f64,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE manual_rules SET match_count = ?1, confidence = ?2 WHERE id = ?3",
                params![match_count, confidence, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to update rule stats: {e}")))?;
        Ok(())
    }

    async fn list_promotable_rules(
        &self,
        min_confidence: f64,
        min_matches: i64,
    ) -> Result<Vec<ManualRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM manual_rules
                     WHERE is_shadow_mode = 1 AND confidence >= ?1 AND match_count >= ?2"
                ),
                params![min_confidence, min_matches],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query promotable rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read rule row: {e}")))?
        {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    async fn promote_rule(&self, id: i64, purpose: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE manual_rules SET is_shadow_mode = 0, purpose = ?1 WHERE id = ?2",
                params![purpose, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to promote rule: {e}")))?;
        Ok(())
    }

    async fn list_preferences(&self) -> Result<Vec<Preference>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, item, kind, created_at FROM preferences ORDER BY id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query preferences: {e}")))?;

        let map = |e: libsql::Error| DatabaseError::Query(format!("Failed to map preference: {e}"));
        let mut prefs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read preference row: {e}")))?
        {
            prefs.push(Preference {
                id: row.get(0).map_err(map)?,
                item: row.get(1).map_err(map)?,
                kind: str_to_kind(&row.get::<String>(2).map_err(map)?),
                created_at: parse_datetime(&row.get::<String>(3).map_err(map)?),
            });
        }
        Ok(prefs)
    }

    async fn add_preference(
        &self,
        item: &str,
        kind: PreferenceKind,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO preferences (item, kind, created_at) VALUES (?1, ?2, ?3)",
                params![item, kind_to_str(kind), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to add preference: {e}")))?;

        if affected == 0 {
            debug!(item, kind = kind_to_str(kind), "Preference already exists");
            return Ok(false);
        }
        Ok(true)
    }

    async fn find_candidate(
        &self,
        sender: &str,
        subject_pattern: Option<&str>,
    ) -> Result<Option<LearningCandidate>, DatabaseError> {
        // NULL-safe comparison on the dedup key.
        let mut rows = self
            .conn()
            .query(
                "SELECT id, sender, subject_pattern, confidence, matches, example_subject, created_at
                 FROM learning_candidates
                 WHERE sender = ?1 AND subject_pattern IS ?2
                 LIMIT 1",
                params![sender, opt_text(subject_pattern)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query candidate: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read candidate row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_candidate(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_candidate(&self, candidate: &NewCandidate) -> Result<i64, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO learning_candidates
                    (sender, subject_pattern, confidence, matches, example_subject, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                params![
                    candidate.sender.clone(),
                    opt_text(candidate.subject_pattern.as_deref()),
                    candidate.confidence,
                    candidate.example_subject.clone(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert candidate: {e}")))?;
        Ok(self.conn().last_insert_rowid())
    }

    async fn bump_candidate(&self, id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE learning_candidates SET matches = matches + 1 WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to bump candidate: {e}")))?;
        Ok(())
    }

    async fn processed_email_exists(&self, email_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM processed_emails WHERE email_id = ?1 LIMIT 1",
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to check email existence: {e}")))?;

        Ok(rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read existence row: {e}")))?
            .is_some())
    }

    async fn insert_processed_email(
        &self,
        email: &NewProcessedEmail,
    ) -> Result<bool, DatabaseError> {
        // INSERT OR IGNORE rides on the email_id unique constraint so that
        // concurrent cycles cannot both record the same message.
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO processed_emails
                    (email_id, subject, sender, body, received_at, processed_at, status,
                     account_email, category, amount, reason, retention_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    email.email_id.clone(),
                    email.subject.clone(),
                    email.sender.clone(),
                    opt_text(email.body.as_deref()),
                    email.received_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    status_to_str(email.status),
                    email.account_email.clone(),
                    opt_text(email.category.as_deref()),
                    opt_text(email.amount.map(|a| a.to_string()).as_deref()),
                    opt_text(email.reason.as_deref()),
                    email.retention_expires_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert processed email: {e}")))?;

        Ok(affected > 0)
    }

    async fn get_processed_email(
        &self,
        email_id: &str,
    ) -> Result<Option<ProcessedEmail>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROCESSED_COLUMNS} FROM processed_emails WHERE email_id = ?1"),
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query processed email: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read email row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_processed(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_processed_status(
        &self,
        email_id: &str,
        status: EmailStatus,
        reason: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE processed_emails SET status = ?1, reason = ?2 WHERE email_id = ?3",
                params![status_to_str(status), opt_text(reason), email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to update email status: {e}")))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "processed_email".into(),
                id: email_id.to_string(),
            });
        }
        Ok(())
    }

    async fn clear_expired_bodies(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE processed_emails SET body = NULL
                 WHERE body IS NOT NULL AND retention_expires_at <= ?1",
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to clear expired bodies: {e}")))?;
        Ok(affected as usize)
    }

    async fn start_run(&self, check_interval_minutes: i64) -> Result<i64, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO processing_runs (started_at, status, check_interval_minutes)
                 VALUES (?1, 'running', ?2)",
                params![Utc::now().to_rfc3339(), check_interval_minutes],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to start run: {e}")))?;
        Ok(self.conn().last_insert_rowid())
    }

    async fn finish_run(
        &self,
        id: i64,
        totals: RunTotals,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE processing_runs
                 SET completed_at = ?1, emails_checked = ?2, emails_processed = ?3,
                     emails_forwarded = ?4, status = ?5, error_message = ?6
                 WHERE id = ?7",
                params![
                    Utc::now().to_rfc3339(),
                    totals.emails_checked,
                    totals.emails_processed,
                    totals.emails_forwarded,
                    run_status_to_str(status),
                    opt_text(error_message),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to finish run: {e}")))?;
        Ok(())
    }

    async fn get_run(&self, id: i64) -> Result<Option<ProcessingRun>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, started_at, completed_at, emails_checked, emails_processed,
                        emails_forwarded, status, error_message, check_interval_minutes
                 FROM processing_runs WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query run: {e}")))?;

        let map = |e: libsql::Error| DatabaseError::Query(format!("Failed to map run row: {e}"));
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read run row: {e}")))?
        {
            Some(row) => Ok(Some(ProcessingRun {
                id: row.get(0).map_err(map)?,
                started_at: parse_datetime(&row.get::<String>(1).map_err(map)?),
                completed_at: row.get::<String>(2).ok().map(|s| parse_datetime(&s)),
                emails_checked: row.get(3).map_err(map)?,
                emails_processed: row.get(4).map_err(map)?,
                emails_forwarded: row.get(5).map_err(map)?,
                status: str_to_run_status(&row.get::<String>(6).map_err(map)?),
                error_message: row.get(7).ok(),
                check_interval_minutes: row.get(8).map_err(map)?,
            })),
            None => Ok(None),
        }
    }
}
