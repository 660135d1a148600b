//! Store-aware classification — layers rules and preferences over the
//! heuristics.
//!
//! Precedence, first applicable wins:
//! 1. Highest-priority matching active rule → forward
//! 2. Always-forward preference (substring in sender or subject) → forward
//! 3. Blocked sender/category preference → reject
//! 4. Heuristic `is_receipt`
//!
//! Any store error is logged and resolution falls through to step 4 — a
//! database hiccup must never stall the pipeline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classify::heuristics::ReceiptClassifier;
use crate::pipeline::types::EmailMessage;
use crate::store::Database;
use crate::store::model::PreferenceKind;

/// Which resolution step produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    ManualRule,
    AlwaysForward,
    BlockedPreference,
    Heuristics,
}

/// Final accept/reject decision for one email.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Forward this email?
    pub forward: bool,
    /// Which layer decided.
    pub source: DecisionSource,
    /// Human-readable explanation, recorded on the processed row.
    pub reason: String,
    /// The rule that fired, when `source` is `ManualRule`.
    pub matched_rule: Option<i64>,
}

/// One step in a diagnostic resolution trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub step: String,
    pub fired: bool,
    pub detail: String,
}

/// Full diagnostic trail for debugging UIs. Production paths use only
/// `Resolution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionTrace {
    pub subject: String,
    pub sender: String,
    pub steps: Vec<TraceStep>,
    pub forward: bool,
    pub decided_by: DecisionSource,
}

/// Combines the rule store, the preference store, and the heuristics into
/// one decision.
pub struct ClassificationResolver {
    classifier: ReceiptClassifier,
    db: Arc<dyn Database>,
}

impl ClassificationResolver {
    pub fn new(classifier: ReceiptClassifier, db: Arc<dyn Database>) -> Self {
        Self { classifier, db }
    }

    pub fn classifier(&self) -> &ReceiptClassifier {
        &self.classifier
    }

    /// Resolve one email. Infallible: store errors degrade to heuristics.
    pub async fn resolve(&self, email: &EmailMessage) -> Resolution {
        let sender = email.sender.to_lowercase();
        let subject = email.subject.to_lowercase();

        match self.check_overrides(&sender, &subject).await {
            Ok(Some(resolution)) => return resolution,
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Rule lookup failed, falling back to heuristics");
            }
        }

        let forward = self.classifier.is_receipt(email);
        Resolution {
            forward,
            source: DecisionSource::Heuristics,
            reason: if forward {
                "Detected as receipt".into()
            } else {
                "Not a receipt".into()
            },
            matched_rule: None,
        }
    }

    /// Steps 1–3: manual rules, then always-forward, then blocks.
    async fn check_overrides(
        &self,
        sender: &str,
        subject: &str,
    ) -> Result<Option<Resolution>, crate::error::DatabaseError> {
        // Active rules arrive highest-priority first; the first match wins.
        // Order within a priority band is not defined.
        for rule in self.db.list_active_rules().await? {
            if rule.matches(sender, subject) {
                debug!(rule_id = rule.id, purpose = %rule.purpose, "Manual rule match");
                return Ok(Some(Resolution {
                    forward: true,
                    source: DecisionSource::ManualRule,
                    reason: format!("Rule: {}", rule.purpose),
                    matched_rule: Some(rule.id),
                }));
            }
        }

        let preferences = self.db.list_preferences().await?;

        for pref in preferences
            .iter()
            .filter(|p| p.kind == PreferenceKind::AlwaysForward)
        {
            let item = pref.item.to_lowercase();
            if sender.contains(&item) || subject.contains(&item) {
                debug!(item = %pref.item, "Always-forward preference match");
                return Ok(Some(Resolution {
                    forward: true,
                    source: DecisionSource::AlwaysForward,
                    reason: format!("Always forward: {}", pref.item),
                    matched_rule: None,
                }));
            }
        }

        for pref in preferences
            .iter()
            .filter(|p| p.kind != PreferenceKind::AlwaysForward)
        {
            let item = pref.item.to_lowercase();
            if sender.contains(&item) || subject.contains(&item) {
                debug!(item = %pref.item, "Blocked preference match");
                return Ok(Some(Resolution {
                    forward: false,
                    source: DecisionSource::BlockedPreference,
                    reason: format!("Blocked: {}", pref.item),
                    matched_rule: None,
                }));
            }
        }

        Ok(None)
    }

    /// Diagnostic variant: records which step fired and why.
    pub async fn resolve_traced(&self, email: &EmailMessage) -> ResolutionTrace {
        let sender = email.sender.to_lowercase();
        let subject = email.subject.to_lowercase();
        let mut steps = Vec::new();

        let override_result = self.check_overrides(&sender, &subject).await;
        match &override_result {
            Ok(Some(resolution)) => {
                steps.push(TraceStep {
                    step: source_label(resolution.source).into(),
                    fired: true,
                    detail: resolution.reason.clone(),
                });
                return ResolutionTrace {
                    subject,
                    sender,
                    steps,
                    forward: resolution.forward,
                    decided_by: resolution.source,
                };
            }
            Ok(None) => {
                steps.push(TraceStep {
                    step: "overrides".into(),
                    fired: false,
                    detail: "no rule or preference matched".into(),
                });
            }
            Err(e) => {
                steps.push(TraceStep {
                    step: "overrides".into(),
                    fired: false,
                    detail: format!("store error, skipped: {e}"),
                });
            }
        }

        let body = email.body.to_lowercase();
        let checks: [(&str, bool, bool); 5] = [
            (
                "reply_or_forward",
                self.classifier.is_reply_or_forward(&subject, &sender),
                false,
            ),
            (
                "strong_receipt_indicators",
                self.classifier.has_strong_receipt_indicators(&subject, &body),
                true,
            ),
            (
                "promotional",
                self.classifier.is_promotional_email(&subject, &body, &sender),
                false,
            ),
            (
                "shipping_notification",
                self.classifier.is_shipping_notification(&subject, &body, &sender),
                false,
            ),
            (
                "transactional_score",
                self.classifier.transactional_score(&subject, &body, &sender) >= 3,
                true,
            ),
        ];

        for (name, fired, forwards) in checks {
            steps.push(TraceStep {
                step: name.into(),
                fired,
                detail: String::new(),
            });
            if fired {
                return ResolutionTrace {
                    subject,
                    sender,
                    steps,
                    forward: forwards,
                    decided_by: DecisionSource::Heuristics,
                };
            }
        }

        let known = self.classifier.is_known_receipt_sender(&sender)
            && self.classifier.has_transaction_confirmation(&subject, &body);
        steps.push(TraceStep {
            step: "known_sender_with_confirmation".into(),
            fired: known,
            detail: String::new(),
        });

        ResolutionTrace {
            subject,
            sender,
            steps,
            forward: known,
            decided_by: DecisionSource::Heuristics,
        }
    }
}

fn source_label(source: DecisionSource) -> &'static str {
    match source {
        DecisionSource::ManualRule => "manual_rule",
        DecisionSource::AlwaysForward => "always_forward",
        DecisionSource::BlockedPreference => "blocked_preference",
        DecisionSource::Heuristics => "heuristics",
    }
}
