//! Shared types for the processing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A fetched email, normalized to one shape for every component.
///
/// Mail adapters convert their native format into this struct; nothing
/// downstream ever touches raw headers or MIME parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Message-ID header — the deduplication key.
    pub message_id: String,
    /// Subject line (empty if the header was missing).
    pub subject: String,
    /// Plain-text body. Derived from the HTML part when no text part exists.
    pub body: String,
    /// Raw HTML body, kept for forwarding presentation.
    pub html_body: Option<String>,
    /// Sender address.
    pub sender: String,
    /// When the message was received (Date header, or fetch time).
    pub date: DateTime<Utc>,
    /// The monitored account this message arrived on.
    pub account_email: String,
}

impl EmailMessage {
    /// Parse raw RFC 822 bytes into an `EmailMessage`.
    ///
    /// Returns `None` when the bytes are not parseable as a message at all.
    pub fn from_rfc822(raw: &[u8], account_email: &str) -> Option<Self> {
        let parsed = mail_parser::MessageParser::default().parse(raw)?;

        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into());

        let subject = parsed.subject().unwrap_or("").to_string();

        let html_body = parsed.body_html(0).map(|h| h.to_string());
        let body = parsed
            .body_text(0)
            .map(|t| t.to_string())
            .or_else(|| html_body.as_deref().map(strip_html))
            .unwrap_or_default();

        let date = parsed
            .date()
            .and_then(|d| {
                chrono::NaiveDate::from_ymd_opt(d.year as i32, u32::from(d.month), u32::from(d.day))
                    .and_then(|date| {
                        date.and_hms_opt(
                            u32::from(d.hour),
                            u32::from(d.minute),
                            u32::from(d.second),
                        )
                    })
                    .map(|n| n.and_utc())
            })
            .unwrap_or_else(Utc::now);

        let message_id = parsed
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

        Some(Self {
            message_id,
            subject,
            body,
            html_body,
            sender,
            date,
            account_email: account_email.to_string(),
        })
    }
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Redact a mail address for logging: keep the first character and the domain.
///
/// `orders@amazon.com` → `o***@amazon.com`. Structured logs never carry the
/// full mailbox of a monitored account.
pub fn redact_address(addr: &str) -> String {
    match addr.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().unwrap_or('?');
            format!("{first}***@{domain}")
        }
        None => "***".to_string(),
    }
}
