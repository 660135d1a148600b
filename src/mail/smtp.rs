//! SMTP forwarder — lettre transport plus the forwarded-mail template.
//!
//! Forwarded receipts are wrapped in an HTML header block that reminds the
//! operator of the reply commands (STOP / MORE / SETTINGS) and shows when
//! the original arrived. Notifications are plain text.

use async_trait::async_trait;
use lettre::message::{MultiPart, SinglePart, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::MailError;
use crate::mail::MailForwarder;
use crate::pipeline::types::{EmailMessage, redact_address};

/// SMTP-backed `MailForwarder`.
#[derive(Clone)]
pub struct SmtpForwarder {
    smtp_host: String,
    smtp_port: u16,
    username: String,
    password: SecretString,
    from_address: String,
}

impl SmtpForwarder {
    pub fn new(
        smtp_host: String,
        smtp_port: u16,
        username: String,
        password: SecretString,
        from_address: String,
    ) -> Self {
        Self {
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
        }
    }

    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_SMTP_HOST` is not set (forwarding disabled).
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("EMAIL_SMTP_HOST").ok()?;
        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self::new(smtp_host, smtp_port, username, password, from_address))
    }

    /// Send a message over a fresh SMTP connection (blocking).
    fn send_blocking(&self, message: &Message) -> Result<(), MailError> {
        let creds = Credentials::new(
            self.username.clone(),
            self.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&self.smtp_host)
            .map_err(|e| MailError::Send(format!("SMTP relay error: {e}")))?
            .port(self.smtp_port)
            .credentials(creds)
            .build();

        transport
            .send(message)
            .map_err(|e| MailError::Send(format!("SMTP send failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl MailForwarder for SmtpForwarder {
    async fn forward(&self, email: &EmailMessage, target: &str) -> Result<(), MailError> {
        let subject = format!("Fwd: {}", email.subject);
        let html = render_forward_html(email);
        let text = render_forward_text(email);

        let message = Message::builder()
            .from(parse_mailbox(&self.from_address)?)
            .to(parse_mailbox(target)?)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html),
                    ),
            )
            .map_err(|e| MailError::Build(e.to_string()))?;

        let this = self.clone();
        tokio::task::spawn_blocking(move || this.send_blocking(&message))
            .await
            .map_err(|e| MailError::Send(format!("send task panicked: {e}")))??;

        info!(
            target = %redact_address(target),
            sender = %redact_address(&email.sender),
            "Forwarded email"
        );
        Ok(())
    }

    async fn notify(&self, target: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let message = Message::builder()
            .from(parse_mailbox(&self.from_address)?)
            .to(parse_mailbox(target)?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| MailError::Build(e.to_string()))?;

        let this = self.clone();
        tokio::task::spawn_blocking(move || this.send_blocking(&message))
            .await
            .map_err(|e| MailError::Send(format!("send task panicked: {e}")))??;

        info!(target = %redact_address(target), "Sent notification");
        Ok(())
    }
}

fn parse_mailbox(addr: &str) -> Result<lettre::message::Mailbox, MailError> {
    addr.parse()
        .map_err(|e| MailError::Build(format!("Invalid address: {e}")))
}

/// Short display name for the action header: the sender's domain base.
fn simple_name(sender: &str) -> &str {
    let domain = sender.split_once('@').map_or(sender, |(_, d)| d);
    domain.split('.').next().unwrap_or(domain)
}

/// HTML wrapper around the forwarded body.
fn render_forward_html(email: &EmailMessage) -> String {
    let name = simple_name(&email.sender);
    let received = email.date.format("%Y-%m-%d %H:%M UTC");
    let body = email
        .html_body
        .clone()
        .unwrap_or_else(|| format!("<pre>{}</pre>", escape_html(&email.body)));

    format!(
        r#"<html>
  <body style="font-family: sans-serif; background-color: #f4f4f5; margin: 0; padding: 20px;">
    <div style="background-color: #ffffff; padding: 16px; border-radius: 8px; margin-bottom: 20px; border: 1px solid #e4e4e7;">
      <div style="font-weight: bold; color: #18181b; margin-bottom: 8px; font-size: 16px;">
        Receipt Relay: {name}
      </div>
      <div style="font-size: 13px; color: #52525b;">
        Reply <b>STOP {name}</b> to block this sender,
        <b>MORE {name}</b> to always forward it,
        or <b>SETTINGS</b> for the current preference list.
      </div>
    </div>
    <div style="font-size: 12px; color: #71717a; margin-bottom: 12px;">
      Received: {received}
    </div>
    <hr style="border: 0; border-top: 1px solid #e5e7eb; margin: 20px 0;">
    <div style="font-family: sans-serif;">
      {body}
    </div>
  </body>
</html>
"#
    )
}

/// Plain-text alternative for clients that skip HTML.
fn render_forward_text(email: &EmailMessage) -> String {
    format!(
        "Receipt Relay: {name}\n\
         Reply STOP {name} to block, MORE {name} to always forward, SETTINGS for preferences.\n\
         Received: {received}\n\
         ----------------------------------------\n\
         {body}\n",
        name = simple_name(&email.sender),
        received = email.date.format("%Y-%m-%d %H:%M UTC"),
        body = email.body,
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn email(subject: &str, body: &str, sender: &str) -> EmailMessage {
        EmailMessage {
            message_id: "<t@test>".into(),
            subject: subject.into(),
            body: body.into(),
            html_body: None,
            sender: sender.into(),
            date: Utc::now(),
            account_email: "me@example.com".into(),
        }
    }

    #[test]
    fn simple_name_is_domain_base() {
        assert_eq!(simple_name("orders@amazon.com"), "amazon");
        assert_eq!(simple_name("billing@pay.stripe.com"), "pay");
        assert_eq!(simple_name("weird-no-at"), "weird-no-at");
    }

    #[test]
    fn forward_html_carries_command_hints() {
        let html = render_forward_html(&email("Receipt", "Total $5.00", "orders@amazon.com"));
        assert!(html.contains("STOP amazon"));
        assert!(html.contains("MORE amazon"));
        assert!(html.contains("SETTINGS"));
        assert!(html.contains("Total $5.00"));
    }

    #[test]
    fn forward_html_prefers_original_html() {
        let mut msg = email("Receipt", "plain", "x@shop.com");
        msg.html_body = Some("<table><tr><td>$9.99</td></tr></table>".into());
        let html = render_forward_html(&msg);
        assert!(html.contains("<table>"));
        assert!(!html.contains("<pre>plain</pre>"));
    }

    #[test]
    fn plain_body_is_escaped() {
        let html = render_forward_html(&email("x", "1 < 2 & 3 > 2", "x@shop.com"));
        assert!(html.contains("1 &lt; 2 &amp; 3 &gt; 2"));
    }

    #[test]
    fn forward_text_includes_body() {
        let text = render_forward_text(&email("Receipt", "Total $5.00", "orders@amazon.com"));
        assert!(text.contains("Receipt Relay: amazon"));
        assert!(text.contains("Total $5.00"));
    }
}
