//! Outgoing email.
//!
//! Delivery goes through a Resend-compatible HTTP API when an API key is
//! configured, otherwise messages are only logged. Handlers never wait on
//! delivery: [`dispatch`] spawns the send and logs the outcome.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode as HttpStatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";
const SITE_NAME: &str = "Harvest For Good";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("failed to build mail client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("mail transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("mail provider rejected message ({status}): {body}")]
    Rejected { status: HttpStatusCode, body: String },
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError>;
}

pub struct ResendMailer {
    client: reqwest::Client,
    api_key: String,
}

impl ResendMailer {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, MailError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(MailError::Client)?;
        Ok(Self {
            client,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        let response = self
            .client
            .post(RESEND_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&email)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected { status, body });
        }

        let receipt: Value = response.json().await.unwrap_or(Value::Null);
        let id = receipt_id(&receipt);
        tracing::info!(to = ?email.to, id, "email accepted by provider");
        Ok(())
    }
}

/// Provider message id from a send receipt, empty when absent.
fn receipt_id(receipt: &Value) -> &str {
    receipt
        .get("id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
}

/// Development mailer: writes the envelope to the log and drops the body.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        tracing::info!(to = ?email.to, subject = %email.subject, "email not sent (no mail provider configured)");
        Ok(())
    }
}

/// Picks the provider-backed mailer when an API key is configured.
pub fn mailer_from_config(config: &Config) -> Result<Arc<dyn Mailer>, MailError> {
    match &config.resend_api_key {
        Some(key) => Ok(Arc::new(ResendMailer::new(key.clone(), config.mail_timeout)?)),
        None => Ok(Arc::new(LogMailer)),
    }
}

/// Sends in the background. Failures are logged and otherwise ignored.
pub fn dispatch(mailer: &Arc<dyn Mailer>, email: OutgoingEmail) {
    let mailer = Arc::clone(mailer);
    tokio::spawn(async move {
        let subject = email.subject.clone();
        if let Err(error) = mailer.send(email).await {
            tracing::error!(error = %error, subject = %subject, "failed to send email");
        }
    });
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn message(config: &Config, to: &str, subject: String, body: String) -> OutgoingEmail {
    OutgoingEmail {
        from: config.default_from_email.clone(),
        to: vec![to.to_string()],
        subject,
        html: format!("<html><body>{body}</body></html>"),
        reply_to: None,
    }
}

pub fn welcome_email(config: &Config, to: &str, username: &str) -> OutgoingEmail {
    message(
        config,
        to,
        format!("Welcome to {SITE_NAME}!"),
        format!(
            "<h2>Welcome to {SITE_NAME}, {}!</h2>\
             <p>Thank you for joining our community.</p>\
             <p>Get started by exploring our research papers and forum discussions.</p>\
             <p>Best regards,<br>The {SITE_NAME} Team</p>",
            escape_html(username)
        ),
    )
}

pub fn verification_email(config: &Config, to: &str, username: &str, link: &str) -> OutgoingEmail {
    message(
        config,
        to,
        format!("Verify your email - {SITE_NAME}"),
        format!(
            "<h2>Hello {},</h2>\
             <p>Please confirm your email address by following the link below:</p>\
             <p><a href=\"{link}\">Verify Email</a></p>\
             <p>If you did not create an account, please ignore this email.</p>",
            escape_html(username)
        ),
    )
}

pub fn password_reset_email(config: &Config, to: &str, link: &str) -> OutgoingEmail {
    message(
        config,
        to,
        format!("Reset Your Password - {SITE_NAME}"),
        format!(
            "<h2>Password Reset Request</h2>\
             <p>You requested to reset your password for {SITE_NAME}.</p>\
             <p><a href=\"{link}\">Reset Password</a></p>\
             <p>If you didn't request this, please ignore this email.</p>\
             <p>This link will expire in 24 hours.</p>"
        ),
    )
}

pub fn contact_email(
    config: &Config,
    name: &str,
    email: &str,
    subject: &str,
    body: &str,
) -> OutgoingEmail {
    let mut outgoing = message(
        config,
        &config.admin_email,
        format!("Contact Form: {subject}"),
        format!(
            "<h2>New Contact Form Submission</h2>\
             <p><strong>From:</strong> {} ({})</p>\
             <p><strong>Subject:</strong> {}</p>\
             <p><strong>Message:</strong></p><p>{}</p>",
            escape_html(name),
            escape_html(email),
            escape_html(subject),
            escape_html(body).replace('\n', "<br>")
        ),
    );
    outgoing.reply_to = Some(email.to_string());
    outgoing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_email_goes_to_admin_with_reply_to() {
        let config = Config::default();
        let email = contact_email(
            &config,
            "Rosa",
            "rosa@example.org",
            "Collaboration",
            "<b>hello</b>\nthere",
        );
        assert_eq!(email.to, vec![config.admin_email.clone()]);
        assert_eq!(email.reply_to.as_deref(), Some("rosa@example.org"));
        assert!(email.html.contains("&lt;b&gt;hello&lt;/b&gt;<br>there"));
    }

    #[test]
    fn receipt_id_tolerates_missing_field() {
        assert_eq!(receipt_id(&serde_json::json!({"id": "49a3999c"})), "49a3999c");
        assert_eq!(receipt_id(&serde_json::json!({"id": 7})), "");
        assert_eq!(receipt_id(&Value::Null), "");
    }

    #[test]
    fn reply_to_is_omitted_from_payload_when_absent() {
        let config = Config::default();
        let email = welcome_email(&config, "new@example.org", "newbie");
        let payload = serde_json::to_value(&email).expect("serialises");
        assert!(payload.get("reply_to").is_none());
        assert_eq!(payload["from"], config.default_from_email);
    }

    #[tokio::test]
    async fn log_mailer_accepts_everything() {
        let config = Config::default();
        let email = password_reset_email(&config, "a@example.org", "http://x/reset");
        assert!(LogMailer.send(email).await.is_ok());
    }
}
