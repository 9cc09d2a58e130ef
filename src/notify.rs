//! Confirmation token delivery.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{NotifyConfig, NotifyMethod};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the contacts of a pending reservation need to confirm it.
#[derive(Debug, Clone)]
pub struct TokenDelivery {
    pub session: Uuid,
    pub host: String,
    pub emails: Vec<String>,
    pub expires_at: DateTime<Utc>,
    /// Full confirmation link including the token.
    pub confirm_url: String,
}

impl TokenDelivery {
    pub fn new(
        confirm_url_base: &str,
        session: Uuid,
        host: &str,
        emails: &[String],
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Self {
        // Session ids and url-safe base64 tokens need no escaping.
        let confirm_url = format!("{}?session={}&token={}", confirm_url_base, session, token);
        Self {
            session,
            host: host.to_string(),
            emails: emails.to_vec(),
            expires_at,
            confirm_url,
        }
    }
}

#[async_trait]
pub trait TokenNotifier: Send + Sync {
    async fn deliver(&self, delivery: &TokenDelivery) -> Result<(), NotifyError>;
}

/// Writes the confirmation link to the log. For development setups.
pub struct LogNotifier;

#[async_trait]
impl TokenNotifier for LogNotifier {
    async fn deliver(&self, delivery: &TokenDelivery) -> Result<(), NotifyError> {
        info!(
            session = %delivery.session,
            host = %delivery.host,
            to = %delivery.emails.join(", "),
            url = %delivery.confirm_url,
            "Confirmation link"
        );
        Ok(())
    }
}

/// Hands a message to the local MTA via `sendmail -t`.
pub struct SendmailNotifier {
    sendmail_path: PathBuf,
    from: String,
}

impl SendmailNotifier {
    pub fn new(sendmail_path: PathBuf, from: String) -> Self {
        Self {
            sendmail_path,
            from,
        }
    }

    fn message(&self, delivery: &TokenDelivery) -> String {
        format!(
            "From: {from}\r\n\
             To: {to}\r\n\
             Subject: Confirm prefix reservation for {host}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             A prefix reservation was requested for router {host}.\r\n\
             \r\n\
             Open the link below before {expires} to confirm it:\r\n\
             \r\n\
             {url}\r\n\
             \r\n\
             If you did not request this, ignore this message and the\r\n\
             reservation will lapse.\r\n",
            from = self.from,
            to = delivery.emails.join(", "),
            host = delivery.host,
            expires = delivery.expires_at.format("%Y-%m-%d %H:%M UTC"),
            url = delivery.confirm_url,
        )
    }
}

#[async_trait]
impl TokenNotifier for SendmailNotifier {
    async fn deliver(&self, delivery: &TokenDelivery) -> Result<(), NotifyError> {
        debug!(command = %self.sendmail_path.display(), session = %delivery.session, "Running sendmail");

        let mut child = Command::new(&self.sendmail_path)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.message(delivery).as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            info!(session = %delivery.session, recipients = delivery.emails.len(), "Confirmation mail sent");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(NotifyError::CommandFailed(format!(
                "{} exited with {}: {}",
                self.sendmail_path.display(),
                output.status,
                stderr.trim()
            )))
        }
    }
}

/// Build the notifier selected in the configuration.
pub fn from_config(config: &NotifyConfig) -> Arc<dyn TokenNotifier> {
    match config.method {
        NotifyMethod::Log => Arc::new(LogNotifier),
        NotifyMethod::Sendmail => Arc::new(SendmailNotifier::new(
            config.sendmail_path.clone(),
            config.from.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery() -> TokenDelivery {
        TokenDelivery::new(
            "https://broker.example.org/api/v1/confirm",
            Uuid::nil(),
            "mynode",
            &["a@example.org".to_string(), "b@example.org".to_string()],
            "abc_DEF-123",
            Utc::now(),
        )
    }

    #[test]
    fn test_confirm_url() {
        let d = delivery();
        assert_eq!(
            d.confirm_url,
            "https://broker.example.org/api/v1/confirm?session=00000000-0000-0000-0000-000000000000&token=abc_DEF-123"
        );
    }

    #[test]
    fn test_sendmail_message() {
        let notifier = SendmailNotifier::new(PathBuf::from("/usr/sbin/sendmail"), "broker@example.org".to_string());
        let msg = notifier.message(&delivery());

        assert!(msg.starts_with("From: broker@example.org\r\nTo: a@example.org, b@example.org\r\n"));
        assert!(msg.contains("Subject: Confirm prefix reservation for mynode\r\n"));
        assert!(msg.contains("\r\n\r\n"));
        assert!(msg.contains("token=abc_DEF-123"));
    }

    #[tokio::test]
    async fn test_log_notifier_succeeds() {
        assert!(LogNotifier.deliver(&delivery()).await.is_ok());
    }

    #[tokio::test]
    async fn test_sendmail_missing_binary() {
        let notifier = SendmailNotifier::new(
            PathBuf::from("/nonexistent/sendmail"),
            "broker@example.org".to_string(),
        );
        assert!(matches!(
            notifier.deliver(&delivery()).await,
            Err(NotifyError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_selects_method() {
        let mut config = NotifyConfig::default();
        config.method = NotifyMethod::Log;
        assert!(from_config(&config).deliver(&delivery()).await.is_ok());
    }
}
