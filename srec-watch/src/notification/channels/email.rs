//! SMTP email channel.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::NotificationChannel;
use crate::notification::{NotificationMessage, NotificationPriority};
use crate::utils::install_rustls_provider;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub enabled: bool,
    #[serde(default)]
    pub smtp_host: String,
    /// 465 for implicit TLS, 587 with `starttls`.
    #[serde(default = "default_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub starttls: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default = "default_sender_name")]
    pub from_name: String,
    #[serde(default)]
    pub to_addresses: Vec<String>,
    #[serde(default)]
    pub min_priority: NotificationPriority,
}

fn default_port() -> u16 {
    465
}

fn default_sender_name() -> String {
    "srec-watch".to_string()
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: default_port(),
            starttls: false,
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            from_name: default_sender_name(),
            to_addresses: Vec::new(),
            min_priority: NotificationPriority::Normal,
        }
    }
}

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct EmailChannel {
    config: EmailConfig,
}

impl EmailChannel {
    pub fn new(config: EmailConfig) -> Self {
        install_rustls_provider();
        Self { config }
    }

    fn build_email(&self, message: &NotificationMessage) -> Result<Message> {
        let address = |raw: &str| {
            raw.trim()
                .parse::<Address>()
                .map_err(|e| Error::config(format!("invalid email address '{raw}': {e}")))
        };

        let from = Mailbox::new(Some(self.config.from_name.clone()), address(&self.config.from_address)?);
        let mut builder = Message::builder()
            .from(from)
            .subject(message.title.clone())
            .header(ContentType::TEXT_PLAIN);
        for to in &self.config.to_addresses {
            builder = builder.to(Mailbox::new(None, address(to)?));
        }

        builder
            .body(message.body.clone())
            .map_err(|e| Error::Other(format!("failed to build email: {e}")))
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let host = self.config.smtp_host.trim();
        let builder = if self.config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        }
        .map_err(|e| Error::config(format!("invalid SMTP host '{host}': {e}")))?;

        Ok(builder
            .port(self.config.smtp_port)
            .credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.clone(),
            ))
            .timeout(Some(SMTP_TIMEOUT))
            .build())
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn channel_type(&self) -> &'static str {
        "email"
    }

    fn is_enabled(&self) -> bool {
        let c = &self.config;
        c.enabled
            && !c.smtp_host.trim().is_empty()
            && !c.username.trim().is_empty()
            && !c.password.is_empty()
            && !c.from_address.trim().is_empty()
            && !c.to_addresses.is_empty()
    }

    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        if !self.is_enabled() || message.priority() < self.config.min_priority {
            return Ok(());
        }

        let email = self.build_email(message)?;
        self.transport()?
            .send(email)
            .await
            .map_err(|e| Error::Other(format!("SMTP delivery failed: {e}")))?;

        debug!(recipients = self.config.to_addresses.len(), "Email notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EmailConfig {
        EmailConfig {
            enabled: true,
            smtp_host: "smtp.example.com".to_string(),
            username: "bot@example.com".to_string(),
            password: "secret".to_string(),
            from_address: "bot@example.com".to_string(),
            to_addresses: vec!["me@example.com".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_builds_plain_text_email() {
        let channel = EmailChannel::new(config());
        let email = channel.build_email(&NotificationMessage::stream_end("Dave")).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();

        assert!(raw.contains("Subject: Stream ended"));
        assert!(raw.contains("srec-watch <bot@example.com>"));
        assert!(raw.contains("To: me@example.com"));
        assert!(raw.contains("Dave went offline"));
    }

    #[test]
    fn test_invalid_address_is_config_error() {
        let channel = EmailChannel::new(EmailConfig {
            to_addresses: vec!["not-an-address".to_string()],
            ..config()
        });
        assert!(matches!(
            channel.build_email(&NotificationMessage::test()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_incomplete_config_is_disabled() {
        assert!(EmailChannel::new(config()).is_enabled());
        let channel = EmailChannel::new(EmailConfig {
            password: String::new(),
            ..config()
        });
        assert!(!channel.is_enabled());
        assert_eq!(EmailConfig::default().smtp_port, 465);
    }
}
