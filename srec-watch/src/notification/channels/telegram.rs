//! Telegram Bot API notification channel.
//!
//! Sends messages via `POST /bot<token>/sendMessage` and honours the
//! `parameters.retry_after` field of 429 responses.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::NotificationChannel;
use crate::notification::{NotificationMessage, NotificationPriority};
use crate::utils::install_rustls_provider;
use crate::{Error, Result};

/// Maximum number of retries for rate-limited requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Telegram channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// Target chat ID (user, group, or channel).
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub min_priority: NotificationPriority,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: default_api_base(),
            min_priority: NotificationPriority::Normal,
        }
    }
}

/// Telegram notification channel.
pub struct TelegramChannel {
    config: TelegramConfig,
    client: Client,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Self {
        install_rustls_provider();
        Self {
            config,
            client: Client::new(),
        }
    }

    fn build_text(&self, message: &NotificationMessage) -> String {
        let icon = match message.priority() {
            NotificationPriority::High => "\u{26a0}\u{fe0f}",
            _ => "\u{1f514}",
        };
        let text = format!(
            "{icon} <b>{}</b>\n\n{}",
            escape_html(&message.title),
            escape_html(&message.body)
        );
        truncate_message(&text, TELEGRAM_MESSAGE_LIMIT)
    }

    async fn send_with_retry(&self, payload: &serde_json::Value) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.config.api_base, self.config.bot_token);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let response = self.client.post(&url).json(payload).send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(());
            }

            if status.as_u16() == 429 {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                let retry_after = body
                    .get("parameters")
                    .and_then(|p| p.get("retry_after"))
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_secs);

                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    return Err(Error::Other(format!(
                        "Telegram rate limit exceeded after {} retries",
                        MAX_RATE_LIMIT_RETRIES
                    )));
                }

                // Spread retries a little so several alerts do not line up.
                let jitter = Duration::from_millis((rand::random::<f64>() * 250.0) as u64);
                let wait = retry_after.unwrap_or(Duration::from_secs(1)) + jitter;
                debug!(
                    "Telegram rate limited (429), waiting {:?} before retry (attempt {}/{})",
                    wait, attempts, MAX_RATE_LIMIT_RETRIES
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            warn!("Telegram sendMessage failed: {} - {}", status, body);
            return Err(Error::Other(format!(
                "Telegram sendMessage failed: {} - {}",
                status, body
            )));
        }
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn channel_type(&self) -> &'static str {
        "telegram"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.bot_token.is_empty() && !self.config.chat_id.is_empty()
    }

    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        if !self.is_enabled() || message.priority() < self.config.min_priority {
            return Ok(());
        }

        let payload = json!({
            "chat_id": self.config.chat_id,
            "text": self.build_text(message),
            "parse_mode": "HTML",
        });
        self.send_with_retry(&payload).await?;

        debug!("Telegram notification sent: {}", message.kind);
        Ok(())
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Truncate a message to fit within the Telegram character limit.
fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "\n\n[truncated]";
    let budget = limit - suffix.len();
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telegram_enabled_requires_target() {
        assert!(!TelegramChannel::new(TelegramConfig::default()).is_enabled());

        let channel = TelegramChannel::new(TelegramConfig {
            enabled: true,
            bot_token: "123:ABC".to_string(),
            chat_id: "456".to_string(),
            ..Default::default()
        });
        assert!(channel.is_enabled());
    }

    #[test]
    fn test_build_text_escapes_html() {
        let channel = TelegramChannel::new(TelegramConfig::default());
        let message = NotificationMessage::stream_start("A<B>", Some("x & y"));
        let text = channel.build_text(&message);
        assert!(text.contains("<b>Stream started</b>"));
        assert!(text.contains("A&lt;B&gt; is live: x &amp; y"));
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("hello", 100), "hello");

        let long: String = "a".repeat(5000);
        let truncated = truncate_message(&long, TELEGRAM_MESSAGE_LIMIT);
        assert!(truncated.chars().count() <= TELEGRAM_MESSAGE_LIMIT);
        assert!(truncated.ends_with("[truncated]"));
    }
}
