//! Bark (iOS push) channel.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::NotificationChannel;
use crate::notification::{NotificationMessage, NotificationPriority};
use crate::utils::install_rustls_provider;
use crate::{Error, Result};

/// How aggressively the device surfaces the push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum BarkLevel {
    #[default]
    Active,
    TimeSensitive,
    Passive,
    Critical,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BarkConfig {
    pub enabled: bool,
    /// Push URL including the device key, e.g. `https://api.day.app/<key>`.
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub level: BarkLevel,
    #[serde(default)]
    pub sound: Option<String>,
    #[serde(default)]
    pub min_priority: NotificationPriority,
}

pub struct BarkChannel {
    config: BarkConfig,
    client: Client,
}

impl BarkChannel {
    pub fn new(config: BarkConfig) -> Self {
        install_rustls_provider();
        Self {
            config,
            client: Client::new(),
        }
    }

    fn build_payload(&self, message: &NotificationMessage) -> serde_json::Value {
        let mut payload = json!({
            "title": message.title,
            "body": message.body,
            "level": self.config.level.to_string(),
        });
        if let Some(sound) = self.config.sound.as_deref().filter(|s| !s.is_empty()) {
            payload["sound"] = json!(sound);
        }
        payload
    }
}

#[async_trait]
impl NotificationChannel for BarkChannel {
    fn channel_type(&self) -> &'static str {
        "bark"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.server_url.trim().is_empty()
    }

    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        if !self.is_enabled() || message.priority() < self.config.min_priority {
            return Ok(());
        }

        let response = self
            .client
            .post(self.config.server_url.trim_end_matches('/'))
            .json(&self.build_payload(message))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!("Bark push failed: {status} - {body}")));
        }

        debug!(level = %self.config.level, "Bark notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_level_and_sound() {
        let channel = BarkChannel::new(BarkConfig {
            enabled: true,
            server_url: "https://api.day.app/key".to_string(),
            level: BarkLevel::TimeSensitive,
            sound: Some("minuet".to_string()),
            ..Default::default()
        });
        let payload = channel.build_payload(&NotificationMessage::stream_end("Carol"));
        assert_eq!(payload["level"], "timeSensitive");
        assert_eq!(payload["sound"], "minuet");
        assert_eq!(payload["body"], "Carol went offline");
    }

    #[test]
    fn test_level_from_config() {
        let config: BarkConfig =
            serde_json::from_str(r#"{"enabled": true, "server_url": "https://api.day.app/k", "level": "passive"}"#)
                .unwrap();
        assert_eq!(config.level, BarkLevel::Passive);
        let payload = BarkChannel::new(config).build_payload(&NotificationMessage::test());
        assert!(payload.get("sound").is_none());
    }
}
