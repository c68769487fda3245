//! ntfy notification channel.
//!
//! Publishes JSON messages to the server root, which lets titles carry
//! non-ASCII text without header encoding.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::NotificationChannel;
use crate::notification::{NotificationMessage, NotificationPriority};
use crate::utils::install_rustls_provider;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtfyConfig {
    pub enabled: bool,
    #[serde(default = "default_server")]
    pub server_url: String,
    #[serde(default)]
    pub topic: String,
    /// Access token for protected topics.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Adds an "Open" view action pointing here.
    #[serde(default)]
    pub action_url: Option<String>,
    /// Also forward the message to this address.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub min_priority: NotificationPriority,
}

fn default_server() -> String {
    "https://ntfy.sh".to_string()
}

impl Default for NtfyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: default_server(),
            topic: String::new(),
            token: None,
            tags: Vec::new(),
            action_url: None,
            email: None,
            min_priority: NotificationPriority::Normal,
        }
    }
}

pub struct NtfyChannel {
    config: NtfyConfig,
    client: Client,
}

impl NtfyChannel {
    pub fn new(config: NtfyConfig) -> Self {
        install_rustls_provider();
        Self {
            config,
            client: Client::new(),
        }
    }

    fn build_payload(&self, message: &NotificationMessage) -> serde_json::Value {
        // ntfy priorities run 1 (min) to 5 (max).
        let priority = match message.priority() {
            NotificationPriority::Low => 2,
            NotificationPriority::Normal => 3,
            NotificationPriority::High => 4,
        };
        let mut payload = json!({
            "topic": self.config.topic,
            "title": message.title,
            "message": message.body,
            "priority": priority,
            "tags": self.config.tags,
        });
        if let Some(url) = self.config.action_url.as_deref().filter(|u| !u.is_empty()) {
            payload["actions"] = json!([{ "action": "view", "label": "Open", "url": url }]);
        }
        if let Some(email) = self.config.email.as_deref().filter(|e| !e.is_empty()) {
            payload["email"] = json!(email);
        }
        payload
    }
}

#[async_trait]
impl NotificationChannel for NtfyChannel {
    fn channel_type(&self) -> &'static str {
        "ntfy"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.topic.is_empty() && !self.config.server_url.is_empty()
    }

    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        if !self.is_enabled() || message.priority() < self.config.min_priority {
            return Ok(());
        }

        let mut request = self
            .client
            .post(self.config.server_url.trim_end_matches('/'))
            .json(&self.build_payload(message));
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!("ntfy publish failed: {status} - {body}")));
        }

        debug!(topic = %self.config.topic, "ntfy notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_maps_priority() {
        let channel = NtfyChannel::new(NtfyConfig {
            enabled: true,
            topic: "streams".to_string(),
            tags: vec!["tv".to_string()],
            ..Default::default()
        });
        let payload = channel.build_payload(&NotificationMessage::disk_low(0.5, 1.0));
        assert_eq!(payload["topic"], "streams");
        assert_eq!(payload["priority"], 4);
        assert_eq!(payload["tags"][0], "tv");
        assert!(payload.get("actions").is_none());
        assert!(payload.get("email").is_none());
    }

    #[test]
    fn test_payload_action_and_email() {
        let channel = NtfyChannel::new(NtfyConfig {
            enabled: true,
            topic: "streams".to_string(),
            action_url: Some("https://live.example.com/alice".to_string()),
            email: Some("me@example.com".to_string()),
            ..Default::default()
        });
        let payload = channel.build_payload(&NotificationMessage::stream_start("Alice", None));
        assert_eq!(payload["actions"][0]["action"], "view");
        assert_eq!(payload["actions"][0]["url"], "https://live.example.com/alice");
        assert_eq!(payload["email"], "me@example.com");
    }

    #[test]
    fn test_requires_topic() {
        let channel = NtfyChannel::new(NtfyConfig {
            enabled: true,
            ..Default::default()
        });
        assert!(!channel.is_enabled());
    }
}
