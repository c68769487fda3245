//! WeChat push channel (xizhi-style webhook taking a title and content).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::NotificationChannel;
use crate::notification::{NotificationMessage, NotificationPriority};
use crate::utils::install_rustls_provider;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeChatConfig {
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub min_priority: NotificationPriority,
}

pub struct WeChatChannel {
    config: WeChatConfig,
    client: Client,
}

impl WeChatChannel {
    pub fn new(config: WeChatConfig) -> Self {
        install_rustls_provider();
        Self {
            config,
            client: Client::new(),
        }
    }

    fn build_payload(message: &NotificationMessage) -> serde_json::Value {
        json!({
            "title": message.title,
            "content": message.body,
        })
    }
}

#[async_trait]
impl NotificationChannel for WeChatChannel {
    fn channel_type(&self) -> &'static str {
        "wechat"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.webhook_url.trim().is_empty()
    }

    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        if !self.is_enabled() || message.priority() < self.config.min_priority {
            return Ok(());
        }

        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&Self::build_payload(message))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!("WeChat push failed: {status} - {body}")));
        }

        debug!("WeChat notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload() {
        let payload = WeChatChannel::build_payload(&NotificationMessage::stream_start("Bob", Some("Late show")));
        assert_eq!(payload["title"], "Stream started");
        assert_eq!(payload["content"], "Bob is live: Late show");
    }
}
