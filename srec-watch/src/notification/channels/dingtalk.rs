//! DingTalk group robot channel.

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
pub struct DingTalkConfig {
    pub enabled: bool,
    /// Robot webhook URL, including its access token.
    #[serde(default)]
    pub webhook_url: String,
    /// Phone numbers to @-mention.
    #[serde(default)]
    pub at_mobiles: Vec<String>,
    #[serde(default)]
    pub at_all: bool,
    #[serde(default)]
    pub min_priority: NotificationPriority,
}

#[derive(Debug, Deserialize)]
struct RobotResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

pub struct DingTalkChannel {
    config: DingTalkConfig,
    client: Client,
}

impl DingTalkChannel {
    pub fn new(config: DingTalkConfig) -> Self {
        install_rustls_provider();
        Self {
            config,
            client: Client::new(),
        }
    }

    fn build_payload(&self, message: &NotificationMessage) -> serde_json::Value {
        // Mentions only render when the numbers also appear in the text.
        let mut content = format!("{}\n{}", message.title, message.body);
        for mobile in &self.config.at_mobiles {
            content.push_str(&format!(" @{mobile}"));
        }
        json!({
            "msgtype": "text",
            "text": { "content": content },
            "at": {
                "atMobiles": self.config.at_mobiles,
                "isAtAll": self.config.at_all,
            },
        })
    }
}

#[async_trait]
impl NotificationChannel for DingTalkChannel {
    fn channel_type(&self) -> &'static str {
        "dingtalk"
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
            .json(&self.build_payload(message))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!("DingTalk request failed: {status} - {body}")));
        }

        // The robot answers 200 with an error code in the body.
        let result: RobotResponse = response.json().await?;
        if result.errcode != 0 {
            return Err(Error::Other(format!(
                "DingTalk rejected message: {} ({})",
                result.errmsg, result.errcode
            )));
        }

        debug!("DingTalk notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_mentions() {
        let channel = DingTalkChannel::new(DingTalkConfig {
            enabled: true,
            webhook_url: "https://oapi.dingtalk.com/robot/send?access_token=x".to_string(),
            at_mobiles: vec!["13800000000".to_string()],
            at_all: false,
            ..Default::default()
        });
        let payload = channel.build_payload(&NotificationMessage::stream_end("Alice"));

        assert_eq!(payload["msgtype"], "text");
        let content = payload["text"]["content"].as_str().unwrap();
        assert!(content.starts_with("Stream ended\nAlice went offline"));
        assert!(content.ends_with("@13800000000"));
        assert_eq!(payload["at"]["atMobiles"][0], "13800000000");
        assert_eq!(payload["at"]["isAtAll"], false);
    }

    #[test]
    fn test_requires_webhook() {
        let channel = DingTalkChannel::new(DingTalkConfig {
            enabled: true,
            webhook_url: "  ".to_string(),
            ..Default::default()
        });
        assert!(!channel.is_enabled());
    }
}
