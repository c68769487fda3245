//! Notification channels.
//!
//! - Generic webhooks (HTTP POST/PUT with JSON)
//! - Telegram Bot API
//! - ntfy topics
//! - DingTalk and WeChat robots
//! - Bark
//! - SMTP email

mod bark;
mod dingtalk;
mod email;
mod ntfy;
mod telegram;
mod webhook;
mod wechat;

pub use bark::{BarkChannel, BarkConfig, BarkLevel};
pub use dingtalk::{DingTalkChannel, DingTalkConfig};
pub use email::{EmailChannel, EmailConfig};
pub use ntfy::{NtfyChannel, NtfyConfig};
pub use telegram::{TelegramChannel, TelegramConfig};
pub use webhook::{WebhookAuth, WebhookChannel, WebhookConfig};
pub use wechat::{WeChatChannel, WeChatConfig};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::NotificationMessage;
use crate::Result;

/// Trait for notification channels.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Get the channel type name.
    fn channel_type(&self) -> &'static str;

    /// Enabled and has a delivery target.
    fn is_enabled(&self) -> bool;

    /// Send a notification through this channel.
    async fn send(&self, message: &NotificationMessage) -> Result<()>;

    /// Send a test message.
    async fn test(&self) -> Result<()> {
        self.send(&NotificationMessage::test()).await
    }
}

/// Channel configuration wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    Webhook(WebhookConfig),
    Telegram(TelegramConfig),
    Ntfy(NtfyConfig),
    DingTalk(DingTalkConfig),
    WeChat(WeChatConfig),
    Bark(BarkConfig),
    Email(EmailConfig),
}

impl ChannelConfig {
    pub fn channel_type(&self) -> &'static str {
        match self {
            Self::Webhook(_) => "webhook",
            Self::Telegram(_) => "telegram",
            Self::Ntfy(_) => "ntfy",
            Self::DingTalk(_) => "dingtalk",
            Self::WeChat(_) => "wechat",
            Self::Bark(_) => "bark",
            Self::Email(_) => "email",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Webhook(c) => c.enabled,
            Self::Telegram(c) => c.enabled,
            Self::Ntfy(c) => c.enabled,
            Self::DingTalk(c) => c.enabled,
            Self::WeChat(c) => c.enabled,
            Self::Bark(c) => c.enabled,
            Self::Email(c) => c.enabled,
        }
    }
}

/// Instantiate the channel described by `config`.
pub fn build_channel(config: &ChannelConfig) -> Arc<dyn NotificationChannel> {
    match config {
        ChannelConfig::Webhook(c) => Arc::new(WebhookChannel::new(c.clone())),
        ChannelConfig::Telegram(c) => Arc::new(TelegramChannel::new(c.clone())),
        ChannelConfig::Ntfy(c) => Arc::new(NtfyChannel::new(c.clone())),
        ChannelConfig::DingTalk(c) => Arc::new(DingTalkChannel::new(c.clone())),
        ChannelConfig::WeChat(c) => Arc::new(WeChatChannel::new(c.clone())),
        ChannelConfig::Bark(c) => Arc::new(BarkChannel::new(c.clone())),
        ChannelConfig::Email(c) => Arc::new(EmailChannel::new(c.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_config_parsing() {
        let configs: Vec<ChannelConfig> = serde_json::from_str(
            r#"[
                {"type": "webhook", "enabled": true, "url": "https://example.com/hook"},
                {"type": "ntfy", "enabled": true, "topic": "streams"},
                {"type": "telegram", "enabled": false, "bot_token": "", "chat_id": ""},
                {"type": "dingtalk", "enabled": true, "webhook_url": "https://oapi.dingtalk.com/robot/send", "at_all": true},
                {"type": "wechat", "enabled": true, "webhook_url": "https://xizhi.qqoq.net/key.send"},
                {"type": "bark", "enabled": true, "server_url": "https://api.day.app/key", "level": "timeSensitive"},
                {"type": "email", "enabled": true, "smtp_host": "smtp.example.com", "to_addresses": ["me@example.com"]}
            ]"#,
        )
        .unwrap();

        let types: Vec<_> = configs.iter().map(ChannelConfig::channel_type).collect();
        assert_eq!(types, ["webhook", "ntfy", "telegram", "dingtalk", "wechat", "bark", "email"]);
        assert!(matches!(&configs[5], ChannelConfig::Bark(c) if c.level == BarkLevel::TimeSensitive));
        // No credentials: configured but not deliverable.
        assert!(configs[6].is_enabled());
        assert!(!build_channel(&configs[6]).is_enabled());
        assert!(configs[0].is_enabled());
        assert!(!configs[2].is_enabled());
    }

    #[test]
    fn test_build_channel_respects_targets() {
        let empty = ChannelConfig::Webhook(WebhookConfig {
            enabled: true,
            ..Default::default()
        });
        assert!(!build_channel(&empty).is_enabled());

        let ntfy = ChannelConfig::Ntfy(NtfyConfig {
            enabled: true,
            topic: "alerts".to_string(),
            ..Default::default()
        });
        assert_eq!(build_channel(&ntfy).channel_type(), "ntfy");
        assert!(build_channel(&ntfy).is_enabled());
    }
}
