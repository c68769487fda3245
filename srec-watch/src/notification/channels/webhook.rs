//! Generic webhook notification channel.

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::NotificationChannel;
use crate::Result;
use crate::notification::{NotificationMessage, NotificationPriority};
use crate::utils::install_rustls_provider;

/// Webhook channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    /// HTTP method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
    #[serde(default)]
    pub min_priority: NotificationPriority,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Webhook authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            method: default_method(),
            headers: Vec::new(),
            auth: None,
            min_priority: NotificationPriority::Normal,
            timeout_secs: default_timeout(),
        }
    }
}

/// Generic webhook notification channel.
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Self {
        install_rustls_provider();
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut insert = |name: &str, value: &str| {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        };

        for (name, value) in &self.config.headers {
            insert(name, value);
        }

        match &self.config.auth {
            Some(WebhookAuth::Bearer { token }) => insert("authorization", &format!("Bearer {token}")),
            Some(WebhookAuth::Header { name, value }) => insert(name, value),
            // Basic auth is applied on the request builder.
            Some(WebhookAuth::Basic { .. }) | None => {}
        }

        headers
    }

    fn build_payload(&self, message: &NotificationMessage) -> serde_json::Value {
        json!({
            "event_type": message.kind.to_string(),
            "priority": message.priority().to_string(),
            "title": message.title,
            "body": message.body,
            "entry_id": message.entry_id,
            "timestamp": message.timestamp.to_rfc3339(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn channel_type(&self) -> &'static str {
        "webhook"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.url.is_empty()
    }

    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        if message.priority() < self.config.min_priority {
            debug!(
                "Skipping webhook notification for {} (priority {} < {})",
                message.kind,
                message.priority(),
                self.config.min_priority
            );
            return Ok(());
        }

        let mut request = match self.config.method.to_uppercase().as_str() {
            "PUT" => self.client.put(&self.config.url),
            _ => self.client.post(&self.config.url),
        };
        request = request.headers(self.build_headers()).json(&self.build_payload(message));

        if let Some(WebhookAuth::Basic { username, password }) = &self.config.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Webhook failed: {} - {}", status, body);
            return Err(crate::Error::Other(format!("Webhook failed: {} - {}", status, body)));
        }

        debug!("Webhook notification sent: {}", message.kind);
        Ok(())
    }
}
