//! Resolver backed by an HTTP stream-resolution service.
//!
//! Platform-specific parsing lives outside this crate. The service is asked
//! `GET <endpoint>?url=<stream url>&quality=<q>` and answers with a
//! [`StreamInfo`] JSON body.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use tracing::{debug, warn};

use super::{HandlerKey, LivenessResolver, ResolverFactory, StreamInfo};
use crate::config::AppSettings;
use crate::error::ResolveError;
use crate::utils::install_rustls_provider;
use crate::{Error, Result};

/// Builds one [`HttpResolver`] per handler key.
pub struct HttpResolverFactory {
    endpoint: String,
    request_timeout: Duration,
}

impl HttpResolverFactory {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout,
        }
    }

    /// Factory for the configured resolver service. The endpoint is mandatory.
    pub fn from_settings(settings: &AppSettings) -> Result<Self> {
        let endpoint = settings
            .resolver_endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| Error::config("resolver_endpoint must be set"))?;

        let parsed = url::Url::parse(endpoint)
            .map_err(|e| Error::config(format!("invalid resolver_endpoint '{endpoint}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "invalid resolver_endpoint '{endpoint}': unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        Ok(Self::new(endpoint, settings.liveness_timeout()))
    }
}

impl ResolverFactory for HttpResolverFactory {
    fn platform_for(&self, url: &str) -> Option<String> {
        let parsed = url::Url::parse(url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        let host = parsed.host_str()?;
        Some(host.strip_prefix("www.").unwrap_or(host).to_string())
    }

    fn create(&self, key: &HandlerKey) -> std::result::Result<Arc<dyn LivenessResolver>, ResolveError> {
        install_rustls_provider();

        let mut headers = HeaderMap::new();
        if let Some(cookies) = &key.credentials {
            let value = HeaderValue::from_str(cookies)
                .map_err(|e| ResolveError::unsupported(format!("invalid cookie header: {e}")))?;
            headers.insert(COOKIE, value);
        }

        let mut builder = Client::builder()
            .timeout(self.request_timeout)
            .default_headers(headers);

        if let Some(proxy) = key.proxy.as_deref() {
            match reqwest::Proxy::all(proxy) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => {
                    warn!(proxy = %proxy, error = %e, "Invalid proxy URL; disabling proxy");
                    builder = builder.no_proxy();
                }
            }
        }

        let client = builder
            .build()
            .map_err(|e| ResolveError::transient(format!("failed to build HTTP client: {e}")))?;

        Ok(Arc::new(HttpResolver {
            client,
            endpoint: self.endpoint.clone(),
            quality: key.quality.clone(),
        }))
    }
}

/// Liveness resolver that delegates to the resolution service.
pub struct HttpResolver {
    client: Client,
    endpoint: String,
    quality: String,
}

#[async_trait]
impl LivenessResolver for HttpResolver {
    async fn resolve(&self, url: &str) -> std::result::Result<StreamInfo, ResolveError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("url", url), ("quality", self.quality.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            return Err(ResolveError::unsupported(format!("resolver rejected {url}: {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ResolveError::transient(format!("resolver returned {status}: {body}")));
        }

        let info: StreamInfo = response.json().await?;
        debug!(url = %url, is_live = info.is_live, "Resolved stream");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> HttpResolverFactory {
        HttpResolverFactory::new("http://127.0.0.1:9/resolve", Duration::from_secs(10))
    }

    fn key() -> HandlerKey {
        HandlerKey {
            platform: "live.example.com".to_string(),
            proxy: Some("http://127.0.0.1:7890".to_string()),
            credentials: Some("sid=abc".to_string()),
            quality: "OD".to_string(),
        }
    }

    #[test]
    fn test_platform_from_host() {
        let f = factory();
        assert_eq!(
            f.platform_for("https://www.live.example.com/123").as_deref(),
            Some("live.example.com")
        );
        assert_eq!(f.platform_for("not a url"), None);
        assert_eq!(f.platform_for("ftp://files.example.com/x"), None);
    }

    #[test]
    fn test_from_settings_requires_endpoint() {
        let settings = AppSettings::default();
        assert!(matches!(
            HttpResolverFactory::from_settings(&settings),
            Err(Error::Configuration(_))
        ));

        for endpoint in ["", "ftp://resolver.local/x", "not a url"] {
            let settings = AppSettings {
                resolver_endpoint: Some(endpoint.to_string()),
                ..Default::default()
            };
            assert!(HttpResolverFactory::from_settings(&settings).is_err(), "{endpoint}");
        }

        let settings = AppSettings {
            resolver_endpoint: Some("http://127.0.0.1:8000/resolve".to_string()),
            ..Default::default()
        };
        assert!(HttpResolverFactory::from_settings(&settings).is_ok());
    }

    #[test]
    fn test_create_with_proxy_and_cookies() {
        assert!(factory().create(&key()).is_ok());
    }

    #[test]
    fn test_stream_info_lenient_json() {
        let info: StreamInfo = serde_json::from_str(r#"{"is_live": true, "title": "t"}"#).unwrap();
        assert!(info.is_live);
        assert_eq!(info.title.as_deref(), Some("t"));
        assert!(info.media_locator.is_none());
    }
}
