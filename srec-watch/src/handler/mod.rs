//! Liveness handlers and their shared cache.
//!
//! Resolving a stream URL goes through a [`LivenessResolver`]. Building one
//! is expensive (HTTP client, cookies, rate limits on the remote side), so
//! instances are pooled per [`HandlerKey`] in the [`HandlerCache`].

mod cache;
mod http;

pub use cache::{CacheStats, HandlerCache, HandlerLease};
pub use http::{HttpResolver, HttpResolverFactory};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

/// Result of a liveness query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub is_live: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Playable media URL. Present when live.
    #[serde(default)]
    pub media_locator: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

/// Identity of a pooled handler: one per endpoint and credential set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub platform: String,
    pub proxy: Option<String>,
    pub credentials: Option<String>,
    pub quality: String,
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[quality={}, proxy={}, credentials={}]",
            self.platform,
            self.quality,
            self.proxy.as_deref().unwrap_or("-"),
            if self.credentials.is_some() { "set" } else { "-" }
        )
    }
}

/// Answers "is this URL live, and where is its media?".
#[async_trait]
pub trait LivenessResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<StreamInfo, ResolveError>;
}

/// Builds resolvers for the cache.
pub trait ResolverFactory: Send + Sync + 'static {
    /// Platform identifier for a URL, or `None` if no handler supports it.
    fn platform_for(&self, url: &str) -> Option<String>;

    /// Construct a resolver for `key`. Called on cache misses only.
    fn create(&self, key: &HandlerKey) -> Result<Arc<dyn LivenessResolver>, ResolveError>;
}
