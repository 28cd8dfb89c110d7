// Upstream server discovery with a static fallback.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_FALLBACK_URL: &str = "ws://localhost:9999";
pub const DEFAULT_DISCOVERY_URL: &str =
    "http://v1.chat2019.cn/Act/WebService.asmx/getRandServer?ServerInfo=serversdeskry&_=";
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DISCOVERY_BODY_BYTES: usize = 2 << 20;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Queried as `{discovery_url}{unix_millis}`.
    pub discovery_url: String,
    pub fallback_url: String,
    pub discovery_enabled: bool,
    pub timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            discovery_url: DEFAULT_DISCOVERY_URL.into(),
            fallback_url: DEFAULT_FALLBACK_URL.into(),
            discovery_enabled: true,
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("discovery request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("discovery returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("discovery response exceeded 2MB")]
    BodyTooLarge,
    #[error("discovery response is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("discovery state is {0:?}, expected \"OK\"")]
    NotOk(String),
    #[error("discovery returned a blank server")]
    BlankServer,
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    #[serde(default)]
    state: String,
    #[serde(default)]
    msg: DiscoveryServer,
}

#[derive(Debug, Default, Deserialize)]
struct DiscoveryServer {
    #[serde(default)]
    server: String,
}

/// Picks the upstream WebSocket URL for a new client.
pub struct UpstreamResolver {
    http: Option<reqwest::Client>,
    config: ResolverConfig,
}

impl UpstreamResolver {
    pub fn new(config: ResolverConfig) -> anyhow::Result<Self> {
        let config = with_default_fallback(config);
        let http = if config.discovery_enabled && !config.discovery_url.trim().is_empty() {
            let timeout =
                if config.timeout.is_zero() { DEFAULT_DISCOVERY_TIMEOUT } else { config.timeout };
            Some(reqwest::Client::builder().timeout(timeout).build()?)
        } else {
            None
        };
        Ok(Self { http, config })
    }

    /// Always uses `url`.
    pub fn fixed(url: impl Into<String>) -> Self {
        let config = with_default_fallback(ResolverConfig {
            fallback_url: url.into(),
            discovery_enabled: false,
            ..ResolverConfig::default()
        });
        Self { http: None, config }
    }

    pub fn fallback_url(&self) -> &str {
        &self.config.fallback_url
    }

    /// Discovered server, or the fallback on any failure.
    pub async fn resolve(&self) -> String {
        let Some(http) = &self.http else {
            return self.config.fallback_url.clone();
        };

        match self.discover(http).await {
            Ok(server) => {
                debug!(url = %server, "discovered upstream server");
                server
            }
            Err(error) => {
                warn!(%error, fallback = %self.config.fallback_url, "upstream discovery failed");
                self.config.fallback_url.clone()
            }
        }
    }

    async fn discover(&self, http: &reqwest::Client) -> Result<String, ResolveError> {
        let url = format!("{}{}", self.config.discovery_url, Utc::now().timestamp_millis());
        let mut response = http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ResolveError::Status(response.status()));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > MAX_DISCOVERY_BODY_BYTES {
                return Err(ResolveError::BodyTooLarge);
            }
            body.extend_from_slice(&chunk);
        }

        parse_discovery(&body)
    }
}

fn with_default_fallback(mut config: ResolverConfig) -> ResolverConfig {
    if config.fallback_url.trim().is_empty() {
        config.fallback_url = DEFAULT_FALLBACK_URL.into();
    }
    config
}

fn parse_discovery(body: &[u8]) -> Result<String, ResolveError> {
    let decoded: DiscoveryResponse = serde_json::from_slice(body)?;
    if decoded.state.trim() != "OK" {
        return Err(ResolveError::NotOk(decoded.state));
    }
    let server = decoded.msg.server.trim();
    if server.is_empty() {
        return Err(ResolveError::BlankServer);
    }
    Ok(server.to_owned())
}
