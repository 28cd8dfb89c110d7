pub mod enrich;
pub mod history;
pub mod local;
pub mod redis_conn;
pub mod user_info;
pub mod user_info_redis;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use self::{
    history::{ChatHistoryCache, HistoryCacheOptions},
    redis_conn::RedisSettings,
    user_info::UserInfoCache,
    user_info_redis::{RedisUserInfoCache, UserCacheOptions},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

impl CacheBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub redis: RedisSettings,
    pub user: UserCacheOptions,
    pub history: HistoryCacheOptions,
}

/// The cache handles shared by the broker and the HTTP layer.
#[derive(Clone)]
pub struct Caches {
    pub user_info: Arc<UserInfoCache>,
    /// Only present with the redis backend.
    pub history: Option<Arc<ChatHistoryCache>>,
}

impl Caches {
    pub fn memory() -> Self {
        Self { user_info: Arc::new(UserInfoCache::memory()), history: None }
    }

    /// Build the configured backend. Redis must answer a ping.
    pub async fn from_config(config: &CacheConfig) -> anyhow::Result<Self> {
        match config.backend {
            CacheBackend::Memory => {
                info!(backend = "memory", "user info cache ready");
                Ok(Self::memory())
            }
            CacheBackend::Redis => {
                let user_info = RedisUserInfoCache::connect(&config.redis, config.user.clone())
                    .await
                    .context("failed to connect user info cache to redis")?;
                let history = ChatHistoryCache::connect(&config.redis, config.history.clone())
                    .await
                    .context("failed to connect chat history cache to redis")?;
                info!(
                    backend = "redis",
                    batched_user_writes = !config.user.flush_interval.is_zero(),
                    batched_history_writes = !config.history.flush_interval.is_zero(),
                    "user info and chat history caches ready"
                );
                Ok(Self {
                    user_info: Arc::new(UserInfoCache::Redis(user_info)),
                    history: Some(Arc::new(history)),
                })
            }
        }
    }

    /// Flush pending writes and release backend connections.
    pub async fn close(&self) {
        self.user_info.close().await;
        if let Some(history) = &self.history {
            history.close().await;
        }
    }
}
