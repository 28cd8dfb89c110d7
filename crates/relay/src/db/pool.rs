use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

use super::dialect::Dialect;

const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let min_connections = env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MIN_CONNECTIONS);

        let max_connections = env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(min_connections);

        let acquire_timeout_secs = env::var("DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS);

        Self {
            min_connections,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
        }
    }
}

/// A pool paired with the dialect its URL selected.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    dialect: Dialect,
}

impl Database {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self> {
        let dialect = Dialect::from_scheme(database_url)?;
        let url = database_url.trim();
        let url = url.strip_prefix("jdbc:").unwrap_or(url);
        let pool = create_any_pool(url, config).await?;
        Ok(Self { pool, dialect })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn create_any_pool(database_url: &str, config: PoolConfig) -> Result<AnyPool> {
    sqlx::any::install_default_drivers();

    AnyPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await
        .context("failed to connect to database")
}

pub async fn check_pool_health(pool: &AnyPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await.context("database health check failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Database, PoolConfig};

    #[test]
    fn default_pool_config_is_small() {
        let config = PoolConfig::default();
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout.as_secs(), 10);
    }

    #[tokio::test]
    async fn unsupported_scheme_fails_before_connecting() {
        let error = Database::connect("sqlite://relay.db", PoolConfig::default())
            .await
            .err()
            .expect("sqlite url should be rejected");
        assert!(error.to_string().contains("unsupported DB_URL scheme"));
    }
}
