// Relay server configuration.
//
// Every setting is read from the environment once at startup, with
// defaults for local development. Unparseable values fall back to the
// default rather than failing.

use std::{net::SocketAddr, time::Duration};

use crate::{
    broker::BrokerConfig,
    cache::{
        history::{HistoryCacheOptions, DEFAULT_HISTORY_PREFIX, DEFAULT_HISTORY_TTL},
        local::DEFAULT_LOCAL_CAPACITY,
        redis_conn::{RedisSettings, DEFAULT_REDIS_TIMEOUT},
        user_info_redis::{
            UserCacheOptions, DEFAULT_LAST_MESSAGE_PREFIX, DEFAULT_LOCAL_TTL,
            DEFAULT_USER_CACHE_TTL, DEFAULT_USER_PREFIX,
        },
        CacheBackend, CacheConfig,
    },
    forceout::DEFAULT_FORCEOUT_BAN,
    upstream::{
        client::UpstreamTimings,
        resolver::{
            ResolverConfig, DEFAULT_DISCOVERY_TIMEOUT, DEFAULT_DISCOVERY_URL, DEFAULT_FALLBACK_URL,
        },
    },
};

const DEV_JWT_SECRET: &str = "liao_local_development_jwt_secret_must_be_32_chars";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// HS256 secret for WebSocket tokens and system API bearers.
    pub jwt_secret: String,
    /// `mysql://` or `postgres://`; no pool is opened when unset.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    pub log_filter: String,
    pub log_format: LogFormat,
    pub broker: BrokerConfig,
    pub resolver: ResolverConfig,
    pub cache: CacheConfig,
    pub forceout_ban: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SERVER_HOST` / `SERVER_PORT` | `0.0.0.0` / `8080` |
    /// | `JWT_SECRET` | dev-only placeholder |
    /// | `DB_URL` | *(none)* |
    /// | `CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `LOG_FILTER` / `LOG_FORMAT` | `info` / `text` |
    /// | `MAX_IDENTITIES` | `2` |
    /// | `CLOSE_DELAY` / `EVICTION_DELAY` / `FORCEOUT_DELAY` | `80s` / `1s` / `1s` |
    /// | `UPSTREAM_DIAL_TIMEOUT` / `UPSTREAM_WRITE_DEADLINE` / `UPSTREAM_READ_IDLE` | `15s` / `10s` / `700s` |
    /// | `HEARTBEAT_INTERVAL` / `DOWNSTREAM_WRITE_DEADLINE` | `600s` / `5s` |
    /// | `FORCEOUT_BAN` | `5m` |
    /// | `WEBSOCKET_UPSTREAM_URL` | `ws://localhost:9999` |
    /// | `UPSTREAM_DISCOVERY_URL` / `_ENABLED` / `_TIMEOUT` | chat2019 endpoint / `true` / `10s` |
    /// | `CACHE_TYPE` | `memory` |
    /// | `REDIS_URL` (or `UPSTASH_REDIS_URL`), `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`, `REDIS_DB`, `REDIS_TIMEOUT` | `localhost:6379/0`, `15s` |
    /// | `CACHE_REDIS_PREFIX` / `CACHE_REDIS_LASTMSG_PREFIX` / `CACHE_REDIS_CHAT_HISTORY_PREFIX` | `user:info:` / `user:lastmsg:` / `user:chathistory:` |
    /// | `USER_CACHE_TTL` / `HISTORY_TTL` | `7d` / `30d` |
    /// | `USER_CACHE_FLUSH_INTERVAL` / `HISTORY_FLUSH_INTERVAL` | `0` (write through) |
    /// | `CACHE_REDIS_LOCAL_TTL` / `CACHE_REDIS_LOCAL_CAPACITY` | `3600s` / `10000` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let text = |key: &str| env(key).ok().map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());
        let duration =
            |key: &str, default: Duration| text(key).and_then(|v| parse_duration(&v)).unwrap_or(default);
        // Timeouts, deadlines and periods; zero would disable or panic the timer.
        let period = |key: &str, default: Duration| {
            text(key)
                .and_then(|v| parse_duration(&v))
                .filter(|d| !d.is_zero())
                .unwrap_or(default)
        };

        let host = text("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = text("SERVER_PORT").and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = text("JWT_SECRET").unwrap_or_else(|| DEV_JWT_SECRET.into());
        let log_filter = text("LOG_FILTER").unwrap_or_else(|| "info".into());
        let log_format = match text("LOG_FORMAT").map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let defaults = BrokerConfig::default();
        let upstream_defaults = UpstreamTimings::default();
        let broker = BrokerConfig {
            max_identities: text("MAX_IDENTITIES")
                .and_then(|v| v.parse().ok())
                .filter(|max: &usize| *max > 0)
                .unwrap_or(defaults.max_identities),
            close_delay: period("CLOSE_DELAY", defaults.close_delay),
            eviction_delay: duration("EVICTION_DELAY", defaults.eviction_delay),
            forceout_delay: duration("FORCEOUT_DELAY", defaults.forceout_delay),
            downstream_write_deadline: period(
                "DOWNSTREAM_WRITE_DEADLINE",
                defaults.downstream_write_deadline,
            ),
            upstream: UpstreamTimings {
                dial_timeout: period("UPSTREAM_DIAL_TIMEOUT", upstream_defaults.dial_timeout),
                write_deadline: period(
                    "UPSTREAM_WRITE_DEADLINE",
                    upstream_defaults.write_deadline,
                ),
                read_idle: period("UPSTREAM_READ_IDLE", upstream_defaults.read_idle),
                heartbeat_interval: period(
                    "HEARTBEAT_INTERVAL",
                    upstream_defaults.heartbeat_interval,
                ),
                close_wait: upstream_defaults.close_wait,
            },
        };

        let resolver = ResolverConfig {
            discovery_url: text("UPSTREAM_DISCOVERY_URL")
                .unwrap_or_else(|| DEFAULT_DISCOVERY_URL.into()),
            fallback_url: text("WEBSOCKET_UPSTREAM_URL")
                .unwrap_or_else(|| DEFAULT_FALLBACK_URL.into()),
            discovery_enabled: text("UPSTREAM_DISCOVERY_ENABLED")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
            timeout: period("UPSTREAM_DISCOVERY_TIMEOUT", DEFAULT_DISCOVERY_TIMEOUT),
        };

        let redis = RedisSettings {
            url: text("REDIS_URL").or_else(|| text("UPSTASH_REDIS_URL")),
            host: text("REDIS_HOST").unwrap_or_else(|| "localhost".into()),
            port: text("REDIS_PORT").and_then(|v| v.parse().ok()).unwrap_or(6379),
            password: text("REDIS_PASSWORD").unwrap_or_default(),
            db: text("REDIS_DB").and_then(|v| v.parse().ok()).unwrap_or(0),
            timeout: period("REDIS_TIMEOUT", DEFAULT_REDIS_TIMEOUT),
        };
        let cache = CacheConfig {
            backend: text("CACHE_TYPE")
                .and_then(|v| CacheBackend::parse(&v))
                .unwrap_or_default(),
            redis,
            user: UserCacheOptions {
                user_prefix: text("CACHE_REDIS_PREFIX")
                    .unwrap_or_else(|| DEFAULT_USER_PREFIX.into()),
                last_message_prefix: text("CACHE_REDIS_LASTMSG_PREFIX")
                    .unwrap_or_else(|| DEFAULT_LAST_MESSAGE_PREFIX.into()),
                ttl: period("USER_CACHE_TTL", DEFAULT_USER_CACHE_TTL),
                flush_interval: duration("USER_CACHE_FLUSH_INTERVAL", Duration::ZERO),
                local_ttl: period("CACHE_REDIS_LOCAL_TTL", DEFAULT_LOCAL_TTL),
                local_capacity: text("CACHE_REDIS_LOCAL_CAPACITY")
                    .and_then(|v| v.parse().ok())
                    .filter(|capacity: &usize| *capacity > 0)
                    .unwrap_or(DEFAULT_LOCAL_CAPACITY),
            },
            history: HistoryCacheOptions {
                prefix: text("CACHE_REDIS_CHAT_HISTORY_PREFIX")
                    .unwrap_or_else(|| DEFAULT_HISTORY_PREFIX.into()),
                ttl: period("HISTORY_TTL", DEFAULT_HISTORY_TTL),
                flush_interval: duration("HISTORY_FLUSH_INTERVAL", Duration::ZERO),
            },
        };

        Self {
            listen_addr,
            jwt_secret,
            database_url: text("DB_URL"),
            cors_origins: text("CORS_ORIGINS"),
            log_filter,
            log_format,
            broker,
            resolver,
            cache,
            forceout_ban: period("FORCEOUT_BAN", DEFAULT_FORCEOUT_BAN),
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

/// A bare integer is seconds; otherwise one of the `ms`, `s`, `m`, `h`, `d` suffixes.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = value.split_at(split);
    let amount: u64 = amount.parse().ok()?;
    let seconds_per_unit = match unit.trim() {
        "ms" => return Some(Duration::from_millis(amount)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return None,
    };
    amount.checked_mul(seconds_per_unit).map(Duration::from_secs)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
