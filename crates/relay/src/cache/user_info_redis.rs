use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use liao_common::{
    conversation::conversation_key,
    types::{CachedLastMessage, CachedUserInfo},
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use super::{
    local::{LocalCache, DEFAULT_LOCAL_CAPACITY},
    redis_conn::{CacheError, RedisConn, RedisSettings},
};

pub const DEFAULT_USER_PREFIX: &str = "user:info:";
pub const DEFAULT_LAST_MESSAGE_PREFIX: &str = "user:lastmsg:";
pub const DEFAULT_USER_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_LOCAL_TTL: Duration = Duration::from_secs(60 * 60);
const LAST_MESSAGE_LOCAL_PREFIX: &str = "lastmsg_";

#[derive(Debug, Clone)]
pub struct UserCacheOptions {
    pub user_prefix: String,
    pub last_message_prefix: String,
    pub ttl: Duration,
    /// Zero writes through on every save.
    pub flush_interval: Duration,
    pub local_ttl: Duration,
    pub local_capacity: usize,
}

impl Default for UserCacheOptions {
    fn default() -> Self {
        Self {
            user_prefix: DEFAULT_USER_PREFIX.into(),
            last_message_prefix: DEFAULT_LAST_MESSAGE_PREFIX.into(),
            ttl: DEFAULT_USER_CACHE_TTL,
            flush_interval: Duration::ZERO,
            local_ttl: DEFAULT_LOCAL_TTL,
            local_capacity: DEFAULT_LOCAL_CAPACITY,
        }
    }
}

struct Shared {
    conn: RedisConn,
    local: LocalCache,
    user_prefix: String,
    last_message_prefix: String,
    ttl_secs: u64,
    batched: bool,
    // redis key -> encoded payload; a later save for the same key replaces the earlier one.
    pending: Mutex<HashMap<String, String>>,
    // Write-through queue, drained in order by a single writer task. Taken on close.
    queue: Mutex<Option<mpsc::UnboundedSender<(String, String)>>>,
}

/// The flush loop (batched mode) or the ordered writer (write-through mode).
struct Background {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Redis-backed user-info cache with an L1 [`LocalCache`] in front.
///
/// Saves land in L1 immediately. Redis writes either go out right away, in
/// save order, through a single writer task or, when a flush interval is
/// configured, are coalesced per key and flushed by a background loop.
pub struct RedisUserInfoCache {
    shared: Arc<Shared>,
    background: Mutex<Option<Background>>,
}

impl RedisUserInfoCache {
    /// Connect, require a successful ping, then start the cache.
    pub async fn connect(
        settings: &RedisSettings,
        options: UserCacheOptions,
    ) -> Result<Self, CacheError> {
        let conn = RedisConn::connect(settings).await?;
        Ok(Self::with_conn(conn, options))
    }

    /// Start the cache on an existing handle without checking connectivity.
    pub fn with_conn(conn: RedisConn, options: UserCacheOptions) -> Self {
        let user_prefix = non_blank_or(options.user_prefix, DEFAULT_USER_PREFIX);
        let last_message_prefix =
            non_blank_or(options.last_message_prefix, DEFAULT_LAST_MESSAGE_PREFIX);
        let ttl = if options.ttl.is_zero() { DEFAULT_USER_CACHE_TTL } else { options.ttl };
        let local_ttl =
            if options.local_ttl.is_zero() { DEFAULT_LOCAL_TTL } else { options.local_ttl };
        let batched = !options.flush_interval.is_zero();
        let (queue, writes) = if batched {
            (None, None)
        } else {
            let (sender, receiver) = mpsc::unbounded_channel();
            (Some(sender), Some(receiver))
        };

        let shared = Arc::new(Shared {
            conn,
            local: LocalCache::new(options.local_capacity, local_ttl),
            user_prefix,
            last_message_prefix,
            ttl_secs: ttl.as_secs().max(1),
            batched,
            pending: Mutex::new(HashMap::new()),
            queue: Mutex::new(queue),
        });

        let background = match writes {
            Some(writes) => spawn_writer(Arc::clone(&shared), writes),
            None => spawn_flusher(Arc::clone(&shared), options.flush_interval),
        };
        Self { shared, background: Mutex::new(Some(background)) }
    }

    pub fn save_user_info(&self, mut info: CachedUserInfo) {
        let user_id = info.user_id.trim().to_owned();
        if user_id.is_empty() {
            return;
        }
        info.user_id = user_id.clone();
        info.update_time_millis = Utc::now().timestamp_millis();

        let redis_key = format!("{}{user_id}", self.shared.user_prefix);
        self.shared.store(&redis_key, &info);
        self.shared.local.set(&user_id, info);
    }

    pub async fn get_user_info(&self, user_id: &str) -> Option<CachedUserInfo> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return None;
        }
        if let Some(info) = self.shared.local.get::<CachedUserInfo>(user_id) {
            return Some(info);
        }

        let redis_key = format!("{}{user_id}", self.shared.user_prefix);
        let info: CachedUserInfo = self.shared.fetch(&redis_key).await?;
        self.shared.local.set(user_id, info.clone());
        Some(info)
    }

    pub fn save_last_message(&self, mut message: CachedLastMessage) {
        if message.conversation_key.trim().is_empty() {
            message.conversation_key = conversation_key(&message.from_user_id, &message.to_user_id);
        }
        if message.conversation_key.trim().is_empty() {
            return;
        }
        message.update_time_millis = Utc::now().timestamp_millis();

        let key = message.conversation_key.clone();
        let redis_key = format!("{}{key}", self.shared.last_message_prefix);
        self.shared.store(&redis_key, &message);
        self.shared.local.set(&format!("{LAST_MESSAGE_LOCAL_PREFIX}{key}"), message);
    }

    pub async fn get_last_message(&self, my_id: &str, other_id: &str) -> Option<CachedLastMessage> {
        let key = conversation_key(my_id.trim(), other_id.trim());
        if key.is_empty() {
            return None;
        }
        let local_key = format!("{LAST_MESSAGE_LOCAL_PREFIX}{key}");
        if let Some(message) = self.shared.local.get::<CachedLastMessage>(&local_key) {
            return Some(message);
        }

        let redis_key = format!("{}{key}", self.shared.last_message_prefix);
        let message: CachedLastMessage = self.shared.fetch(&redis_key).await?;
        self.shared.local.set(&local_key, message.clone());
        Some(message)
    }

    pub(crate) async fn batch_get_user_info(
        &self,
        user_ids: &[String],
    ) -> HashMap<String, CachedUserInfo> {
        self.shared
            .multi_get(user_ids, |id| id.to_owned(), |id| format!("{}{id}", self.shared.user_prefix))
            .await
    }

    pub(crate) async fn batch_get_last_messages(
        &self,
        keys: &[String],
    ) -> HashMap<String, CachedLastMessage> {
        self.shared
            .multi_get(
                keys,
                |key| format!("{LAST_MESSAGE_LOCAL_PREFIX}{key}"),
                |key| format!("{}{key}", self.shared.last_message_prefix),
            )
            .await
    }

    /// Keys currently waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }

    pub(crate) fn pending_payload(&self, redis_key: &str) -> Option<String> {
        self.shared.pending().get(redis_key).cloned()
    }

    /// Drain queued writes (or flush whatever is pending), then drop the connection.
    pub async fn close(&self) {
        let background =
            self.background.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        // Dropping the sender lets the writer finish once the queue is empty.
        self.shared.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();

        if let Some(Background { stop, task }) = background {
            if let Some(stop) = stop {
                let _ = stop.send(());
            }
            if let Err(error) = task.await {
                warn!(?error, "user cache background task ended abnormally");
            }
        }
        self.shared.conn.close().await;
    }
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue or write through one encoded entity.
    fn store<T: Serialize>(&self, redis_key: &str, value: &T) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(key = %redis_key, %error, "failed to encode cache entry");
                return;
            }
        };

        if self.batched {
            self.pending().insert(redis_key.to_owned(), payload);
            return;
        }

        let queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let queued = queue
            .as_ref()
            .is_some_and(|sender| sender.send((redis_key.to_owned(), payload)).is_ok());
        if !queued {
            debug!(key = %redis_key, "user cache closed; redis write skipped");
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, redis_key: &str) -> Option<T> {
        let key = redis_key.to_owned();
        let raw: Option<String> = match self
            .conn
            .run(|mut conn| async move { redis::cmd("GET").arg(&key).query_async(&mut conn).await })
            .await
        {
            Ok(raw) => raw,
            Err(error) => {
                debug!(key = %redis_key, %error, "user cache read failed");
                return None;
            }
        };

        serde_json::from_str(&raw?).ok()
    }

    /// L1 first, then a single `MGET` for the residue. Redis failures return
    /// whatever L1 supplied.
    async fn multi_get<T, L, R>(
        &self,
        ids: &[String],
        local_key: L,
        redis_key: R,
    ) -> HashMap<String, T>
    where
        T: Clone + DeserializeOwned + Send + Sync + 'static,
        L: Fn(&str) -> String,
        R: Fn(&str) -> String,
    {
        let mut found = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
            match self.local.get::<T>(&local_key(id)) {
                Some(value) => {
                    found.insert(id.to_owned(), value);
                }
                None => missing.push(id.to_owned()),
            }
        }
        if missing.is_empty() {
            return found;
        }

        let keys: Vec<String> = missing.iter().map(|id| redis_key(id)).collect();
        let raw: Vec<Option<String>> = match self
            .conn
            .run(|mut conn| async move { redis::cmd("MGET").arg(&keys).query_async(&mut conn).await })
            .await
        {
            Ok(raw) => raw,
            Err(error) => {
                debug!(%error, "user cache batch read failed");
                return found;
            }
        };

        for (id, payload) in missing.into_iter().zip(raw) {
            let Some(value) = payload.and_then(|raw| serde_json::from_str::<T>(&raw).ok()) else {
                continue;
            };
            self.local.set(&local_key(&id), value.clone());
            found.insert(id, value);
        }
        found
    }

    async fn flush_pending(&self) {
        let batch: Vec<(String, String)> = std::mem::take(&mut *self.pending()).into_iter().collect();
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        match self.write_batch(batch).await {
            Ok(()) => debug!(count, "flushed user cache batch"),
            // Dropped on failure so a redis outage cannot grow the pending map without bound.
            Err(error) => warn!(count, %error, "user cache flush failed"),
        }
    }

    async fn write_batch(&self, batch: Vec<(String, String)>) -> Result<(), CacheError> {
        let ttl_secs = self.ttl_secs;
        self.conn
            .run(|mut conn| async move {
                let mut pipe = redis::pipe();
                for (key, payload) in &batch {
                    pipe.cmd("SET").arg(key).arg(payload).arg("EX").arg(ttl_secs).ignore();
                }
                let written: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
                written
            })
            .await
    }
}

/// Writes queued entries in arrival order; whatever queued up while a write
/// was in flight goes out as one pipeline.
fn spawn_writer(
    shared: Arc<Shared>,
    mut writes: mpsc::UnboundedReceiver<(String, String)>,
) -> Background {
    let task = tokio::spawn(async move {
        while let Some(first) = writes.recv().await {
            let mut batch = vec![first];
            while let Ok(next) = writes.try_recv() {
                batch.push(next);
            }
            let count = batch.len();
            if let Err(error) = shared.write_batch(batch).await {
                warn!(count, %error, "user cache write failed");
            }
        }
    });
    Background { stop: None, task }
}

fn spawn_flusher(shared: Arc<Shared>, interval: Duration) -> Background {
    let (stop, mut stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => shared.flush_pending().await,
                _ = &mut stopped => {
                    shared.flush_pending().await;
                    return;
                }
            }
        }
    });
    Background { stop: Some(stop), task }
}

fn non_blank_or(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_owned()
    } else {
        value
    }
}
