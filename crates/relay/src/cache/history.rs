// Per-conversation chat history in redis.
//
// Layout:
//   {prefix}{conversation}:index      ZSET  score = Tid, member = Tid
//   {prefix}{conversation}:msg:{Tid}  STRING JSON of the message, EX retention

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use liao_common::{history::extract_tid, types::HistoryMessage};
use redis::RedisResult;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use super::redis_conn::{CacheError, RedisConn, RedisSettings};

pub const DEFAULT_HISTORY_PREFIX: &str = "user:chathistory:";
pub const DEFAULT_HISTORY_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct HistoryCacheOptions {
    pub prefix: String,
    pub ttl: Duration,
    /// Zero writes every batch immediately, in save order.
    pub flush_interval: Duration,
}

impl Default for HistoryCacheOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_HISTORY_PREFIX.into(),
            ttl: DEFAULT_HISTORY_TTL,
            flush_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingMessage {
    conversation_key: String,
    tid: String,
    score: i64,
    payload: String,
}

struct Shared {
    conn: RedisConn,
    prefix: String,
    ttl_secs: u64,
    // message key -> latest encoded state for that Tid
    pending: Mutex<HashMap<String, PendingMessage>>,
}

struct Background {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

pub struct ChatHistoryCache {
    shared: Arc<Shared>,
    batched: bool,
    // Immediate-mode batches, written one after another by a single task.
    queue: Mutex<Option<mpsc::UnboundedSender<Vec<PendingMessage>>>>,
    background: Mutex<Option<Background>>,
}

impl ChatHistoryCache {
    pub async fn connect(
        settings: &RedisSettings,
        options: HistoryCacheOptions,
    ) -> Result<Self, CacheError> {
        let conn = RedisConn::connect(settings).await?;
        Ok(Self::with_conn(conn, options))
    }

    pub fn with_conn(conn: RedisConn, options: HistoryCacheOptions) -> Self {
        let prefix = if options.prefix.trim().is_empty() {
            DEFAULT_HISTORY_PREFIX.to_owned()
        } else {
            options.prefix
        };
        let ttl = if options.ttl.is_zero() { DEFAULT_HISTORY_TTL } else { options.ttl };
        let batched = !options.flush_interval.is_zero();

        let shared = Arc::new(Shared {
            conn,
            prefix,
            ttl_secs: ttl.as_secs().max(1),
            pending: Mutex::new(HashMap::new()),
        });
        let (queue, background) = if batched {
            (None, spawn_flusher(Arc::clone(&shared), options.flush_interval))
        } else {
            let (sender, receiver) = mpsc::unbounded_channel();
            (Some(sender), spawn_writer(Arc::clone(&shared), receiver))
        };

        Self {
            shared,
            batched,
            queue: Mutex::new(queue),
            background: Mutex::new(Some(background)),
        }
    }

    /// Store `messages` for `conversation_key`.
    ///
    /// Messages without an integral Tid are dropped. In batched mode a later
    /// save of the same Tid replaces the queued one. Never blocks on redis.
    pub fn save_messages(&self, conversation_key: &str, messages: &[HistoryMessage]) {
        let conversation_key = conversation_key.trim();
        if conversation_key.is_empty() || messages.is_empty() {
            return;
        }

        let batch = encode_batch(conversation_key, messages);
        if batch.is_empty() {
            return;
        }

        if self.batched {
            let mut pending = self.shared.pending();
            for message in batch {
                let key = self.shared.message_key(&message.conversation_key, &message.tid);
                pending.insert(key, message);
            }
            return;
        }

        let queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let queued = queue.as_ref().is_some_and(|sender| sender.send(batch).is_ok());
        if !queued {
            debug!(conversation = %conversation_key, "chat history closed; redis write skipped");
        }
    }

    /// Newest-first page of messages strictly older than `before_tid`.
    ///
    /// Redis failures are logged and read as an empty page.
    pub async fn get_messages(
        &self,
        conversation_key: &str,
        before_tid: &str,
        limit: i64,
    ) -> Vec<HistoryMessage> {
        match self.try_get_messages(conversation_key, before_tid, limit).await {
            Ok(messages) => messages,
            Err(error) => {
                debug!(conversation = %conversation_key, %error, "chat history read failed");
                Vec::new()
            }
        }
    }

    pub async fn try_get_messages(
        &self,
        conversation_key: &str,
        before_tid: &str,
        limit: i64,
    ) -> Result<Vec<HistoryMessage>, CacheError> {
        let conversation_key = conversation_key.trim();
        if conversation_key.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }

        let index_key = self.shared.index_key(conversation_key);
        let max = upper_score_bound(before_tid);
        let tids: Vec<String> = {
            let index_key = index_key.clone();
            self.shared
                .conn
                .run(|mut conn| async move {
                    redis::cmd("ZREVRANGEBYSCORE")
                        .arg(&index_key)
                        .arg(&max)
                        .arg("-inf")
                        .arg("LIMIT")
                        .arg(0)
                        .arg(limit)
                        .query_async(&mut conn)
                        .await
                })
                .await?
        };
        if tids.is_empty() {
            return Ok(Vec::new());
        }

        let message_keys: Vec<String> =
            tids.iter().map(|tid| self.shared.message_key(conversation_key, tid)).collect();
        let payloads: Vec<Option<String>> = self
            .shared
            .conn
            .run(|mut conn| async move {
                let mut pipe = redis::pipe();
                for key in &message_keys {
                    pipe.cmd("GET").arg(key);
                }
                pipe.query_async(&mut conn).await
            })
            .await?;

        let mut messages = Vec::with_capacity(tids.len());
        let mut missing = Vec::new();
        for (tid, payload) in tids.into_iter().zip(payloads) {
            match payload.as_deref().and_then(decode_message) {
                Some(message) => messages.push(message),
                None => missing.push(tid),
            }
        }

        if !missing.is_empty() {
            self.shared.remove_from_index(index_key, missing).await;
        }
        Ok(messages)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }

    pub(crate) fn pending_payload(&self, conversation_key: &str, tid: &str) -> Option<String> {
        let key = self.shared.message_key(conversation_key, tid);
        self.shared.pending().get(&key).map(|message| message.payload.clone())
    }

    /// Finish queued writes or the final flush, then drop the connection.
    pub async fn close(&self) {
        let background =
            self.background.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();

        if let Some(Background { stop, task }) = background {
            if let Some(stop) = stop {
                let _ = stop.send(());
            }
            if let Err(error) = task.await {
                warn!(?error, "chat history background task ended abnormally");
            }
        }
        self.shared.conn.close().await;
    }
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingMessage>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn index_key(&self, conversation_key: &str) -> String {
        format!("{}{conversation_key}:index", self.prefix)
    }

    fn message_key(&self, conversation_key: &str, tid: &str) -> String {
        format!("{}{conversation_key}:msg:{tid}", self.prefix)
    }

    async fn flush_pending(&self) {
        let batch: Vec<PendingMessage> =
            std::mem::take(&mut *self.pending()).into_values().collect();
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        match self.write_batch(batch).await {
            Ok(()) => debug!(count, "flushed chat history batch"),
            Err(error) => warn!(count, %error, "chat history flush failed"),
        }
    }

    async fn write_batch(&self, batch: Vec<PendingMessage>) -> Result<(), CacheError> {
        let ttl_secs = self.ttl_secs;
        let commands: Vec<(String, String, PendingMessage)> = batch
            .into_iter()
            .map(|message| {
                (
                    self.message_key(&message.conversation_key, &message.tid),
                    self.index_key(&message.conversation_key),
                    message,
                )
            })
            .collect();

        self.conn
            .run(|mut conn| async move {
                let mut pipe = redis::pipe();
                for (message_key, index_key, message) in &commands {
                    pipe.cmd("SET")
                        .arg(message_key)
                        .arg(&message.payload)
                        .arg("EX")
                        .arg(ttl_secs)
                        .ignore();
                    pipe.cmd("ZADD").arg(index_key).arg(message.score).arg(&message.tid).ignore();
                    pipe.cmd("EXPIRE").arg(index_key).arg(ttl_secs).ignore();
                }
                let written: RedisResult<()> = pipe.query_async(&mut conn).await;
                written
            })
            .await
    }

    async fn remove_from_index(&self, index_key: String, tids: Vec<String>) {
        let count = tids.len();
        let removed: Result<i64, CacheError> = self
            .conn
            .run(|mut conn| async move {
                redis::cmd("ZREM").arg(&index_key).arg(&tids).query_async(&mut conn).await
            })
            .await;
        match removed {
            Ok(removed) => debug!(count, removed, "pruned dangling chat history index entries"),
            Err(error) => debug!(count, %error, "failed to prune chat history index"),
        }
    }
}

fn encode_batch(conversation_key: &str, messages: &[HistoryMessage]) -> Vec<PendingMessage> {
    messages
        .iter()
        .filter_map(|message| {
            let tid = extract_tid(message);
            let score = tid.parse::<i64>().ok()?;
            let payload = serde_json::to_string(message).ok()?;
            Some(PendingMessage { conversation_key: conversation_key.to_owned(), tid, score, payload })
        })
        .collect()
}

fn decode_message(payload: &str) -> Option<HistoryMessage> {
    match serde_json::from_str::<Value>(payload).ok()? {
        Value::Object(message) => Some(message),
        _ => None,
    }
}

/// `ZREVRANGEBYSCORE` max for a page ending before `before_tid`.
fn upper_score_bound(before_tid: &str) -> String {
    match before_tid.trim().parse::<i64>() {
        Ok(tid) if tid > 0 => (tid - 1).to_string(),
        _ => "+inf".to_owned(),
    }
}

fn spawn_writer(
    shared: Arc<Shared>,
    mut batches: mpsc::UnboundedReceiver<Vec<PendingMessage>>,
) -> Background {
    let task = tokio::spawn(async move {
        while let Some(mut batch) = batches.recv().await {
            while let Ok(next) = batches.try_recv() {
                batch.extend(next);
            }
            let count = batch.len();
            if let Err(error) = shared.write_batch(batch).await {
                warn!(count, %error, "chat history write failed");
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

#[cfg(test)]
mod tests {
    use super::{upper_score_bound, ChatHistoryCache, HistoryCacheOptions};
    use crate::cache::redis_conn::{RedisConn, RedisSettings};
    use liao_common::{history::extract_tid, types::HistoryMessage};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn msg(value: Value) -> HistoryMessage {
        value.as_object().cloned().expect("test message should be an object")
    }

    fn unreachable_cache(options: HistoryCacheOptions) -> ChatHistoryCache {
        let conn = RedisConn::open(&RedisSettings {
            url: Some("redis://127.0.0.1:1/0".into()),
            timeout: Duration::from_millis(500),
            ..RedisSettings::default()
        })
        .expect("handle should build without network");
        ChatHistoryCache::with_conn(conn, options)
    }

    async fn live_cache() -> Option<ChatHistoryCache> {
        let Some(url) = std::env::var("LIAO_TEST_REDIS_URL").ok() else {
            eprintln!("skipping redis chat history test: set LIAO_TEST_REDIS_URL to run it");
            return None;
        };
        let options = HistoryCacheOptions {
            prefix: format!("liao:test:{}:", uuid::Uuid::new_v4()),
            ..HistoryCacheOptions::default()
        };
        Some(
            ChatHistoryCache::connect(&RedisSettings::from_url(url), options)
                .await
                .expect("redis should be reachable"),
        )
    }

    #[test]
    fn before_tid_upper_bound_is_strict() {
        assert_eq!(upper_score_bound(""), "+inf");
        assert_eq!(upper_score_bound("0"), "+inf");
        assert_eq!(upper_score_bound("abc"), "+inf");
        assert_eq!(upper_score_bound("-4"), "+inf");
        assert_eq!(upper_score_bound(" 100 "), "99");
    }

    #[tokio::test]
    async fn batched_saves_dedup_by_tid_and_drop_invalid() {
        let cache = unreachable_cache(HistoryCacheOptions {
            flush_interval: Duration::from_secs(3600),
            ..HistoryCacheOptions::default()
        });

        cache.save_messages(
            "a_b",
            &[
                msg(json!({"Tid": "2", "content": "x"})),
                msg(json!({"Tid": "2", "content": "y"})),
                msg(json!({"Tid": "not-a-number", "content": "z"})),
                msg(json!({"content": "no tid"})),
            ],
        );

        assert_eq!(cache.pending_len(), 1);
        let payload = cache.pending_payload("a_b", "2").expect("Tid 2 should be pending");
        let stored: Value = serde_json::from_str(&payload).expect("payload should be json");
        assert_eq!(stored["content"], "y");
    }

    #[tokio::test]
    async fn unreachable_redis_reads_as_empty() {
        let cache = unreachable_cache(HistoryCacheOptions::default());
        cache.save_messages("a_b", &[msg(json!({"Tid": "1", "content": "x"}))]);

        assert!(cache.get_messages("a_b", "0", 10).await.is_empty());
        assert!(cache.try_get_messages("a_b", "0", 10).await.is_err());
        assert!(cache.get_messages("", "0", 10).await.is_empty());
        assert!(cache.try_get_messages("a_b", "0", 0).await.expect("zero limit is ok").is_empty());
    }

    #[tokio::test]
    async fn duplicate_tid_keeps_latest_content() {
        let Some(cache) = live_cache().await else {
            return;
        };

        cache.save_messages(
            "a_b",
            &[msg(json!({"Tid": "2", "content": "x"})), msg(json!({"Tid": "2", "content": "y"}))],
        );
        // Immediate mode writes on the writer task.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let messages = cache.get_messages("a_b", "0", 10).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"], "y");
        cache.close().await;
    }

    #[tokio::test]
    async fn separate_saves_of_one_tid_land_in_order() {
        let Some(url) = std::env::var("LIAO_TEST_REDIS_URL").ok() else {
            eprintln!("skipping redis chat history test: set LIAO_TEST_REDIS_URL to run it");
            return;
        };
        let settings = RedisSettings::from_url(url);
        let options = HistoryCacheOptions {
            prefix: format!("liao:test:{}:", uuid::Uuid::new_v4()),
            ..HistoryCacheOptions::default()
        };

        let writer = ChatHistoryCache::connect(&settings, options.clone())
            .await
            .expect("redis should be reachable");
        for content in ["draft", "final"] {
            writer.save_messages("a_b", &[msg(json!({"Tid": "9", "content": content}))]);
        }
        writer.close().await;

        let reader =
            ChatHistoryCache::connect(&settings, options).await.expect("redis should be reachable");
        let messages = reader.get_messages("a_b", "0", 10).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"], "final");
        reader.close().await;
    }

    #[tokio::test]
    async fn close_returns_with_queued_writes_on_unreachable_redis() {
        let cache = unreachable_cache(HistoryCacheOptions::default());
        cache.save_messages("a_b", &[msg(json!({"Tid": "1", "content": "x"}))]);
        cache.save_messages("a_b", &[msg(json!({"Tid": "2", "content": "y"}))]);

        tokio::time::timeout(Duration::from_secs(5), cache.close())
            .await
            .expect("close should not hang on an unreachable redis");
        cache.save_messages("a_b", &[msg(json!({"Tid": "3", "content": "z"}))]);
        assert_eq!(cache.pending_len(), 0);
    }

    #[tokio::test]
    async fn pages_are_descending_and_strictly_before() {
        let Some(cache) = live_cache().await else {
            return;
        };

        let batch: Vec<HistoryMessage> =
            (1..=6).map(|tid| msg(json!({"Tid": tid.to_string(), "content": "m"}))).collect();
        cache.save_messages("a_b", &batch);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let page = cache.get_messages("a_b", "5", 3).await;
        let tids: Vec<String> = page.iter().map(extract_tid).collect();
        assert_eq!(tids, vec!["4", "3", "2"]);
        cache.close().await;
    }
}
