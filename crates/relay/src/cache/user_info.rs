// User-info and last-message cache: one contract, two backends.

use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::Utc;
use liao_common::{
    conversation::conversation_key,
    preview::{format_last_message, last_time_or_now},
    types::{CachedLastMessage, CachedUserInfo},
    value::{extract_user_id, put_if_absent},
};
use serde_json::{Map, Value};

use super::user_info_redis::RedisUserInfoCache;

pub enum UserInfoCache {
    Memory(MemoryUserInfoCache),
    Redis(RedisUserInfoCache),
}

impl UserInfoCache {
    pub fn memory() -> Self {
        Self::Memory(MemoryUserInfoCache::default())
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Redis(_) => "redis",
        }
    }

    /// Store `info`, stamping its update time. Blank ids are ignored.
    pub fn save_user_info(&self, info: CachedUserInfo) {
        match self {
            Self::Memory(cache) => cache.save_user_info(info),
            Self::Redis(cache) => cache.save_user_info(info),
        }
    }

    pub async fn get_user_info(&self, user_id: &str) -> Option<CachedUserInfo> {
        match self {
            Self::Memory(cache) => cache.get_user_info(user_id),
            Self::Redis(cache) => cache.get_user_info(user_id).await,
        }
    }

    /// Fill profile fields of `data` that are absent or null.
    pub async fn enrich_user_info(&self, user_id: &str, data: &mut Map<String, Value>) {
        if let Some(info) = self.get_user_info(user_id).await {
            apply_user_info(data, &info);
        }
    }

    /// [`Self::enrich_user_info`] for every entry of `list`, using `id_key`
    /// to locate each entry's user id.
    pub async fn batch_enrich_user_info(&self, list: &mut [Map<String, Value>], id_key: &str) {
        if list.is_empty() {
            return;
        }
        let ids = collect_user_ids(list, id_key);
        if ids.is_empty() {
            return;
        }

        let infos = self.batch_get_user_info(&ids).await;
        apply_user_infos(list, id_key, &infos);
    }

    /// Store `message` under its conversation key, stamping its update time.
    pub fn save_last_message(&self, message: CachedLastMessage) {
        match self {
            Self::Memory(cache) => cache.save_last_message(message),
            Self::Redis(cache) => cache.save_last_message(message),
        }
    }

    pub async fn get_last_message(&self, my_id: &str, other_id: &str) -> Option<CachedLastMessage> {
        match self {
            Self::Memory(cache) => cache.get_last_message(my_id, other_id),
            Self::Redis(cache) => cache.get_last_message(my_id, other_id).await,
        }
    }

    /// Write `lastMsg`/`lastTime` for every list entry with a cached message.
    pub async fn batch_enrich_with_last_message(&self, list: &mut [Map<String, Value>], my_id: &str) {
        let keys = collect_conversation_keys(list, my_id);
        if keys.is_empty() {
            return;
        }

        let messages = self.batch_get_last_messages(&keys).await;
        apply_last_messages(list, my_id, &messages, self.overwrites_last_message());
    }

    pub(crate) async fn batch_get_user_info(
        &self,
        user_ids: &[String],
    ) -> HashMap<String, CachedUserInfo> {
        match self {
            Self::Memory(cache) => cache.batch_get_user_info(user_ids),
            Self::Redis(cache) => cache.batch_get_user_info(user_ids).await,
        }
    }

    pub(crate) async fn batch_get_last_messages(
        &self,
        keys: &[String],
    ) -> HashMap<String, CachedLastMessage> {
        match self {
            Self::Memory(cache) => cache.batch_get_last_messages(keys),
            Self::Redis(cache) => cache.batch_get_last_messages(keys).await,
        }
    }

    /// The redis backend always refreshes list previews; the memory backend
    /// leaves values the caller already filled in.
    pub(crate) fn overwrites_last_message(&self) -> bool {
        matches!(self, Self::Redis(_))
    }

    /// Stop background flushing and release the backend.
    pub async fn close(&self) {
        if let Self::Redis(cache) = self {
            cache.close().await;
        }
    }
}

/// Process-local backend. Getters hand out clones.
#[derive(Default)]
pub struct MemoryUserInfoCache {
    inner: RwLock<MemoryTables>,
}

#[derive(Default)]
struct MemoryTables {
    user_info: HashMap<String, CachedUserInfo>,
    last_messages: HashMap<String, CachedLastMessage>,
}

impl MemoryUserInfoCache {
    pub fn save_user_info(&self, mut info: CachedUserInfo) {
        if info.user_id.trim().is_empty() {
            return;
        }
        info.update_time_millis = Utc::now().timestamp_millis();
        self.write().user_info.insert(info.user_id.clone(), info);
    }

    pub fn get_user_info(&self, user_id: &str) -> Option<CachedUserInfo> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return None;
        }
        self.read().user_info.get(user_id).cloned()
    }

    pub fn save_last_message(&self, mut message: CachedLastMessage) {
        let key = conversation_key(&message.from_user_id, &message.to_user_id);
        if key.is_empty() {
            return;
        }
        message.conversation_key = key.clone();
        message.update_time_millis = Utc::now().timestamp_millis();
        self.write().last_messages.insert(key, message);
    }

    pub fn get_last_message(&self, my_id: &str, other_id: &str) -> Option<CachedLastMessage> {
        let key = conversation_key(my_id.trim(), other_id.trim());
        if key.is_empty() {
            return None;
        }
        self.read().last_messages.get(&key).cloned()
    }

    fn batch_get_user_info(&self, user_ids: &[String]) -> HashMap<String, CachedUserInfo> {
        let tables = self.read();
        user_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .filter_map(|id| tables.user_info.get(id).map(|info| (id.to_owned(), info.clone())))
            .collect()
    }

    fn batch_get_last_messages(&self, keys: &[String]) -> HashMap<String, CachedLastMessage> {
        let tables = self.read();
        keys.iter()
            .map(|key| key.trim())
            .filter(|key| !key.is_empty())
            .filter_map(|key| tables.last_messages.get(key).map(|msg| (key.to_owned(), msg.clone())))
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryTables> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryTables> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn apply_user_info(data: &mut Map<String, Value>, info: &CachedUserInfo) {
    put_if_absent(data, "nickname", Value::String(info.nickname.clone()));
    put_if_absent(data, "sex", Value::String(info.gender.clone()));
    put_if_absent(data, "age", Value::String(info.age.clone()));
    put_if_absent(data, "address", Value::String(info.address.clone()));
}

pub(crate) fn apply_user_infos(
    list: &mut [Map<String, Value>],
    id_key: &str,
    infos: &HashMap<String, CachedUserInfo>,
) {
    if infos.is_empty() {
        return;
    }
    for entry in list.iter_mut() {
        let user_id = extract_user_id(entry, id_key);
        if let Some(info) = infos.get(&user_id) {
            apply_user_info(entry, info);
        }
    }
}

pub(crate) fn apply_last_messages(
    list: &mut [Map<String, Value>],
    my_id: &str,
    messages: &HashMap<String, CachedLastMessage>,
    overwrite: bool,
) {
    let my_id = my_id.trim();
    if messages.is_empty() || my_id.is_empty() {
        return;
    }

    for entry in list.iter_mut() {
        let other_id = extract_user_id(entry, "");
        let key = conversation_key(my_id, &other_id);
        let Some(message) = messages.get(&key) else {
            continue;
        };

        let preview = Value::String(format_last_message(message, my_id));
        let time = Value::String(last_time_or_now(&message.time));
        if overwrite {
            entry.insert("lastMsg".into(), preview);
            entry.insert("lastTime".into(), time);
        } else {
            put_if_absent(entry, "lastMsg", preview);
            put_if_absent(entry, "lastTime", time);
        }
    }
}

/// Distinct non-blank user ids of `list`, in first-seen order.
pub(crate) fn collect_user_ids(list: &[Map<String, Value>], id_key: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(list.len());
    list.iter()
        .map(|entry| extract_user_id(entry, id_key))
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

/// Distinct conversation keys between `my_id` and each list entry.
pub(crate) fn collect_conversation_keys(list: &[Map<String, Value>], my_id: &str) -> Vec<String> {
    let my_id = my_id.trim();
    if my_id.is_empty() {
        return Vec::new();
    }

    let mut seen = std::collections::HashSet::with_capacity(list.len());
    list.iter()
        .map(|entry| conversation_key(my_id, &extract_user_id(entry, "")))
        .filter(|key| !key.is_empty() && seen.insert(key.clone()))
        .collect()
}
