use std::time::Instant;

use serde_json::{Map, Value};
use tracing::debug;

use super::user_info::{
    apply_last_messages, apply_user_infos, collect_conversation_keys, collect_user_ids,
    UserInfoCache,
};

/// Elapsed milliseconds of each lookup leg of [`enrich_user_list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichTimings {
    pub user_info_ms: u64,
    pub last_message_ms: u64,
}

/// Fill profile and last-message fields of every entry of `list` in place.
///
/// Both batch lookups run concurrently; results are merged once both finish.
pub async fn enrich_user_list(
    cache: &UserInfoCache,
    list: &mut [Map<String, Value>],
    id_key: &str,
    my_id: &str,
) -> EnrichTimings {
    if list.is_empty() {
        return EnrichTimings::default();
    }

    let started_at = Instant::now();
    let user_ids = collect_user_ids(list, id_key);
    let conversation_keys = collect_conversation_keys(list, my_id);

    let info_leg = async {
        let started_at = Instant::now();
        let infos = if user_ids.is_empty() {
            Default::default()
        } else {
            cache.batch_get_user_info(&user_ids).await
        };
        (infos, started_at.elapsed().as_millis() as u64)
    };
    let message_leg = async {
        let started_at = Instant::now();
        let messages = if conversation_keys.is_empty() {
            Default::default()
        } else {
            cache.batch_get_last_messages(&conversation_keys).await
        };
        (messages, started_at.elapsed().as_millis() as u64)
    };
    let ((infos, user_info_ms), (messages, last_message_ms)) = tokio::join!(info_leg, message_leg);

    apply_user_infos(list, id_key, &infos);
    apply_last_messages(list, my_id, &messages, cache.overwrites_last_message());

    debug!(
        backend = cache.backend_name(),
        entries = list.len(),
        user_info_ms,
        last_message_ms,
        total_ms = started_at.elapsed().as_millis() as u64,
        "enriched user list"
    );
    EnrichTimings { user_info_ms, last_message_ms }
}

#[cfg(test)]
mod tests {
    use super::enrich_user_list;
    use crate::cache::user_info::UserInfoCache;
    use liao_common::types::{CachedLastMessage, CachedUserInfo};
    use serde_json::{json, Map, Value};

    fn entry(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("test entry should be an object")
    }

    #[tokio::test]
    async fn fills_profile_and_preview_for_each_entry() {
        let cache = UserInfoCache::memory();
        cache.save_user_info(CachedUserInfo {
            user_id: "u2".into(),
            nickname: "Bob".into(),
            gender: "男".into(),
            age: "20".into(),
            address: "上海".into(),
            ..CachedUserInfo::default()
        });
        cache.save_last_message(CachedLastMessage {
            from_user_id: "me".into(),
            to_user_id: "u2".into(),
            content: "hello".into(),
            kind: "text".into(),
            time: "2024-01-01 10:00:00".into(),
            ..CachedLastMessage::default()
        });

        let mut list = vec![
            entry(json!({"id": "u2", "nickname": "kept"})),
            entry(json!({"id": "u2"})),
            entry(json!({"id": "u3"})),
        ];
        enrich_user_list(&cache, &mut list, "id", "me").await;

        assert_eq!(list[0]["nickname"], "kept");
        assert_eq!(list[0]["sex"], "男");
        assert_eq!(list[1]["nickname"], "Bob");
        assert_eq!(list[1]["lastMsg"], "我: hello");
        assert_eq!(list[1]["lastTime"], "2024-01-01 10:00:00");
        assert!(list[2].get("nickname").is_none());
        assert!(list[2].get("lastMsg").is_none());
    }

    #[tokio::test]
    async fn empty_inputs_short_circuit() {
        let cache = UserInfoCache::memory();
        let mut empty: Vec<Map<String, Value>> = Vec::new();
        let timings = enrich_user_list(&cache, &mut empty, "id", "me").await;
        assert_eq!(timings, Default::default());

        let mut list = vec![entry(json!({"id": "u2"}))];
        enrich_user_list(&cache, &mut list, "id", "").await;
        assert_eq!(list[0], entry(json!({"id": "u2"})));
    }
}
