// Cache population from upstream frames, ahead of the broadcast.

use std::sync::Arc;

use liao_common::{
    conversation::conversation_key,
    types::{CachedLastMessage, CachedUserInfo, HistoryMessage},
    value::{field_string, first_present, get_object, value_to_bool, value_to_i64, value_to_string},
};
use serde_json::{Map, Value};
use tracing::debug;

use super::Broker;
use crate::upstream::client::LocalIdentity;

const CODE_FORCEOUT: i64 = -3;
const CODE_USER_INFO: i64 = 15;
const CODE_CHAT_MESSAGE: i64 = 7;

impl Broker {
    /// Inspect one frame read from `identity`'s upstream, then broadcast it.
    ///
    /// An upstream force-out is handed to [`Broker::handle_forceout`], which
    /// does its own broadcast.
    pub async fn handle_upstream_frame(self: &Arc<Self>, identity: &LocalIdentity, raw: &str) {
        if let Ok(Value::Object(node)) = serde_json::from_str::<Value>(raw) {
            let code = node.get("code").and_then(value_to_i64).unwrap_or(0);
            let forceout = node.get("forceout").is_some_and(value_to_bool);

            if code == CODE_FORCEOUT && forceout {
                self.handle_forceout(&identity.id, raw).await;
                return;
            }
            if code == CODE_USER_INFO {
                if let Some(info) = user_info_from_frame(&node) {
                    self.caches().user_info.save_user_info(info);
                }
            }
            if code == CODE_CHAT_MESSAGE {
                self.record_chat_message(identity, &node);
            }
        }

        self.broadcast_to_downstream(&identity.id, raw).await;
    }

    fn record_chat_message(&self, identity: &LocalIdentity, node: &Map<String, Value>) {
        let message = ChatMessage::from_frame(node);

        for last in message.last_message_writes(identity) {
            self.caches().user_info.save_last_message(last);
        }

        let writes = message.history_writes(identity);
        if writes.is_empty() {
            return;
        }
        let Some(history) = &self.caches().history else {
            return;
        };
        debug!(identity = %identity.id, tid = %message.tid, keys = writes.len(), "recording chat history");
        for (key, entry) in writes {
            history.save_messages(&key, &[entry]);
        }
    }
}

fn user_info_from_frame(node: &Map<String, Value>) -> Option<CachedUserInfo> {
    let user_id = field_string(node, "sel_userid");
    if user_id.is_empty() {
        return None;
    }
    let raw = |key: &str| node.get(key).map(value_to_string).unwrap_or_default();
    Some(CachedUserInfo {
        user_id,
        nickname: raw("sel_userNikename"),
        gender: raw("sel_userSex"),
        age: raw("sel_userAge"),
        address: raw("sel_userAddress"),
        ..CachedUserInfo::default()
    })
}

/// Fields of a code-7 frame. Per-message fields prefer `fromuser` over the top level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ChatMessage {
    from_id: String,
    to_id: String,
    content: String,
    time: String,
    kind: String,
    tid: String,
    nickname: String,
}

impl ChatMessage {
    fn from_frame(node: &Map<String, Value>) -> Self {
        let empty = Map::new();
        let from_user = get_object(node, "fromuser").unwrap_or(&empty);
        let to_user = get_object(node, "touser").unwrap_or(&empty);

        let pick = |candidates: &[(&Map<String, Value>, &str)]| -> String {
            let values: Vec<Option<&Value>> =
                candidates.iter().map(|(map, key)| map.get(*key)).collect();
            first_present(&values).map(value_to_string).unwrap_or_default().trim().to_owned()
        };

        let kind = pick(&[(from_user, "type"), (node, "type")]);
        Self {
            from_id: field_string(from_user, "id"),
            to_id: field_string(to_user, "id"),
            content: pick(&[(from_user, "content"), (node, "content")]),
            time: pick(&[(from_user, "time"), (node, "time")]),
            kind: if kind.is_empty() { "text".to_owned() } else { kind },
            tid: pick(&[(from_user, "Tid"), (from_user, "tid"), (node, "Tid"), (node, "tid")]),
            nickname: pick(&[
                (from_user, "nickname"),
                (from_user, "name"),
                (node, "nickname"),
                (node, "name"),
            ]),
        }
    }

    fn last_message(&self, from: &str, to: &str) -> CachedLastMessage {
        CachedLastMessage {
            from_user_id: from.to_owned(),
            to_user_id: to.to_owned(),
            content: self.content.clone(),
            kind: self.kind.clone(),
            time: self.time.clone(),
            ..CachedLastMessage::default()
        }
    }

    /// The natural pair, plus two bridging entries when the local identity
    /// is neither side of the message.
    fn last_message_writes(&self, identity: &LocalIdentity) -> Vec<CachedLastMessage> {
        if self.from_id.is_empty()
            || self.to_id.is_empty()
            || self.content.is_empty()
            || self.time.is_empty()
        {
            return Vec::new();
        }

        let mut writes = vec![self.last_message(&self.from_id, &self.to_id)];
        if identity.id != self.from_id && identity.id != self.to_id {
            writes.push(self.last_message(&self.from_id, &identity.id));
            writes.push(self.last_message(&identity.id, &self.to_id));
        }
        writes
    }

    /// `(conversation key, history entry)` pairs, one per distinct key.
    ///
    /// A side equal to the md5 of the local identity is stored as the
    /// identity itself.
    fn history_writes(&self, identity: &LocalIdentity) -> Vec<(String, HistoryMessage)> {
        if self.tid.is_empty() || self.content.is_empty() || self.time.is_empty() {
            return Vec::new();
        }

        let normalize = |side: &str| -> String {
            if !identity.md5.is_empty() && side.eq_ignore_ascii_case(&identity.md5) {
                identity.id.clone()
            } else {
                side.to_owned()
            }
        };
        let from = normalize(&self.from_id);
        let to = normalize(&self.to_id);

        let mut entry = HistoryMessage::new();
        entry.insert("Tid".into(), Value::String(self.tid.clone()));
        entry.insert("id".into(), Value::String(from.clone()));
        entry.insert("toid".into(), Value::String(to.clone()));
        entry.insert("content".into(), Value::String(self.content.clone()));
        entry.insert("time".into(), Value::String(self.time.clone()));
        if !self.nickname.is_empty() {
            entry.insert("nickname".into(), Value::String(self.nickname.clone()));
        }

        let mut keys = vec![conversation_key(&from, &to)];
        if !identity.id.is_empty() && identity.id != from && identity.id != to {
            keys.push(conversation_key(&from, &identity.id));
            keys.push(conversation_key(&identity.id, &to));
        }

        let mut writes: Vec<(String, HistoryMessage)> = Vec::with_capacity(keys.len());
        for key in keys {
            if key.is_empty() || writes.iter().any(|(existing, _)| *existing == key) {
                continue;
            }
            writes.push((key, entry.clone()));
        }
        writes
    }
}
