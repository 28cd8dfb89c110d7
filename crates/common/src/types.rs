// Cached entity types shared by the broker caches and their callers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A chat-history entry as delivered by upstream. The canonical fields are
/// `Tid`, `id`, `toid`, `content`, `time` and an optional `nickname`, but any
/// extra keys are carried through untouched.
pub type HistoryMessage = Map<String, Value>;

/// Profile snapshot for a single user, keyed by `user_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CachedUserInfo {
    pub user_id: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub age: String,
    #[serde(default)]
    pub address: String,
    /// Milliseconds since the unix epoch of the last save.
    #[serde(default, rename = "updateTime")]
    pub update_time_millis: i64,
}

/// Most recent message exchanged between two users.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CachedLastMessage {
    /// Symmetric key, see [`crate::conversation::conversation_key`].
    #[serde(default)]
    pub conversation_key: String,
    #[serde(default)]
    pub from_user_id: String,
    #[serde(default)]
    pub to_user_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub time: String,
    #[serde(default, rename = "updateTime")]
    pub update_time_millis: i64,
}

#[cfg(test)]
mod tests {
    use super::{CachedLastMessage, CachedUserInfo};

    #[test]
    fn user_info_uses_camel_case_wire_names() {
        let info = CachedUserInfo {
            user_id: "u1".into(),
            nickname: "alice".into(),
            update_time_millis: 42,
            ..CachedUserInfo::default()
        };

        let json = serde_json::to_value(&info).expect("user info should serialize");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["nickname"], "alice");
        assert_eq!(json["updateTime"], 42);
    }

    #[test]
    fn last_message_decodes_with_missing_fields() {
        let msg: CachedLastMessage =
            serde_json::from_str(r#"{"fromUserId":"a","toUserId":"b","type":"image"}"#)
                .expect("partial last message should decode");

        assert_eq!(msg.from_user_id, "a");
        assert_eq!(msg.kind, "image");
        assert!(msg.content.is_empty());
        assert_eq!(msg.update_time_millis, 0);
    }
}
