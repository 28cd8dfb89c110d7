// Chat-history identity and merge rules.

use std::collections::HashSet;

use crate::types::HistoryMessage;
use crate::value::{field_string, value_to_string};

/// Message id, preferring `Tid` over `tid`. Trimmed; empty when absent.
pub fn extract_tid(message: &HistoryMessage) -> String {
    ["Tid", "tid"]
        .iter()
        .find_map(|key| message.get(*key).filter(|value| !value.is_null()))
        .map(|value| value_to_string(value).trim().to_owned())
        .unwrap_or_default()
}

/// Key used to collapse duplicates when merging pages.
///
/// `Tid` is authoritative when present, so two distinct messages sharing a
/// Tid collapse. Without a Tid the key falls back to sender, recipient, time
/// and content. A message with none of those yields an empty key and is
/// never treated as a duplicate.
pub fn dedup_key(message: &HistoryMessage) -> String {
    let tid = extract_tid(message);
    if !tid.is_empty() {
        return format!("tid:{tid}");
    }

    let id = field_string(message, "id");
    let toid = field_string(message, "toid");
    let content = field_string(message, "content");
    let time = field_string(message, "time");
    if id.is_empty() && toid.is_empty() && content.is_empty() && time.is_empty() {
        return String::new();
    }
    format!("fallback:{id}|{toid}|{time}|{content}")
}

/// Concatenate `primary` then `secondary`, keeping the first occurrence of
/// every dedup key. `limit <= 0` means unlimited.
pub fn merge_history_messages(
    primary: &[HistoryMessage],
    secondary: &[HistoryMessage],
    limit: i64,
) -> Vec<HistoryMessage> {
    let cap = usize::try_from(limit).ok().filter(|cap| *cap > 0);
    let mut seen = HashSet::with_capacity(primary.len() + secondary.len());
    let mut merged = Vec::with_capacity(primary.len() + secondary.len());

    for message in primary.iter().chain(secondary) {
        if cap.is_some_and(|cap| merged.len() >= cap) {
            break;
        }
        let key = dedup_key(message);
        if !key.is_empty() && !seen.insert(key) {
            continue;
        }
        merged.push(message.clone());
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::{dedup_key, extract_tid, merge_history_messages};
    use crate::types::HistoryMessage;
    use serde_json::{json, Value};

    fn msg(value: Value) -> HistoryMessage {
        value.as_object().cloned().expect("test message should be an object")
    }

    #[test]
    fn tid_prefers_capitalized_field() {
        assert_eq!(extract_tid(&msg(json!({"Tid": " 12 ", "tid": "9"}))), "12");
        assert_eq!(extract_tid(&msg(json!({"tid": 9}))), "9");
        assert_eq!(extract_tid(&msg(json!({"Tid": null, "tid": "3"}))), "3");
        assert_eq!(extract_tid(&msg(json!({}))), "");
    }

    #[test]
    fn dedup_key_falls_back_to_content_tuple() {
        assert_eq!(dedup_key(&msg(json!({"Tid": "5"}))), "tid:5");
        assert_eq!(
            dedup_key(&msg(json!({"id": "a", "toid": "b", "time": "t", "content": "c"}))),
            "fallback:a|b|t|c"
        );
        assert_eq!(dedup_key(&msg(json!({"nickname": "x"}))), "");
    }

    #[test]
    fn merge_keeps_first_occurrence_and_respects_limit() {
        let primary = vec![msg(json!({"Tid": "3", "content": "p3"})), msg(json!({"Tid": "2"}))];
        let secondary = vec![
            msg(json!({"Tid": "3", "content": "s3"})),
            msg(json!({"Tid": "1"})),
            msg(json!({"Tid": "0"})),
        ];

        let merged = merge_history_messages(&primary, &secondary, 3);
        let tids: Vec<String> = merged.iter().map(extract_tid).collect();
        assert_eq!(tids, vec!["3", "2", "1"]);
        assert_eq!(merged[0]["content"], "p3");
    }

    #[test]
    fn merge_without_limit_and_keyless_entries() {
        let primary = vec![msg(json!({})), msg(json!({}))];
        let secondary = vec![msg(json!({"Tid": "1"})), msg(json!({"Tid": "1"}))];

        let merged = merge_history_messages(&primary, &secondary, 0);
        assert_eq!(merged.len(), 3);
    }
}
