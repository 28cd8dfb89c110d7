// Loose coercions over untyped upstream JSON.
//
// Upstream frames mix strings, integers and floats for the same field, so
// every reader goes through these helpers instead of `as_str()`.

use serde_json::{Map, Value};

/// Keys tried, in order, when a user map carries no explicit id key.
pub const USER_ID_KEYS: &[&str] = &["id", "UserID", "userid", "userId"];

/// Render a scalar as a string. Integral floats lose their fraction,
/// `null`, arrays and objects render as an empty string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.as_f64().map(|f| format!("{}", f.trunc() as i64)).unwrap_or_default()
            }
        }
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => String::new(),
    }
}

/// Like [`value_to_string`] for an optional map slot, then trimmed.
pub fn field_string(map: &Map<String, Value>, key: &str) -> String {
    map.get(key).map(value_to_string).unwrap_or_default().trim().to_owned()
}

/// Truthiness as upstream encodes it: `true`, `"true"`, `"1"`, non-zero numbers.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => {
            let normalized = s.trim().to_ascii_lowercase();
            normalized == "true" || normalized == "1"
        }
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

/// Integer view of a JSON number, truncating floats. Strings are not parsed.
pub fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        _ => None,
    }
}

/// First value that is present and not `null`.
pub fn first_present<'a>(candidates: &[Option<&'a Value>]) -> Option<&'a Value> {
    candidates.iter().flatten().copied().find(|value| !value.is_null())
}

/// Nested object lookup; absent or non-object values yield `None`.
pub fn get_object<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    map.get(key).and_then(Value::as_object)
}

/// Insert `value` unless the slot already holds a non-null value.
pub fn put_if_absent(map: &mut Map<String, Value>, key: &str, value: Value) {
    if value.is_null() {
        return;
    }
    match map.get(key) {
        Some(existing) if !existing.is_null() => {}
        _ => {
            map.insert(key.to_owned(), value);
        }
    }
}

/// Extract a user id from a list entry, checking `id_key` first and then
/// the [`USER_ID_KEYS`] fallbacks.
pub fn extract_user_id(map: &Map<String, Value>, id_key: &str) -> String {
    let explicit = id_key.trim();
    if !explicit.is_empty() {
        if let Some(value) = map.get(explicit).filter(|v| !v.is_null()) {
            return value_to_string(value).trim().to_owned();
        }
    }

    USER_ID_KEYS
        .iter()
        .find_map(|key| map.get(*key).filter(|v| !v.is_null()))
        .map(|value| value_to_string(value).trim().to_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("test value should be an object")
    }

    #[test]
    fn numbers_render_without_fraction() {
        assert_eq!(value_to_string(&json!(12)), "12");
        assert_eq!(value_to_string(&json!(12.0)), "12");
        assert_eq!(value_to_string(&json!(12.9)), "12");
        assert_eq!(value_to_string(&json!(null)), "");
        assert_eq!(value_to_string(&json!(true)), "true");
    }

    #[test]
    fn truthiness_follows_upstream_encoding() {
        assert!(value_to_bool(&json!(true)));
        assert!(value_to_bool(&json!(" TRUE ")));
        assert!(value_to_bool(&json!("1")));
        assert!(value_to_bool(&json!(2)));
        assert!(!value_to_bool(&json!(0)));
        assert!(!value_to_bool(&json!("yes")));
        assert!(!value_to_bool(&json!(null)));
    }

    #[test]
    fn put_if_absent_keeps_existing_non_null() {
        let mut map = object(json!({"nickname": "kept", "age": null}));
        put_if_absent(&mut map, "nickname", json!("replaced"));
        put_if_absent(&mut map, "age", json!("20"));
        put_if_absent(&mut map, "sex", Value::Null);

        assert_eq!(map["nickname"], "kept");
        assert_eq!(map["age"], "20");
        assert!(!map.contains_key("sex"));
    }

    #[test]
    fn user_id_prefers_explicit_key_then_fallbacks() {
        let map = object(json!({"UserID": 7, "peer": "p1"}));
        assert_eq!(extract_user_id(&map, "peer"), "p1");
        assert_eq!(extract_user_id(&map, "missing"), "7");
        assert_eq!(extract_user_id(&map, ""), "7");
        assert_eq!(extract_user_id(&object(json!({})), "id"), "");
    }

    #[test]
    fn first_present_skips_null_and_missing() {
        let map = object(json!({"a": null, "b": "x"}));
        let picked = first_present(&[map.get("missing"), map.get("a"), map.get("b")]);
        assert_eq!(picked, Some(&json!("x")));
    }
}
