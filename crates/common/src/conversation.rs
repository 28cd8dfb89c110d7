// Conversation addressing for two-party chats.

/// Symmetric key for the conversation between `a` and `b`.
///
/// The lexicographically smaller id comes first, so both directions map to
/// the same key. Returns an empty string when either side is empty.
pub fn conversation_key(a: &str, b: &str) -> String {
    if a.is_empty() || b.is_empty() {
        return String::new();
    }

    if a <= b {
        format!("{a}_{b}")
    } else {
        format!("{b}_{a}")
    }
}
