// Last-message preview formatting for conversation lists.

use crate::types::CachedLastMessage;

/// Preview used when a message has no renderable text.
pub const EMPTY_PREVIEW: &str = "[消息]";
/// `lastTime` placeholder for messages without a timestamp.
pub const JUST_NOW: &str = "刚刚";
const SELF_PREFIX: &str = "我: ";
const PREVIEW_MAX_CHARS: usize = 30;
const MAX_FILE_EXT_LEN: usize = 10;

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];
const VIDEO_EXTS: &[&str] = &["mp4", "webm", "ogg", "mov", "avi", "mkv", "wmv", "flv"];
const AUDIO_EXTS: &[&str] = &["mp3", "wav", "aac", "flac"];

/// Media bucket of an uploaded attachment. Variant order is label priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

impl MediaKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Image => "[图片]",
            Self::Video => "[视频]",
            Self::Audio => "[音频]",
            Self::File => "[文件]",
        }
    }
}

/// Classify the body of a `[...]` token by its suffix.
///
/// Only bodies that look like an upload path qualify: they must contain a
/// `/`, `\` or `.` and must not contain whitespace or a URL scheme. Anything
/// else (`[doge]`, `[a b]`) is plain text and yields `None`.
pub fn classify_bracket_body(body: &str) -> Option<MediaKind> {
    let path = body.trim();
    if path.is_empty() || path.contains("://") || path.chars().any(char::is_whitespace) {
        return None;
    }
    if !path.contains(['/', '\\', '.']) {
        return None;
    }

    let mut lower = path.to_lowercase();
    if let Some(idx) = lower.find('?') {
        lower.truncate(idx);
    }
    if let Some(idx) = lower.find('#') {
        lower.truncate(idx);
    }

    let file_name = lower.rsplit(['/', '\\']).next().unwrap_or(&lower);
    let ext = match file_name.rsplit_once('.') {
        Some((_, ext)) => ext,
        None => return Some(MediaKind::File),
    };
    // Past this it is a dotted word, not a file name.
    if ext.is_empty()
        || ext.len() > MAX_FILE_EXT_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }

    if IMAGE_EXTS.contains(&ext) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTS.contains(&ext) {
        Some(MediaKind::Video)
    } else if AUDIO_EXTS.contains(&ext) {
        Some(MediaKind::Audio)
    } else {
        Some(MediaKind::File)
    }
}

/// Build the list preview for `content`.
///
/// Media tokens are removed from the text and summarized by a single label
/// (highest priority wins) appended after the remaining text, which is
/// truncated to 30 characters.
pub fn format_preview(content: &str, from_self: bool) -> String {
    let prefix = if from_self { SELF_PREFIX } else { "" };
    if content.is_empty() {
        return format!("{prefix}{EMPTY_PREVIEW}");
    }

    let mut text = String::with_capacity(content.len());
    let mut best: Option<MediaKind> = None;
    let mut rest = content;

    while let Some(open) = rest.find('[') {
        let Some(close_rel) = rest[open + 1..].find(']') else {
            break;
        };
        let close = open + 1 + close_rel;

        text.push_str(&rest[..open]);
        match classify_bracket_body(&rest[open + 1..close]) {
            Some(kind) => best = Some(best.map_or(kind, |current| current.min(kind))),
            None => text.push_str(&rest[open..=close]),
        }
        rest = &rest[close + 1..];
    }
    text.push_str(rest);

    let text = truncate_chars(text.trim(), PREVIEW_MAX_CHARS);
    match (text.is_empty(), best) {
        (true, Some(kind)) => format!("{prefix}{}", kind.label()),
        (true, None) => format!("{prefix}{EMPTY_PREVIEW}"),
        (false, Some(kind)) => format!("{prefix}{text} {}", kind.label()),
        (false, None) => format!("{prefix}{text}"),
    }
}

/// Preview of `msg` as seen by `my_id`.
pub fn format_last_message(msg: &CachedLastMessage, my_id: &str) -> String {
    format_preview(&msg.content, !my_id.is_empty() && msg.from_user_id == my_id)
}

/// The stored time string, or [`JUST_NOW`] when blank.
pub fn last_time_or_now(time: &str) -> String {
    if time.trim().is_empty() {
        JUST_NOW.to_owned()
    } else {
        time.to_owned()
    }
}

fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &input[..idx]),
        None => input.to_owned(),
    }
}
