//! Byte-bounded JSON encoding.
//!
//! [`encode_within`] serializes a value and, when the result is longer than the limit,
//! shortens the longest string fields until it fits. The output is always valid JSON. When no
//! string can be shortened enough, the value is replaced by a small `{"truncated":true,...}`
//! marker object.

use crate::error::SinkError;
use serde::Serialize;
use serde_json::Value;

/// Appended to every shortened string.
pub const ELLIPSIS: &str = "...[truncated]";

const MAX_PASSES: usize = 64;

/// Smallest limit that can hold a JSON document (`{}`).
pub const MIN_LIMIT: usize = 2;

/// Result of [`encode_within`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub json: String,
    /// Length of the untruncated encoding.
    pub original_len: usize,
}

impl Encoded {
    pub fn truncated(&self) -> bool {
        self.json.len() < self.original_len
    }
}

/// Serialize `value` into at most `max_bytes` bytes of JSON.
///
/// Fails when `value` cannot be serialized at all, or when `max_bytes` is below [`MIN_LIMIT`].
pub fn encode_within<T>(value: &T, max_bytes: usize) -> Result<Encoded, SinkError>
where
    T: Serialize + ?Sized,
{
    if max_bytes < MIN_LIMIT {
        return Err(SinkError::Other(format!("limit of {max_bytes} bytes cannot hold a JSON document").into()));
    }
    let mut tree = serde_json::to_value(value)?;
    let mut json = serde_json::to_string(&tree)?;
    let original_len = json.len();
    if original_len <= max_bytes {
        return Ok(Encoded { json, original_len });
    }

    for _ in 0..MAX_PASSES {
        let overshoot = json.len() - max_bytes;
        let Some(longest) = longest_string(&mut tree) else {
            break;
        };
        if longest.len() <= ELLIPSIS.len() {
            break;
        }
        // each removed byte shrinks the encoding by at least one byte
        let keep = longest.len().saturating_sub(overshoot + ELLIPSIS.len());
        cut(longest, keep);
        json = serde_json::to_string(&tree)?;
        if json.len() <= max_bytes {
            tracing::warn!(original = original_len, limit = max_bytes, "payload truncated");
            return Ok(Encoded { json, original_len });
        }
    }

    let marker = serde_json::json!({ "truncated": true, "original_bytes": original_len });
    let mut json = marker.to_string();
    if json.len() > max_bytes {
        json = "{}".to_string();
    }
    tracing::warn!(original = original_len, limit = max_bytes, "payload replaced by truncation marker");
    Ok(Encoded { json, original_len })
}

/// Cut `text` to at most `max_bytes` bytes on a char boundary, appending [`ELLIPSIS`] when
/// anything was removed and room allows.
pub fn truncate_str(text: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if text.len() <= max_bytes {
        return text.into();
    }
    if max_bytes < ELLIPSIS.len() {
        return text[..floor_char_boundary(text, max_bytes)].to_string().into();
    }
    let end = floor_char_boundary(text, max_bytes - ELLIPSIS.len());
    format!("{}{}", &text[..end], ELLIPSIS).into()
}

fn cut(text: &mut String, keep: usize) {
    let end = floor_char_boundary(text, keep);
    text.truncate(end);
    text.push_str(ELLIPSIS);
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut end = index;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    end
}

fn longest_string(value: &mut Value) -> Option<&mut String> {
    match value {
        Value::String(s) => Some(s),
        Value::Array(items) => items.iter_mut().filter_map(longest_string).max_by_key(|s| s.len()),
        Value::Object(map) => map.values_mut().filter_map(longest_string).max_by_key(|s| s.len()),
        _ => None,
    }
}
