//! Lenient JSON extraction from model output.
//!
//! Models wrap JSON in code fences, prefix it with prose, or trail it with
//! explanations. We try, in order: the whole text, the first fenced block,
//! and every balanced `{…}` / `[…]` span.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use archivist_shared::{ArchivistError, Result};

/// Parse the first JSON value found in `text`.
pub fn extract_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ArchivistError::parse("judge returned an empty answer"));
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)```").expect("valid regex")
    });
    if let Some(body) = FENCE_RE.captures(trimmed).and_then(|c| c.get(1)) {
        if let Ok(value) = serde_json::from_str(body.as_str().trim()) {
            return Ok(value);
        }
    }

    for (start, ch) in trimmed.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        if let Some(end) = balanced_end(&trimmed[start..]) {
            if let Ok(value) = serde_json::from_str(&trimmed[start..start + end]) {
                return Ok(value);
            }
        }
    }

    let preview: String = trimmed.chars().take(120).collect();
    Err(ArchivistError::parse(format!(
        "no JSON value found in judge answer: {preview}"
    )))
}

/// Byte length of the bracketed span starting at the first character of `s`.
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}
