//! The eight pipeline stages.
//!
//! Judge-backed stages share [`ask`]: structured output first, then plain text
//! with format instructions decoded by [`extract_json`].

mod cache_nodes;
mod downloader;
mod file_finder;
mod filter;
mod finder;
mod metadata;
mod search;

use serde_json::Value;
use tracing::warn;

use archivist_judge::{Judge, JudgeSchema, extract_json};
use archivist_shared::{ArchivistError, Result};

use crate::prompts::with_format_instructions;

pub use cache_nodes::{CacheReadNode, CacheWriteNode};
pub use downloader::DownloaderNode;
pub use file_finder::FileFinderNode;
pub use filter::FilterNode;
pub use finder::FinderNode;
pub use metadata::MetadataNode;
pub use search::SearchNode;

/// Ask the judge and decode its answer.
///
/// A failed structured call, or a structured answer `decode` rejects, falls
/// back to a plain-text call with format instructions appended.
pub(crate) async fn ask<T>(
    judge: &dyn Judge,
    prompt: &str,
    schema: &JudgeSchema,
    decode: fn(Value) -> Result<T>,
) -> Result<T> {
    let structured = judge
        .invoke_structured(prompt, schema)
        .await
        .and_then(decode);

    match structured {
        Ok(answer) => Ok(answer),
        Err(e) => {
            warn!(schema = schema.name, error = %e, "structured output failed, falling back to text");
            let text = judge
                .invoke(&with_format_instructions(prompt, schema))
                .await?;
            decode(extract_json(&text)?)
        }
    }
}

/// Read a list of strings from `value[field]`, or from `value` itself if it is a bare list.
/// Any non-string entry makes the whole answer a parse error.
pub(crate) fn string_list(value: Value, field: &str) -> Result<Vec<String>> {
    let list = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(field) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ArchivistError::parse(format!(
                    "'{field}' should be a list, got {other}"
                )));
            }
            None => {
                return Err(ArchivistError::parse(format!("answer has no '{field}' field")));
            }
        },
        other => {
            return Err(ArchivistError::parse(format!(
                "expected an object with '{field}', got {other}"
            )));
        }
    };

    list.into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s),
            other => Err(ArchivistError::parse(format!(
                "'{field}' should only hold strings, got {other}"
            ))),
        })
        .collect()
}
