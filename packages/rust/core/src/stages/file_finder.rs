//! File finder stage: choose which PDFs to download for each entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use archivist_judge::{Judge, JudgeSchema};
use archivist_shared::{PipelineState, Result, StateUpdate};

use super::{ask, string_list};
use crate::graph::{Node, StageId};
use crate::prompts::file_finder_prompt;

const FIELD: &str = "pdfs_to_download";

fn schema() -> JudgeSchema {
    JudgeSchema::new(
        "pdf_selection",
        json!({
            "type": "object",
            "properties": {
                FIELD: {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "List of PDF file names to download for this item"
                }
            },
            "required": [FIELD],
            "additionalProperties": false
        }),
    )
}

fn decode(value: serde_json::Value) -> Result<Vec<String>> {
    string_list(value, FIELD)
}

/// Pick the files worth downloading for each confirmed entry.
///
/// Only names present in the item's file listing are kept. A failed selection
/// is recorded and the remaining entries are still processed.
pub struct FileFinderNode {
    judge: Arc<dyn Judge>,
}

impl FileFinderNode {
    pub fn new(judge: Arc<dyn Judge>) -> Self {
        Self { judge }
    }
}

#[async_trait]
impl Node for FileFinderNode {
    fn id(&self) -> StageId {
        StageId::FileFinder
    }

    async fn run(&self, state: &PipelineState) -> Result<StateUpdate> {
        let entries = state.entries_to_consider();
        if entries.is_empty() {
            return Ok(StateUpdate::new()
                .pdfs_to_download(BTreeMap::new())
                .error("No entries_to_consider information to check"));
        }
        info!(count = entries.len(), "selecting files");

        let mut selected: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut errors = Vec::new();

        for identifier in entries {
            let files = state
                .metadata
                .as_ref()
                .and_then(|m| m.get(identifier))
                .map(|item| item.files.as_slice())
                .unwrap_or_default();
            if files.is_empty() {
                errors.push(format!("No files present for entry {identifier}"));
                continue;
            }

            let prompt = file_finder_prompt(&state.query, identifier, files);
            let names = match ask(self.judge.as_ref(), &prompt, &schema(), decode).await {
                Ok(names) => names,
                Err(e) => {
                    warn!(%identifier, error = %e, "file selection failed");
                    errors.push(format!("File finder error for {identifier}: {e}"));
                    continue;
                }
            };

            let mut keep: Vec<String> = Vec::new();
            for name in names {
                if !files.iter().any(|f| f.name == name) {
                    debug!(%identifier, file = %name, "judge picked a file not in the listing");
                } else if !keep.contains(&name) {
                    keep.push(name);
                }
            }
            debug!(%identifier, count = keep.len(), "files selected");
            selected.insert(identifier.clone(), keep);
        }

        info!(entries = selected.len(), "file selection done");
        Ok(StateUpdate::new().pdfs_to_download(selected).errors(errors))
    }
}
