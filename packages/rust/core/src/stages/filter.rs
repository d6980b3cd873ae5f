//! Filter stage: the judge prunes search results to plausible candidates.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use archivist_judge::{Judge, JudgeSchema};
use archivist_shared::{ArchivistError, PipelineState, Result, StateUpdate};

use super::{ask, string_list};
use crate::graph::{Node, StageId};
use crate::prompts::filter_prompt;

const FIELD: &str = "filtered_results";

fn schema() -> JudgeSchema {
    JudgeSchema::new(
        "filter_results",
        json!({
            "type": "object",
            "properties": {
                FIELD: {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "List of item identifiers filtered as relevant"
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

/// Keep every result and record why the judge's answer was unusable.
fn keep_all(results: &[String], e: ArchivistError) -> StateUpdate {
    warn!(error = %e, "filter failed, keeping all results");
    StateUpdate::new()
        .filtered_results(results.to_vec())
        .error(format!("Filter error: {e}"))
}

/// Ask the judge to prune search results down to plausible candidates.
///
/// An answer that cannot be read, or that names none of the results, keeps
/// every result instead of dropping them all.
pub struct FilterNode {
    judge: Arc<dyn Judge>,
}

impl FilterNode {
    pub fn new(judge: Arc<dyn Judge>) -> Self {
        Self { judge }
    }
}

#[async_trait]
impl Node for FilterNode {
    fn id(&self) -> StageId {
        StageId::Filter
    }

    async fn run(&self, state: &PipelineState) -> Result<StateUpdate> {
        let results = state.results();
        info!(count = results.len(), "filtering results");
        if results.is_empty() {
            return Ok(StateUpdate::new()
                .filtered_results(vec![])
                .error("No results to filter"));
        }

        let prompt = filter_prompt(&state.query, results);
        let judged = match ask(self.judge.as_ref(), &prompt, &schema(), decode).await {
            Ok(judged) => judged,
            Err(e) => return Ok(keep_all(results, e)),
        };

        let judged: HashSet<&str> = judged.iter().map(String::as_str).collect();
        let known: HashSet<&str> = results.iter().map(String::as_str).collect();
        for unknown in judged.difference(&known) {
            debug!(identifier = %unknown, "judge returned an identifier not in the results");
        }

        let mut seen = HashSet::new();
        let filtered: Vec<String> = results
            .iter()
            .filter(|id| judged.contains(id.as_str()) && seen.insert(id.as_str()))
            .cloned()
            .collect();
        if filtered.is_empty() && !judged.is_empty() {
            return Ok(keep_all(
                results,
                ArchivistError::parse(format!(
                    "none of the {} judged identifiers appear in the results",
                    judged.len()
                )),
            ));
        }
        info!(count = filtered.len(), "filtered results");

        Ok(StateUpdate::new().filtered_results(filtered))
    }
}
