//! Finder stage: per-item relevance check against the fetched attributes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use archivist_judge::{Judge, JudgeSchema};
use archivist_shared::{ArchivistError, PipelineState, Result, StateUpdate};

use super::ask;
use crate::graph::{Node, StageId};
use crate::prompts::finder_prompt;

fn schema() -> JudgeSchema {
    JudgeSchema::new(
        "entry_relevance",
        json!({
            "type": "object",
            "properties": {
                "is_this_entry_relevant": {
                    "type": "boolean",
                    "description": "Whether the entry is relevant to the query"
                }
            },
            "required": ["is_this_entry_relevant"],
            "additionalProperties": false
        }),
    )
}

fn decode(value: Value) -> Result<bool> {
    match value.get("is_this_entry_relevant") {
        Some(Value::Bool(relevant)) => Ok(*relevant),
        Some(other) => Err(ArchivistError::parse(format!(
            "'is_this_entry_relevant' should be a boolean, got {other}"
        ))),
        None => Err(ArchivistError::parse(
            "answer has no 'is_this_entry_relevant' field",
        )),
    }
}

/// Re-judge each fetched item against its attributes.
///
/// A failed judgement is recorded and the remaining items are still judged.
pub struct FinderNode {
    judge: Arc<dyn Judge>,
}

impl FinderNode {
    pub fn new(judge: Arc<dyn Judge>) -> Self {
        Self { judge }
    }
}

#[async_trait]
impl Node for FinderNode {
    fn id(&self) -> StageId {
        StageId::Finder
    }

    async fn run(&self, state: &PipelineState) -> Result<StateUpdate> {
        let metadata = match &state.metadata {
            Some(metadata) if !metadata.is_empty() => metadata,
            _ => {
                return Ok(StateUpdate::new()
                    .entries_to_consider(vec![])
                    .error("No metadata information to check"));
            }
        };
        info!(count = metadata.len(), "judging entries");

        // Judge in filter order; metadata keys only matter when that is missing.
        let order: Vec<&String> = match &state.filtered_results {
            Some(filtered) => filtered.iter().filter(|id| metadata.contains_key(*id)).collect(),
            None => metadata.keys().collect(),
        };

        let mut entries = Vec::new();
        let mut errors = Vec::new();
        for identifier in order {
            let attributes = &metadata[identifier].metadata;
            let prompt = finder_prompt(&state.query, identifier, attributes);
            match ask(self.judge.as_ref(), &prompt, &schema(), decode).await {
                Ok(true) => entries.push(identifier.clone()),
                Ok(false) => debug!(%identifier, "entry judged not relevant"),
                Err(e) => {
                    warn!(%identifier, error = %e, "finder judgement failed");
                    errors.push(format!("Finder error for {identifier}: {e}"));
                }
            }
        }

        info!(count = entries.len(), "entries to consider");
        Ok(StateUpdate::new().entries_to_consider(entries).errors(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::stages::testing::{Reply, ScriptedJudge, item};

    fn state(ids: &[&str]) -> PipelineState {
        let mut state = PipelineState::new("Super Mario Bros 2 Manual");
        state.filtered_results = Some(ids.iter().map(|s| s.to_string()).collect());
        state.metadata = Some(
            ids.iter()
                .map(|id| (id.to_string(), item(&format!("Title of {id}"), &["x.pdf"])))
                .collect(),
        );
        state
    }

    async fn run(judge: ScriptedJudge, state: &PipelineState) -> PipelineState {
        state.apply(FinderNode::new(Arc::new(judge)).run(state).await.unwrap())
    }

    #[tokio::test]
    async fn keeps_relevant_entries_in_filter_order() {
        let state = state(&["zz-mario", "aa-zelda", "mm-mario"]);
        let judge = ScriptedJudge::structured(|prompt| {
            Reply::Json(json!({"is_this_entry_relevant": prompt.contains("Title of") && prompt.contains("-mario\n")}))
        });
        let next = run(judge, &state).await;
        assert_eq!(next.entries_to_consider(), ["zz-mario", "mm-mario"]);
        assert!(next.errors.is_empty());
    }

    #[tokio::test]
    async fn per_item_failure_does_not_stop_the_rest() {
        let state = state(&["broken", "good"]);
        let judge = ScriptedJudge::text_only(|prompt| {
            if prompt.contains("\nbroken\n") {
                Reply::Text("no idea".into())
            } else {
                Reply::Text("{\"is_this_entry_relevant\": true}".into())
            }
        });
        let next = run(judge, &state).await;
        assert_eq!(next.entries_to_consider(), ["good"]);
        assert_eq!(next.errors.len(), 1);
        assert!(next.errors[0].starts_with("Finder error for broken:"));
    }

    #[tokio::test]
    async fn entries_are_a_subset_of_filtered_results() {
        let mut state = state(&["a", "b"]);
        // Metadata for an identifier the filter never kept is ignored.
        state
            .metadata
            .as_mut()
            .unwrap()
            .insert("stray".into(), item("Stray", &["s.pdf"]));
        let judge = ScriptedJudge::structured(|_| Reply::Json(json!({"is_this_entry_relevant": true})));
        let next = run(judge, &state).await;
        assert_eq!(next.entries_to_consider(), ["a", "b"]);
    }

    #[tokio::test]
    async fn empty_metadata_short_circuits() {
        let mut state = PipelineState::new("q");
        state.metadata = Some(BTreeMap::new());
        let judge = Arc::new(ScriptedJudge::structured(|_| Reply::Json(json!({}))));
        let next = state.apply(FinderNode::new(judge.clone()).run(&state).await.unwrap());

        assert_eq!(next.entries_to_consider, Some(vec![]));
        assert_eq!(next.errors, ["No metadata information to check"]);
        assert_eq!(judge.call_count(), 0);
    }

    #[test]
    fn decode_requires_a_boolean() {
        assert!(decode(json!({"is_this_entry_relevant": true})).unwrap());
        assert!(decode(json!({"is_this_entry_relevant": "yes"})).is_err());
        assert!(decode(json!({})).is_err());
    }
}
