//! Search stage: candidate identifiers for the query.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use archivist_archive::ArchiveClient;
use archivist_shared::{PipelineState, Result, StateUpdate};

use crate::graph::{Node, StageId};

/// Prefix of the note recorded when the archive search call fails.
pub(crate) const SEARCH_ERROR: &str = "Search error";

/// Query the archive for candidate identifiers.
pub struct SearchNode {
    archive: Arc<dyn ArchiveClient>,
    max_results: usize,
}

impl SearchNode {
    pub fn new(archive: Arc<dyn ArchiveClient>, max_results: usize) -> Self {
        Self {
            archive,
            max_results,
        }
    }
}

#[async_trait]
impl Node for SearchNode {
    fn id(&self) -> StageId {
        StageId::Search
    }

    async fn run(&self, state: &PipelineState) -> Result<StateUpdate> {
        let query = state.query.trim();
        if query.is_empty() {
            return Ok(StateUpdate::new().results(vec![]).error("Missing query"));
        }

        let response = match self.archive.search(query).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "search failed");
                return Ok(StateUpdate::new()
                    .results(vec![])
                    .error(format!("{SEARCH_ERROR}: {e}")));
            }
        };

        let mut seen = HashSet::new();
        let items: Vec<String> = response
            .items
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .take(self.max_results)
            .collect();
        info!(count = items.len(), "search results");

        let mut update = StateUpdate::new().results(items);
        if let Some(message) = response.error {
            update = update.error(message);
        }
        Ok(update)
    }
}
