//! Metadata stage: fetch item records for the filtered candidates.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use archivist_archive::ArchiveClient;
use archivist_shared::{PipelineState, Result, StateUpdate};

use crate::graph::{Node, StageId};

/// Fetch attributes and file listings for the filtered candidates.
///
/// Stops at the first failing identifier and keeps what was fetched before it.
pub struct MetadataNode {
    archive: Arc<dyn ArchiveClient>,
}

impl MetadataNode {
    pub fn new(archive: Arc<dyn ArchiveClient>) -> Self {
        Self { archive }
    }
}

#[async_trait]
impl Node for MetadataNode {
    fn id(&self) -> StageId {
        StageId::Metadata
    }

    async fn run(&self, state: &PipelineState) -> Result<StateUpdate> {
        let filtered = state.filtered_results();
        info!(count = filtered.len(), "fetching metadata");
        if filtered.is_empty() {
            return Ok(StateUpdate::new()
                .metadata(BTreeMap::new())
                .error("No filtered results to get metadata for"));
        }

        let mut metadata = BTreeMap::new();
        let mut update = StateUpdate::new();
        for identifier in filtered {
            match self.archive.item_metadata(identifier).await {
                Ok(item) => {
                    metadata.insert(identifier.clone(), item);
                }
                Err(e) => {
                    warn!(%identifier, error = %e, "metadata fetch failed, stopping");
                    update = update.error(format!("Metadata error for {identifier}: {e}"));
                    break;
                }
            }
        }

        info!(count = metadata.len(), "metadata fetched");
        Ok(update.metadata(metadata))
    }
}
