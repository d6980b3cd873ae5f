//! Cache read and write stages around the stage cache.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use archivist_shared::{PipelineState, Result, StateUpdate};

use super::search::SEARCH_ERROR;
use crate::cache::{StageCache, hash_key};
use crate::graph::{Node, StageId};

/// Whether the search call failed outright in this run, as opposed to
/// finding nothing.
fn search_failed(state: &PipelineState) -> bool {
    let exhausted = format!("{} stage failed", StageId::Search);
    state
        .errors
        .iter()
        .any(|note| note.starts_with(SEARCH_ERROR) || note.starts_with(&exhausted))
}

/// Entry stage: restore a previous run's snapshot for the same cache key.
pub struct CacheReadNode {
    cache: Arc<StageCache>,
}

impl CacheReadNode {
    pub fn new(cache: Arc<StageCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Node for CacheReadNode {
    fn id(&self) -> StageId {
        StageId::CacheRead
    }

    async fn run(&self, state: &PipelineState) -> Result<StateUpdate> {
        let key = state.effective_cache_key();
        if key.is_empty() {
            debug!("no cache key, skipping cache lookup");
            return Ok(StateUpdate::new().cached_results(false));
        }

        let hash = state
            .cache_key_hash
            .clone()
            .unwrap_or_else(|| hash_key(key));

        match self.cache.lookup_hash(&hash).await {
            Some(snapshot) => {
                info!(%hash, "cache hit");
                let mut update = StateUpdate::from_snapshot(snapshot);
                update.cache_key_hash = Some(hash);
                update.cached_results = Some(true);
                Ok(update)
            }
            None => {
                info!(%hash, "cache miss");
                Ok(StateUpdate::new().cache_key_hash(hash).cached_results(false))
            }
        }
    }
}

/// Persist the state after filtering so later runs can skip search and filter.
///
/// Nothing is stored when the search call failed, so the next run searches again.
pub struct CacheWriteNode {
    cache: Arc<StageCache>,
}

impl CacheWriteNode {
    pub fn new(cache: Arc<StageCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Node for CacheWriteNode {
    fn id(&self) -> StageId {
        StageId::CacheWrite
    }

    async fn run(&self, state: &PipelineState) -> Result<StateUpdate> {
        let hash = match (&state.cache_key_hash, state.effective_cache_key()) {
            (Some(hash), _) => hash.clone(),
            (None, "") => {
                debug!("no cache key, skipping cache write");
                return Ok(StateUpdate::new());
            }
            (None, key) => hash_key(key),
        };
        if search_failed(state) {
            warn!(%hash, "search failed, not caching this run");
            return Ok(StateUpdate::new());
        }

        self.cache.store_hash(&hash, state).await;
        info!(%hash, "state cached");
        Ok(StateUpdate::new())
    }
}
