//! Internet Archive collaborator: search, item metadata, and file download.
//!
//! The pipeline only sees the [`ArchiveClient`] trait. [`InternetArchive`] is
//! the HTTP implementation used by the CLI; tests substitute in-memory stubs.

mod client;

use std::path::Path;

use async_trait::async_trait;

use archivist_shared::{ItemMetadata, Result};

pub use client::InternetArchive;

/// Message reported when a search returns no identifiers.
pub const NO_RESULTS: &str = "No good search result found";

/// Outcome of a search: ordered identifiers plus an optional soft error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResponse {
    /// Candidate identifiers in archive ranking order.
    pub items: Vec<String>,
    /// Non-fatal problem the archive reported (e.g. no hits).
    pub error: Option<String>,
}

impl SearchResponse {
    /// Build a response, flagging an empty item list.
    pub fn from_items(items: Vec<String>) -> Self {
        let error = items.is_empty().then(|| NO_RESULTS.to_string());
        Self { items, error }
    }
}

/// Boundary to the archive: every network call the pipeline makes goes through here.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Search for `query` and return candidate identifiers.
    async fn search(&self, query: &str) -> Result<SearchResponse>;

    /// Fetch attributes and file listing for one item.
    async fn item_metadata(&self, identifier: &str) -> Result<ItemMetadata>;

    /// Download `files` of `identifier` into `target_dir`.
    async fn download(&self, identifier: &str, files: &[String], target_dir: &Path) -> Result<()>;
}
