//! Core domain types: the pipeline state and the per-item archive metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Archive metadata
// ---------------------------------------------------------------------------

/// One file record from an item's file listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveFile {
    /// File name relative to the item root.
    pub name: String,
    /// `original`, `derivative` or `metadata`.
    #[serde(default)]
    pub source: String,
    /// Human-readable format label (e.g. `Image Container PDF`).
    #[serde(default)]
    pub format: String,
    /// Every other key the archive reports (size, md5, original, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ArchiveFile {
    /// Whether the archive labels this file as some kind of PDF.
    pub fn is_pdf(&self) -> bool {
        self.format.to_ascii_lowercase().contains("pdf")
            || self.name.to_ascii_lowercase().ends_with(".pdf")
    }
}

/// Detail record for a single archive item: attributes plus file listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Item attributes (title, creator, language, subject, ...).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Files available for download.
    #[serde(default)]
    pub files: Vec<ArchiveFile>,
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// The single record threaded through every pipeline stage.
///
/// Stages never construct a new state themselves; they describe their changes
/// as a [`StateUpdate`] and the executor calls [`PipelineState::apply`]. Every
/// field a stage does not name survives untouched, and `query` cannot be
/// named at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// The user's search request.
    pub query: String,

    /// Explicit cache key; the query is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,

    /// SHA-256 hex of the effective cache key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key_hash: Option<String>,

    /// Raw candidate identifiers from search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<String>>,

    /// Whether later fields were served from the stage cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_results: Option<bool>,

    /// Candidates the judge considered relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtered_results: Option<Vec<String>>,

    /// Per-candidate detail, keyed by identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, ItemMetadata>>,

    /// Candidates re-confirmed against their metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries_to_consider: Option<Vec<String>>,

    /// Selected file names per confirmed entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdfs_to_download: Option<BTreeMap<String, Vec<String>>>,

    /// Accumulated failure notes. Append-only.
    #[serde(
        rename = "error",
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub errors: Vec<String>,
}

impl PipelineState {
    /// Start a fresh state for `query`.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Override the cache key (defaults to the query).
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// The key snapshots are stored under: `cache_key` if set and non-empty, else `query`.
    pub fn effective_cache_key(&self) -> &str {
        match self.cache_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => &self.query,
        }
    }

    pub fn results(&self) -> &[String] {
        self.results.as_deref().unwrap_or_default()
    }

    pub fn filtered_results(&self) -> &[String] {
        self.filtered_results.as_deref().unwrap_or_default()
    }

    pub fn entries_to_consider(&self) -> &[String] {
        self.entries_to_consider.as_deref().unwrap_or_default()
    }

    /// Whether the state came from a cache hit.
    pub fn is_cached(&self) -> bool {
        self.cached_results.unwrap_or(false)
    }

    /// Whether any stage recorded a failure.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Return a new state with `update` applied.
    ///
    /// Named fields replace their current values, error notes are appended,
    /// and an already-set `cache_key_hash` is never replaced by a different one.
    pub fn apply(&self, update: StateUpdate) -> PipelineState {
        let mut next = self.clone();

        if let Some(hash) = update.cache_key_hash {
            match next.cache_key_hash.as_deref() {
                Some(existing) if existing != hash => {
                    tracing::warn!(
                        existing,
                        attempted = %hash,
                        "ignoring attempt to replace cache key hash"
                    );
                }
                _ => next.cache_key_hash = Some(hash),
            }
        }
        if let Some(results) = update.results {
            next.results = Some(results);
        }
        if let Some(cached) = update.cached_results {
            next.cached_results = Some(cached);
        }
        if let Some(filtered) = update.filtered_results {
            next.filtered_results = Some(filtered);
        }
        if let Some(metadata) = update.metadata {
            next.metadata = Some(metadata);
        }
        if let Some(entries) = update.entries_to_consider {
            next.entries_to_consider = Some(entries);
        }
        if let Some(pdfs) = update.pdfs_to_download {
            next.pdfs_to_download = Some(pdfs);
        }
        next.errors.extend(update.errors);

        next
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// Accept `"msg"`, `["a", "b"]` or `null` for the error field.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(msg)) if msg.is_empty() => Vec::new(),
        Some(OneOrMany::One(msg)) => vec![msg],
        Some(OneOrMany::Many(list)) => list,
    })
}

// ---------------------------------------------------------------------------
// StateUpdate
// ---------------------------------------------------------------------------

/// A set of named field updates produced by one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub cache_key_hash: Option<String>,
    pub results: Option<Vec<String>>,
    pub cached_results: Option<bool>,
    pub filtered_results: Option<Vec<String>>,
    pub metadata: Option<BTreeMap<String, ItemMetadata>>,
    pub entries_to_consider: Option<Vec<String>>,
    pub pdfs_to_download: Option<BTreeMap<String, Vec<String>>>,
    pub errors: Vec<String>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an update that restores every field of a cached snapshot except `query`.
    pub fn from_snapshot(snapshot: PipelineState) -> Self {
        Self {
            cache_key_hash: snapshot.cache_key_hash,
            results: snapshot.results,
            cached_results: snapshot.cached_results,
            filtered_results: snapshot.filtered_results,
            metadata: snapshot.metadata,
            entries_to_consider: snapshot.entries_to_consider,
            pdfs_to_download: snapshot.pdfs_to_download,
            errors: snapshot.errors,
        }
    }

    pub fn cache_key_hash(mut self, hash: impl Into<String>) -> Self {
        self.cache_key_hash = Some(hash.into());
        self
    }

    pub fn results(mut self, results: Vec<String>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn cached_results(mut self, cached: bool) -> Self {
        self.cached_results = Some(cached);
        self
    }

    pub fn filtered_results(mut self, filtered: Vec<String>) -> Self {
        self.filtered_results = Some(filtered);
        self
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, ItemMetadata>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn entries_to_consider(mut self, entries: Vec<String>) -> Self {
        self.entries_to_consider = Some(entries);
        self
    }

    pub fn pdfs_to_download(mut self, pdfs: BTreeMap<String, Vec<String>>) -> Self {
        self.pdfs_to_download = Some(pdfs);
        self
    }

    /// Append one error note.
    pub fn error(mut self, note: impl Into<String>) -> Self {
        self.errors.push(note.into());
        self
    }

    /// Append several error notes.
    pub fn errors(mut self, notes: impl IntoIterator<Item = String>) -> Self {
        self.errors.extend(notes);
        self
    }

    /// True if applying this update would change nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mario_metadata() -> ItemMetadata {
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "identifier": "super-mario-bros-2-nes-spielanleitung",
                "mediatype": "texts",
                "language": "ger"
            },
            "files": [
                {
                    "name": "Super Mario Bros 2 - NES - Spielanleitung.pdf",
                    "source": "original",
                    "format": "Image Container PDF",
                    "size": "4379827"
                },
                {
                    "name": "super-mario-bros-2-nes-spielanleitung_files.xml",
                    "source": "original",
                    "format": "Metadata"
                }
            ]
        }))
        .expect("metadata fixture")
    }

    #[test]
    fn apply_keeps_untouched_fields() {
        let state = PipelineState::new("Super Mario Bros 2 Manual")
            .apply(StateUpdate::new().results(vec!["a".into(), "b".into()]));
        let next = state.apply(StateUpdate::new().filtered_results(vec!["a".into()]));

        assert_eq!(next.query, "Super Mario Bros 2 Manual");
        assert_eq!(next.results(), ["a", "b"]);
        assert_eq!(next.filtered_results(), ["a"]);
    }

    #[test]
    fn apply_appends_errors() {
        let state = PipelineState::new("q").apply(StateUpdate::new().error("first"));
        let next = state.apply(StateUpdate::new().error("second"));
        assert_eq!(next.errors, vec!["first".to_string(), "second".to_string()]);

        let untouched = next.apply(StateUpdate::new());
        assert_eq!(untouched.errors.len(), 2);
    }

    #[test]
    fn apply_never_replaces_cache_key_hash() {
        let state = PipelineState::new("q").apply(StateUpdate::new().cache_key_hash("abc"));
        let next = state.apply(StateUpdate::new().cache_key_hash("def"));
        assert_eq!(next.cache_key_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn effective_cache_key_prefers_override() {
        let state = PipelineState::new("query text");
        assert_eq!(state.effective_cache_key(), "query text");

        let state = state.with_cache_key("custom");
        assert_eq!(state.effective_cache_key(), "custom");

        let state = PipelineState::new("query text").with_cache_key("");
        assert_eq!(state.effective_cache_key(), "query text");
    }

    #[test]
    fn error_field_accepts_string_or_list() {
        let single: PipelineState =
            serde_json::from_str(r#"{"query":"q","error":"Missing query"}"#).expect("single");
        assert_eq!(single.errors, vec!["Missing query".to_string()]);

        let many: PipelineState =
            serde_json::from_str(r#"{"query":"q","error":["a","b"]}"#).expect("many");
        assert_eq!(many.errors.len(), 2);

        let null: PipelineState =
            serde_json::from_str(r#"{"query":"q","error":null}"#).expect("null");
        assert!(null.errors.is_empty());
    }

    #[test]
    fn state_serialization_omits_unset_fields() {
        let state = PipelineState::new("q");
        let json = serde_json::to_string(&state).expect("serialize");
        assert_eq!(json, r#"{"query":"q"}"#);
    }

    #[test]
    fn metadata_preserves_extra_file_keys() {
        let meta = mario_metadata();
        assert_eq!(meta.files.len(), 2);
        assert!(meta.files[0].is_pdf());
        assert!(!meta.files[1].is_pdf());
        assert_eq!(meta.files[0].extra["size"], "4379827");

        let json = serde_json::to_value(&meta).expect("serialize");
        assert_eq!(json["files"][0]["size"], "4379827");
    }

    #[test]
    fn snapshot_update_restores_everything_but_query() {
        let mut metadata = BTreeMap::new();
        metadata.insert("id".to_string(), mario_metadata());
        let mut snapshot = PipelineState::new("other query");
        snapshot.results = Some(vec!["id".into()]);
        snapshot.filtered_results = Some(vec!["id".into()]);
        snapshot.metadata = Some(metadata);

        let state = PipelineState::new("original query").apply(StateUpdate::from_snapshot(snapshot));
        assert_eq!(state.query, "original query");
        assert_eq!(state.filtered_results(), ["id"]);
        assert!(state.metadata.is_some());
    }

    #[test]
    fn empty_update_is_empty() {
        assert!(StateUpdate::new().is_empty());
        assert!(!StateUpdate::new().cached_results(false).is_empty());
    }
}
