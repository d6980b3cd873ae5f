//! Content-addressed snapshot cache for pipeline states.
//!
//! A snapshot of the full [`PipelineState`] lives at
//! `<root>/<sha256(cache_key)>/<file_name>`. Reads never fail the pipeline: a
//! missing, unreadable or corrupt snapshot is a miss. Writes go through a
//! uniquely named temp file and a rename, so concurrent writers are
//! last-write-wins and readers never see a torn file.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use archivist_shared::{ArchivistError, PipelineState, Result};

/// Snapshot file name used by the standard pipeline.
pub const DEFAULT_FILE_NAME: &str = "query.json";

/// SHA-256 hex digest of a cache key.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Filesystem-backed snapshot store.
#[derive(Debug, Clone)]
pub struct StageCache {
    root: PathBuf,
    file_name: String,
}

impl StageCache {
    pub fn new(root: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            file_name: file_name.into(),
        }
    }

    /// Cache rooted at `root` using [`DEFAULT_FILE_NAME`].
    pub fn with_default_file(root: impl Into<PathBuf>) -> Self {
        Self::new(root, DEFAULT_FILE_NAME)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the snapshot for `key` lives (whether or not it exists).
    pub fn snapshot_path(&self, key: &str) -> PathBuf {
        self.path_for_hash(&hash_key(key))
    }

    /// Where the snapshot for an already computed hash lives.
    pub fn path_for_hash(&self, hash: &str) -> PathBuf {
        self.root.join(hash).join(&self.file_name)
    }

    /// Decoded snapshot for `key`, or `None` on a miss.
    pub async fn lookup(&self, key: &str) -> Option<PipelineState> {
        self.lookup_hash(&hash_key(key)).await
    }

    /// Decoded snapshot for an already computed hash, or `None` on a miss.
    pub async fn lookup_hash(&self, hash: &str) -> Option<PipelineState> {
        let path = self.path_for_hash(hash);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no snapshot");
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read snapshot");
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(state) => {
                debug!(path = %path.display(), "snapshot loaded");
                Some(state)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt snapshot");
                None
            }
        }
    }

    /// Persist `state` under `key`. Failures are logged, never raised.
    pub async fn store(&self, key: &str, state: &PipelineState) {
        self.store_hash(&hash_key(key), state).await;
    }

    /// Persist `state` under an already computed hash. Failures are logged, never raised.
    pub async fn store_hash(&self, hash: &str, state: &PipelineState) {
        if let Err(e) = self.try_store(hash, state).await {
            warn!(hash, error = %e, "failed to write snapshot");
        }
    }

    async fn try_store(&self, hash: &str, state: &PipelineState) -> Result<()> {
        let path = self.path_for_hash(hash);
        let dir = self.root.join(hash);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ArchivistError::io(&dir, e))?;

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| ArchivistError::parse(format!("failed to encode snapshot: {e}")))?;

        let tmp = dir.join(format!(".{}.{}.tmp", self.file_name, Uuid::now_v7()));
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ArchivistError::io(&tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ArchivistError::io(&path, e));
        }

        debug!(path = %path.display(), "snapshot written");
        Ok(())
    }

    /// Remove the snapshot directory for `key`. Returns whether anything was removed.
    pub async fn evict(&self, key: &str) -> Result<bool> {
        let dir = self.root.join(hash_key(key));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ArchivistError::io(&dir, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> StageCache {
        let dir = std::env::temp_dir().join(format!("archivist-cache-{}", Uuid::now_v7()));
        StageCache::with_default_file(dir)
    }

    fn sample_state() -> PipelineState {
        let mut state = PipelineState::new("Super Mario Bros 2 Manual");
        state.cache_key_hash = Some(hash_key("Super Mario Bros 2 Manual"));
        state.results = Some(vec![
            "super-mario-bros-2-nes-spielanleitung".into(),
            "nintendo-power-issue-001".into(),
        ]);
        state.filtered_results = Some(vec!["super-mario-bros-2-nes-spielanleitung".into()]);
        state.cached_results = Some(false);
        state
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            hash_key(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(hash_key("abc").len(), 64);
        assert_eq!(hash_key("abc"), hash_key("abc"));
        assert_ne!(hash_key("abc"), hash_key("abd"));
    }

    #[test]
    fn snapshot_layout() {
        let cache = StageCache::new("/var/cache/archivist", "query.json");
        let path = cache.snapshot_path("abc");
        assert_eq!(
            path,
            PathBuf::from("/var/cache/archivist")
                .join(hash_key("abc"))
                .join("query.json")
        );
    }

    #[tokio::test]
    async fn store_then_lookup_returns_equal_state() {
        let cache = temp_cache();
        let state = sample_state();

        assert!(cache.lookup(&state.query).await.is_none());
        cache.store(&state.query, &state).await;
        assert_eq!(cache.lookup(&state.query).await, Some(state.clone()));

        // Overwrite is idempotent and leaves no temp files behind.
        cache.store(&state.query, &state).await;
        let dir = cache.root().join(hash_key(&state.query));
        let entries: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("query.json")]);

        let _ = std::fs::remove_dir_all(cache.root());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_miss() {
        let cache = temp_cache();
        let path = cache.snapshot_path("broken");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        assert!(cache.lookup("broken").await.is_none());

        let _ = std::fs::remove_dir_all(cache.root());
    }

    #[tokio::test]
    async fn legacy_single_string_error_is_accepted() {
        let cache = temp_cache();
        let path = cache.snapshot_path("legacy");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"query": "legacy", "results": [], "error": "No good search result found"}"#,
        )
        .unwrap();

        let state = cache.lookup("legacy").await.expect("snapshot decodes");
        assert_eq!(state.errors, vec!["No good search result found".to_string()]);

        let _ = std::fs::remove_dir_all(cache.root());
    }

    #[tokio::test]
    async fn evict_removes_snapshot() {
        let cache = temp_cache();
        let state = sample_state();
        cache.store("key", &state).await;

        assert!(cache.evict("key").await.unwrap());
        assert!(cache.lookup("key").await.is_none());
        assert!(!cache.evict("key").await.unwrap());

        let _ = std::fs::remove_dir_all(cache.root());
    }

    #[tokio::test]
    async fn unwritable_root_is_swallowed() {
        let file = std::env::temp_dir().join(format!("archivist-not-a-dir-{}", Uuid::now_v7()));
        std::fs::write(&file, "x").unwrap();

        let cache = StageCache::with_default_file(&file);
        cache.store("key", &sample_state()).await;
        assert!(cache.lookup("key").await.is_none());

        let _ = std::fs::remove_file(&file);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_and_readers_never_see_a_torn_snapshot() {
        let cache = temp_cache();
        let states: Vec<PipelineState> = (0..8)
            .map(|i| {
                let mut state = sample_state();
                // Vary the size so a torn write would not decode.
                state.results = Some((0..(i + 1) * 50).map(|n| format!("item-{i}-{n}")).collect());
                state
            })
            .collect();

        let mut writers = Vec::new();
        for state in states.clone() {
            let cache = cache.clone();
            writers.push(tokio::spawn(async move {
                cache.store("shared", &state).await;
            }));
        }
        let mut readers = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            readers.push(tokio::spawn(async move { cache.lookup("shared").await }));
        }

        for writer in writers {
            writer.await.unwrap();
        }
        for reader in readers {
            if let Some(seen) = reader.await.unwrap() {
                assert!(states.contains(&seen), "reader saw a state nobody wrote");
            }
        }

        let last = cache.lookup("shared").await.expect("a snapshot survives");
        assert!(states.contains(&last));

        let dir = cache.snapshot_path("shared").parent().unwrap().to_path_buf();
        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, [DEFAULT_FILE_NAME]);

        let _ = std::fs::remove_dir_all(cache.root());
    }
}
