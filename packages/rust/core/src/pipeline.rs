//! The standard archive pipeline:
//! cache → (cached? metadata : search → filter → state_writer → metadata) →
//! finder → file_finder → downloader.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument};

use archivist_archive::ArchiveClient;
use archivist_judge::Judge;
use archivist_shared::{PipelineState, Result};

use crate::cache::StageCache;
use crate::graph::{Edge, Graph, GraphBuilder, ProgressReporter, RetryPolicy, StageId};
use crate::stages::{
    CacheReadNode, CacheWriteNode, DownloaderNode, FileFinderNode, FilterNode, FinderNode,
    MetadataNode, SearchNode,
};

/// Everything the standard pipeline needs.
#[derive(Clone)]
pub struct ArchivePipelineConfig {
    /// Archive collaborator (search, metadata, download).
    pub archive: Arc<dyn ArchiveClient>,
    /// Relevance judge used by filter, finder and file finder.
    pub judge: Arc<dyn Judge>,
    /// Snapshot cache shared by the cache read and write stages.
    pub cache: Arc<StageCache>,
    /// Directory downloads are written into. Must exist and be writable.
    pub download_dir: PathBuf,
    /// Maximum number of search candidates kept.
    pub max_results: usize,
    /// Retry policy applied to every stage.
    pub retry: RetryPolicy,
}

/// Branch predicate after the cache read: skip search and filter on a hit.
pub fn has_cached_results(state: &PipelineState) -> bool {
    state.is_cached()
}

/// First stage of the standard graph.
pub const ENTRY: StageId = StageId::CacheRead;

/// Last stage of the standard graph.
pub const FINISH: StageId = StageId::Downloader;

/// Edges of the standard graph, in wiring order.
pub fn standard_edges() -> Vec<Edge> {
    let direct = |from, to| Edge::Direct { from, to };
    vec![
        Edge::Branch {
            from: StageId::CacheRead,
            predicate: has_cached_results,
            when_true: StageId::Metadata,
            when_false: StageId::Search,
        },
        direct(StageId::Search, StageId::Filter),
        direct(StageId::Filter, StageId::CacheWrite),
        direct(StageId::CacheWrite, StageId::Metadata),
        direct(StageId::Metadata, StageId::Finder),
        direct(StageId::Finder, StageId::FileFinder),
        direct(StageId::FileFinder, FINISH),
    ]
}

/// Wire the standard graph. Fails if the download directory is unusable.
pub fn build_archive_graph(config: &ArchivePipelineConfig) -> Result<Graph> {
    let retry = config.retry;
    let downloader = DownloaderNode::new(Arc::clone(&config.archive), &config.download_dir)?;

    GraphBuilder::new()
        .add_node(Arc::new(CacheReadNode::new(Arc::clone(&config.cache))), retry)
        .add_node(
            Arc::new(SearchNode::new(Arc::clone(&config.archive), config.max_results)),
            retry,
        )
        .add_node(Arc::new(FilterNode::new(Arc::clone(&config.judge))), retry)
        .add_node(Arc::new(CacheWriteNode::new(Arc::clone(&config.cache))), retry)
        .add_node(Arc::new(MetadataNode::new(Arc::clone(&config.archive))), retry)
        .add_node(Arc::new(FinderNode::new(Arc::clone(&config.judge))), retry)
        .add_node(Arc::new(FileFinderNode::new(Arc::clone(&config.judge))), retry)
        .add_node(Arc::new(downloader), retry)
        .add_edges(standard_edges())
        .set_entry(ENTRY)
        .set_finish(FINISH)
        .build()
}

/// Run `graph` for one query. Never fails; problems end up in `error`.
#[instrument(skip(graph, progress))]
pub async fn run_query(
    graph: &Graph,
    query: &str,
    cache_key: Option<&str>,
    progress: &dyn ProgressReporter,
) -> PipelineState {
    let mut initial = PipelineState::new(query);
    if let Some(key) = cache_key {
        initial = initial.with_cache_key(key);
    }

    let state = graph.run(initial, progress).await;
    info!(
        cached = state.is_cached(),
        results = state.results().len(),
        filtered = state.filtered_results().len(),
        entries = state.entries_to_consider().len(),
        errors = state.errors.len(),
        "pipeline finished"
    );
    state
}

/// One line per edge, in wiring order.
pub fn render_topology(graph: &Graph) -> String {
    render_edges(graph.topology(), graph.finish())
}

/// The standard topology, rendered without building any collaborator.
pub fn render_standard_topology() -> String {
    render_edges(&standard_edges(), FINISH)
}

fn render_edges(edges: &[Edge], finish: StageId) -> String {
    let mut out = String::new();
    for edge in edges {
        match edge {
            Edge::Direct { from, to } => out.push_str(&format!("{from} -> {to}\n")),
            Edge::Branch {
                from,
                when_true,
                when_false,
                ..
            } => out.push_str(&format!("{from} -> {when_true} if cached, else {when_false}\n")),
        }
    }
    out.push_str(&format!("{finish} -> end\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use serde_json::json;

    use archivist_archive::SearchResponse;

    use crate::graph::SilentProgress;
    use crate::stages::testing::{
        Reply, ScriptedJudge, StubArchive, fixture_metadata, item, temp_dir,
    };

    const QUERY: &str = "Super Mario Bros 2 Manual";
    const MARIO_DE: &str = "super-mario-bros-2-nes-spielanleitung";
    const MARIO_US: &str = "super-mario-bros-2-usa-manual";
    const POWER: &str = "nintendo-power-issue-001";
    const TEXT_PDF: &str = "Super Mario Bros 2 - NES - Spielanleitung_text.pdf";

    fn search_fixture() -> SearchResponse {
        let raw = std::fs::read_to_string("../../../fixtures/json/mario-search.json")
            .expect("missing fixture: mario-search.json");
        let body: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let items = body["response"]["docs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|doc| doc["identifier"].as_str().unwrap().to_string())
            .collect();
        SearchResponse::from_items(items)
    }

    fn mario_archive() -> StubArchive {
        StubArchive {
            search: Some(search_fixture()),
            items: BTreeMap::from([
                (MARIO_DE.to_string(), fixture_metadata("mario-metadata.json")),
                (MARIO_US.to_string(), item("Super Mario Bros. 2 (USA) Manual", &[])),
                (POWER.to_string(), item("Nintendo Power Issue 1", &["np1.pdf"])),
            ]),
            ..StubArchive::default()
        }
    }

    /// Filter keeps Mario items; finder accepts only the German manual;
    /// file finder picks the searchable PDF.
    fn mario_judge(prompt: &str) -> Reply {
        if prompt.contains("filters Internet Archive search results") {
            Reply::Json(json!({"filtered_results": [MARIO_DE, MARIO_US, "made-up-item"]}))
        } else if prompt.contains("evaluates Internet Archive entries") {
            let relevant = prompt.contains(&format!("\n{MARIO_DE}\n"));
            Reply::Json(json!({"is_this_entry_relevant": relevant}))
        } else if prompt.contains("selects the most relevant PDF files") {
            Reply::Json(json!({"pdfs_to_download": [TEXT_PDF]}))
        } else {
            Reply::Fail(format!("unexpected prompt: {prompt}"))
        }
    }

    /// Filter keeps everything, finder accepts everything.
    fn accept_all(prompt: &str) -> Reply {
        if prompt.contains("filters Internet Archive search results") {
            Reply::Json(json!({"filtered_results": [MARIO_DE, MARIO_US, POWER]}))
        } else if prompt.contains("evaluates Internet Archive entries") {
            Reply::Json(json!({"is_this_entry_relevant": true}))
        } else {
            Reply::Json(json!({"pdfs_to_download": [TEXT_PDF, "np1.pdf"]}))
        }
    }

    struct Fixture {
        archive: Arc<StubArchive>,
        judge: Arc<ScriptedJudge>,
        config: ArchivePipelineConfig,
    }

    fn fixture(archive: StubArchive, judge: ScriptedJudge, cache_root: &std::path::Path) -> Fixture {
        let archive = Arc::new(archive);
        let judge = Arc::new(judge);
        let config = ArchivePipelineConfig {
            archive: archive.clone(),
            judge: judge.clone(),
            cache: Arc::new(StageCache::with_default_file(cache_root)),
            download_dir: temp_dir("archivist-e2e-dl"),
            max_results: 100,
            retry: RetryPolicy::default(),
        };
        Fixture {
            archive,
            judge,
            config,
        }
    }

    fn cleanup(fixture: &Fixture) {
        let _ = std::fs::remove_dir_all(&fixture.config.download_dir);
        let _ = std::fs::remove_dir_all(fixture.config.cache.root());
    }

    #[tokio::test]
    async fn super_mario_end_to_end() {
        let cache_root = temp_dir("archivist-e2e-cache");
        let fx = fixture(mario_archive(), ScriptedJudge::structured(mario_judge), &cache_root);
        let graph = build_archive_graph(&fx.config).unwrap();

        let state = run_query(&graph, QUERY, None, &SilentProgress).await;

        assert!(state.errors.is_empty(), "unexpected errors: {:?}", state.errors);
        assert_eq!(state.query, QUERY);
        assert_eq!(state.cached_results, Some(false));
        assert_eq!(state.results(), [MARIO_DE, MARIO_US, POWER]);
        assert_eq!(state.filtered_results(), [MARIO_DE, MARIO_US]);
        assert_eq!(state.entries_to_consider(), [MARIO_DE]);
        assert_eq!(
            state.pdfs_to_download,
            Some(BTreeMap::from([(MARIO_DE.to_string(), vec![TEXT_PDF.to_string()])]))
        );
        assert!(fx.config.download_dir.join(MARIO_DE).join(TEXT_PDF).exists());

        // The snapshot was written after filtering.
        let snapshot = fx.config.cache.lookup(QUERY).await.expect("snapshot");
        assert_eq!(snapshot.filtered_results(), [MARIO_DE, MARIO_US]);
        assert!(snapshot.metadata.is_none());

        cleanup(&fx);
    }

    #[tokio::test]
    async fn second_run_is_served_from_cache() {
        let cache_root = temp_dir("archivist-e2e-cache");
        let first = fixture(mario_archive(), ScriptedJudge::structured(mario_judge), &cache_root);
        let graph = build_archive_graph(&first.config).unwrap();
        run_query(&graph, QUERY, None, &SilentProgress).await;
        assert_eq!(*first.archive.search_calls.lock().unwrap(), 1);

        let second = fixture(mario_archive(), ScriptedJudge::structured(mario_judge), &cache_root);
        let graph = build_archive_graph(&second.config).unwrap();
        let state = run_query(&graph, QUERY, None, &SilentProgress).await;

        assert_eq!(*second.archive.search_calls.lock().unwrap(), 0);
        let filter_calls = second
            .judge
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains("filters Internet Archive search results"))
            .count();
        assert_eq!(filter_calls, 0);
        assert_eq!(state.cached_results, Some(true));
        assert_eq!(state.filtered_results(), [MARIO_DE, MARIO_US]);
        assert_eq!(state.entries_to_consider(), [MARIO_DE]);
        assert!(state.errors.is_empty());

        cleanup(&first);
        let _ = std::fs::remove_dir_all(&second.config.download_dir);
    }

    #[tokio::test]
    async fn failed_search_is_retried_on_next_run() {
        let cache_root = temp_dir("archivist-e2e-cache");
        let offline = StubArchive {
            search_error: Some("connection reset".into()),
            ..StubArchive::default()
        };
        let first = fixture(offline, ScriptedJudge::structured(mario_judge), &cache_root);
        let graph = build_archive_graph(&first.config).unwrap();
        let state = run_query(&graph, QUERY, None, &SilentProgress).await;
        assert_eq!(state.errors[0], "Search error: network error: connection reset");
        assert!(first.config.cache.lookup(QUERY).await.is_none());

        let second = fixture(mario_archive(), ScriptedJudge::structured(mario_judge), &cache_root);
        let graph = build_archive_graph(&second.config).unwrap();
        let state = run_query(&graph, QUERY, None, &SilentProgress).await;

        assert_eq!(*second.archive.search_calls.lock().unwrap(), 1);
        assert_eq!(state.cached_results, Some(false));
        assert_eq!(state.filtered_results(), [MARIO_DE, MARIO_US]);
        assert!(state.errors.is_empty(), "unexpected errors: {:?}", state.errors);
        assert!(second.config.cache.lookup(QUERY).await.is_some());

        cleanup(&first);
        let _ = std::fs::remove_dir_all(&second.config.download_dir);
    }

    #[tokio::test]
    async fn metadata_failure_keeps_earlier_records() {
        let cache_root = temp_dir("archivist-e2e-cache");
        let mut archive = mario_archive();
        archive.items.remove(MARIO_US);
        let fx = fixture(archive, ScriptedJudge::structured(accept_all), &cache_root);
        let graph = build_archive_graph(&fx.config).unwrap();

        let state = run_query(&graph, QUERY, None, &SilentProgress).await;

        let metadata = state.metadata.as_ref().unwrap();
        assert_eq!(metadata.keys().collect::<Vec<_>>(), [MARIO_DE]);
        assert!(state.errors.iter().any(|e| e.starts_with(&format!("Metadata error for {MARIO_US}:"))));
        assert_eq!(
            *fx.archive.metadata_calls.lock().unwrap(),
            [MARIO_DE, MARIO_US]
        );
        // Later stages still ran on what was fetched.
        assert_eq!(state.entries_to_consider(), [MARIO_DE]);
        assert_eq!(state.pdfs_to_download.as_ref().unwrap()[MARIO_DE], [TEXT_PDF]);

        cleanup(&fx);
    }

    #[tokio::test]
    async fn subsets_hold_along_the_pipeline() {
        let cache_root = temp_dir("archivist-e2e-cache");
        let fx = fixture(mario_archive(), ScriptedJudge::structured(accept_all), &cache_root);
        let graph = build_archive_graph(&fx.config).unwrap();

        let state = run_query(&graph, QUERY, Some("subset-check"), &SilentProgress).await;

        let results = state.results();
        assert!(state.filtered_results().iter().all(|id| results.contains(id)));
        assert!(
            state
                .entries_to_consider()
                .iter()
                .all(|id| state.filtered_results().contains(id))
        );
        for (id, files) in state.pdfs_to_download.as_ref().unwrap() {
            assert!(state.entries_to_consider().contains(id));
            let listing = &state.metadata.as_ref().unwrap()[id].files;
            assert!(files.iter().all(|f| listing.iter().any(|l| &l.name == f)));
        }
        // US manual has no files.
        assert!(
            state
                .errors
                .contains(&format!("No files present for entry {MARIO_US}"))
        );
        assert!(fx.config.cache.lookup("subset-check").await.is_some());

        cleanup(&fx);
    }

    #[tokio::test]
    async fn empty_search_flows_through_short_circuits() {
        let cache_root = temp_dir("archivist-e2e-cache");
        let archive = StubArchive {
            search: Some(SearchResponse::from_items(vec![])),
            ..StubArchive::default()
        };
        let fx = fixture(archive, ScriptedJudge::structured(accept_all), &cache_root);
        let graph = build_archive_graph(&fx.config).unwrap();

        let state = run_query(&graph, "nothing matches", None, &SilentProgress).await;

        assert_eq!(
            state.errors,
            [
                "No good search result found",
                "No results to filter",
                "No filtered results to get metadata for",
                "No metadata information to check",
                "No entries_to_consider information to check",
            ]
        );
        assert_eq!(fx.judge.call_count(), 0);

        cleanup(&fx);
    }

    #[test]
    fn unusable_download_dir_fails_at_construction() {
        let cache_root = temp_dir("archivist-e2e-cache");
        let mut fx = fixture(StubArchive::default(), ScriptedJudge::structured(accept_all), &cache_root);
        let _ = std::fs::remove_dir_all(&fx.config.download_dir);
        fx.config.download_dir = fx.config.download_dir.join("missing");

        assert!(build_archive_graph(&fx.config).is_err());
        let _ = std::fs::remove_dir_all(&cache_root);
    }

    #[test]
    fn standard_topology() {
        let cache_root = temp_dir("archivist-e2e-cache");
        let fx = fixture(StubArchive::default(), ScriptedJudge::structured(accept_all), &cache_root);
        let graph = build_archive_graph(&fx.config).unwrap();

        assert_eq!(
            render_topology(&graph),
            "cache -> metadata if cached, else search\n\
             search -> filter\n\
             filter -> state_writer\n\
             state_writer -> metadata\n\
             metadata -> finder\n\
             finder -> file_finder\n\
             file_finder -> downloader\n\
             downloader -> end\n"
        );
        assert_eq!(render_standard_topology(), render_topology(&graph));

        cleanup(&fx);
    }
}
