//! Pipeline engine for Archivist.
//!
//! This crate holds the stage cache, the graph builder and executor, the
//! eight archive stages, and the standard wiring that ties them together.

pub mod cache;
pub mod graph;
pub mod pipeline;
pub mod prompts;
pub mod stages;

pub use cache::{StageCache, hash_key};
pub use graph::{
    Edge, Graph, GraphBuilder, Node, ProgressReporter, RetryPolicy, SilentProgress, StageId,
};
pub use pipeline::{
    ArchivePipelineConfig, build_archive_graph, render_standard_topology, render_topology,
    run_query,
};
