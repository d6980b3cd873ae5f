//! Stage graph: node registry, edges, validation, and the sequential executor.
//!
//! A [`Graph`] is a small fixed DAG. Every node but the finish node has
//! exactly one outgoing edge, either direct or a two-way branch decided by a
//! predicate over the current state. [`Graph::run`] walks it one node at a
//! time, retrying failed nodes per their [`RetryPolicy`] and turning any
//! failure that survives the retries into an error note on the state.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use archivist_shared::{ArchivistError, PipelineState, Result, RetryConfig, StateUpdate};

// ---------------------------------------------------------------------------
// Stage identity
// ---------------------------------------------------------------------------

/// Every stage the archive pipeline knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageId {
    CacheRead,
    Search,
    Filter,
    CacheWrite,
    Metadata,
    Finder,
    FileFinder,
    Downloader,
}

impl StageId {
    /// Stable name used in logs and error notes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheRead => "cache",
            Self::Search => "search",
            Self::Filter => "filter",
            Self::CacheWrite => "state_writer",
            Self::Metadata => "metadata",
            Self::Finder => "finder",
            Self::FileFinder => "file_finder",
            Self::Downloader => "downloader",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Nodes, edges, policies
// ---------------------------------------------------------------------------

/// One pipeline stage.
///
/// `run` describes its changes as a [`StateUpdate`]. Collaborator failures the
/// stage knows how to handle belong in the update's error notes; an `Err` means
/// the stage itself broke and is subject to the retry policy.
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> StageId;

    async fn run(&self, state: &PipelineState) -> Result<StateUpdate>;
}

/// Branch condition evaluated against the state after the source node ran.
pub type Predicate = fn(&PipelineState) -> bool;

/// Outgoing edge of a node.
#[derive(Debug, Clone, Copy)]
pub enum Edge {
    Direct {
        from: StageId,
        to: StageId,
    },
    Branch {
        from: StageId,
        predicate: Predicate,
        when_true: StageId,
        when_false: StageId,
    },
}

impl Edge {
    pub fn source(&self) -> StageId {
        match self {
            Self::Direct { from, .. } | Self::Branch { from, .. } => *from,
        }
    }

    /// Possible successors, in `[true, false]` order for branches.
    pub fn targets(&self) -> Vec<StageId> {
        match self {
            Self::Direct { to, .. } => vec![*to],
            Self::Branch {
                when_true,
                when_false,
                ..
            } => vec![*when_true, *when_false],
        }
    }

    /// Successor for `state`. Evaluates a branch predicate exactly once.
    fn next(&self, state: &PipelineState) -> StageId {
        match self {
            Self::Direct { to, .. } => *to,
            Self::Branch {
                predicate,
                when_true,
                when_false,
                ..
            } => {
                if predicate(state) {
                    *when_true
                } else {
                    *when_false
                }
            }
        }
    }
}

/// How often a node is attempted before its failure is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least 1.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.backoff_ms))
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called before a stage's first attempt.
    fn stage_started(&self, stage: StageId);
    /// Called once the stage's update (or failure note) has been applied.
    fn stage_finished(&self, stage: StageId, state: &PipelineState, elapsed: Duration);
    /// Called when the run completes.
    fn done(&self, state: &PipelineState);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _stage: StageId) {}
    fn stage_finished(&self, _stage: StageId, _state: &PipelineState, _elapsed: Duration) {}
    fn done(&self, _state: &PipelineState) {}
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

struct Registered {
    node: Arc<dyn Node>,
    policy: RetryPolicy,
}

/// Collects nodes and edges; [`GraphBuilder::build`] validates the wiring.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: BTreeMap<StageId, Registered>,
    duplicates: Vec<StageId>,
    edges: Vec<Edge>,
    entry: Option<StageId>,
    finish: Option<StageId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(mut self, node: Arc<dyn Node>, policy: RetryPolicy) -> Self {
        let id = node.id();
        if self.nodes.contains_key(&id) {
            self.duplicates.push(id);
        } else {
            self.nodes.insert(id, Registered { node, policy });
        }
        self
    }

    /// Append already constructed edges, keeping their order.
    pub fn add_edges(mut self, edges: impl IntoIterator<Item = Edge>) -> Self {
        self.edges.extend(edges);
        self
    }

    pub fn add_edge(mut self, from: StageId, to: StageId) -> Self {
        self.edges.push(Edge::Direct { from, to });
        self
    }

    pub fn add_branch(
        mut self,
        from: StageId,
        predicate: Predicate,
        when_true: StageId,
        when_false: StageId,
    ) -> Self {
        self.edges.push(Edge::Branch {
            from,
            predicate,
            when_true,
            when_false,
        });
        self
    }

    pub fn set_entry(mut self, stage: StageId) -> Self {
        self.entry = Some(stage);
        self
    }

    pub fn set_finish(mut self, stage: StageId) -> Self {
        self.finish = Some(stage);
        self
    }

    /// Validate the wiring and freeze it into a [`Graph`].
    pub fn build(self) -> Result<Graph> {
        if let Some(id) = self.duplicates.first() {
            return Err(ArchivistError::config(format!("node '{id}' registered twice")));
        }

        let entry = self
            .entry
            .ok_or_else(|| ArchivistError::config("graph has no entry node"))?;
        let finish = self
            .finish
            .ok_or_else(|| ArchivistError::config("graph has no finish node"))?;
        for (role, id) in [("entry", entry), ("finish", finish)] {
            if !self.nodes.contains_key(&id) {
                return Err(ArchivistError::config(format!(
                    "{role} node '{id}' is not registered"
                )));
            }
        }

        let mut outgoing: BTreeMap<StageId, Edge> = BTreeMap::new();
        for edge in &self.edges {
            for id in std::iter::once(edge.source()).chain(edge.targets()) {
                if !self.nodes.contains_key(&id) {
                    return Err(ArchivistError::config(format!(
                        "edge references unregistered node '{id}'"
                    )));
                }
            }
            if edge.source() == finish {
                return Err(ArchivistError::config(format!(
                    "finish node '{finish}' must not have outgoing edges"
                )));
            }
            if outgoing.insert(edge.source(), *edge).is_some() {
                return Err(ArchivistError::config(format!(
                    "node '{}' has more than one outgoing edge",
                    edge.source()
                )));
            }
        }
        for id in self.nodes.keys() {
            if *id != finish && !outgoing.contains_key(id) {
                return Err(ArchivistError::config(format!(
                    "node '{id}' has no outgoing edge"
                )));
            }
        }

        // Every node reachable from the entry.
        let mut seen = BTreeSet::from([entry]);
        let mut queue = VecDeque::from([entry]);
        while let Some(id) = queue.pop_front() {
            for next in outgoing.get(&id).map(Edge::targets).unwrap_or_default() {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        if let Some(id) = self.nodes.keys().find(|id| !seen.contains(id)) {
            return Err(ArchivistError::config(format!(
                "node '{id}' is unreachable from '{entry}'"
            )));
        }

        if let Some(id) = find_cycle(entry, &outgoing) {
            return Err(ArchivistError::config(format!(
                "graph contains a cycle through '{id}'"
            )));
        }

        Ok(Graph {
            nodes: self.nodes,
            outgoing,
            edges: self.edges,
            entry,
            finish,
        })
    }
}

/// Depth-first search for a back edge; returns a node on the cycle.
fn find_cycle(entry: StageId, outgoing: &BTreeMap<StageId, Edge>) -> Option<StageId> {
    fn visit(
        id: StageId,
        outgoing: &BTreeMap<StageId, Edge>,
        on_path: &mut BTreeSet<StageId>,
        done: &mut BTreeSet<StageId>,
    ) -> Option<StageId> {
        if done.contains(&id) {
            return None;
        }
        if !on_path.insert(id) {
            return Some(id);
        }
        for next in outgoing.get(&id).map(Edge::targets).unwrap_or_default() {
            if let Some(found) = visit(next, outgoing, on_path, done) {
                return Some(found);
            }
        }
        on_path.remove(&id);
        done.insert(id);
        None
    }

    visit(entry, outgoing, &mut BTreeSet::new(), &mut BTreeSet::new())
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A validated stage graph.
pub struct Graph {
    nodes: BTreeMap<StageId, Registered>,
    outgoing: BTreeMap<StageId, Edge>,
    edges: Vec<Edge>,
    entry: StageId,
    finish: StageId,
}

impl Graph {
    pub fn entry(&self) -> StageId {
        self.entry
    }

    pub fn finish(&self) -> StageId {
        self.finish
    }

    /// Edges in the order they were added.
    pub fn topology(&self) -> &[Edge] {
        &self.edges
    }

    /// Run the graph from the entry node to the finish node.
    ///
    /// Always returns a state: failures that survive a node's retry policy are
    /// appended to `error` and the walk continues with the state unchanged.
    #[instrument(skip_all, fields(query = %initial.query))]
    pub async fn run(
        &self,
        initial: PipelineState,
        progress: &dyn ProgressReporter,
    ) -> PipelineState {
        let mut state = initial;
        let mut current = self.entry;

        loop {
            // `build` guarantees every reachable id is registered.
            let Some(registered) = self.nodes.get(&current) else {
                break;
            };

            progress.stage_started(current);
            let started = Instant::now();
            info!(stage = %current, "stage started");

            state = match run_with_retry(current, registered, &state).await {
                Ok(update) => state.apply(update),
                Err(e) => {
                    warn!(stage = %current, error = %e, "stage failed");
                    state.apply(StateUpdate::new().error(e.to_string()))
                }
            };

            let elapsed = started.elapsed();
            info!(
                stage = %current,
                elapsed_ms = elapsed.as_millis() as u64,
                errors = state.errors.len(),
                "stage finished"
            );
            progress.stage_finished(current, &state, elapsed);

            if current == self.finish {
                break;
            }
            match self.outgoing.get(&current) {
                Some(edge) => current = edge.next(&state),
                None => break,
            }
        }

        progress.done(&state);
        state
    }
}

/// Attempt a node up to its policy's bound.
///
/// Each attempt runs on its own task so a panicking stage is reported as a
/// failure instead of tearing down the run.
async fn run_with_retry(
    stage: StageId,
    registered: &Registered,
    state: &PipelineState,
) -> Result<StateUpdate> {
    let policy = registered.policy;
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 && !policy.backoff.is_zero() {
            tokio::time::sleep(policy.backoff).await;
        }

        let node = Arc::clone(&registered.node);
        let input = state.clone();
        let outcome = tokio::spawn(async move { node.run(&input).await }).await;

        match outcome {
            Ok(Ok(update)) => return Ok(update),
            Ok(Err(e)) => last_error = e.to_string(),
            Err(join_error) if join_error.is_panic() => {
                last_error = format!("panicked: {}", panic_message(join_error.into_panic()));
            }
            Err(join_error) => last_error = join_error.to_string(),
        }
        debug!(%stage, attempt, max = policy.max_attempts, error = %last_error, "attempt failed");
    }

    Err(ArchivistError::stage(stage, policy.max_attempts, last_error))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
