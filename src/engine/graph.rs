// Stage Graph Executor
// A static, validated graph of named stages run against one Run State

//! # Stage Graph
//!
//! A [`StageGraph`] is a finite directed graph whose nodes are [`Stage`]s. Each node has
//! exactly one outgoing [`Edge`]:
//!
//! - `To(next)`: unconditional
//! - `Conditional`: a plain function over the state picks one of two targets
//! - `FanOut`: run several branch stages concurrently, then continue at `join` once
//!   every branch has returned (barrier)
//!
//! The graph is built once through [`StageGraphBuilder`], which rejects anything the
//! executor could not run to completion: unknown targets, unreachable nodes, missing
//! edges, and cycles. Because the graph is acyclic and every node has an outgoing
//! edge, every execution ends at [`END`] or at the first stage error.
//!
//! ## Execution
//!
//! ```text
//! current = start
//! loop:
//!     patch = run(current, state)        // stage:started / stage:completed
//!     state.apply(patch)
//!     current = edge(current).next(state)
//! ```
//!
//! A failing stage aborts the run. The executor publishes `stage:failed` and returns the
//! error; it never writes terminal run status itself.
//!
//! ## Rust Learning Notes:
//!
//! ### Function Pointers as Predicates
//! Conditional edges hold `fn(&RunState) -> bool` rather than boxed closures. Function
//! pointers are `Copy`, carry no captured state, and keep the graph definition static
//! and inspectable, which is what lets [`StageGraph::paths`] enumerate every route.

use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::engine::interrupt::InterruptGate;
use crate::engine::progress::ProgressReporter;
use crate::models::{RunId, RunState, StatePatch};
use crate::{ForgeError, Result};

/// Terminal node name
pub const END: &str = "__end__";

/// Predicate deciding a conditional edge
pub type Predicate = fn(&RunState) -> bool;

/// Per-run handles available to every stage
#[derive(Clone)]
pub struct StageContext {
    pub run_id: RunId,
    pub progress: ProgressReporter,
    pub gate: InterruptGate,
    pub max_review_rounds: u32,
}

impl StageContext {
    pub fn new(progress: ProgressReporter, gate: InterruptGate) -> Self {
        Self {
            run_id: progress.run_id().clone(),
            progress,
            gate,
            max_review_rounds: crate::engine::review::MAX_REVIEW_ROUNDS,
        }
    }

    pub fn with_max_review_rounds(mut self, rounds: u32) -> Self {
        self.max_review_rounds = rounds.max(1);
        self
    }
}

/// One named step of a workflow
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Compute this stage's contribution from the current state
    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StatePatch>;
}

/// Hook notified as the executor enters each stage
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn stage_entered(&self, stage: &str) -> Result<()>;
}

/// Observer that ignores every notification
pub struct NoopObserver;

#[async_trait]
impl ExecutionObserver for NoopObserver {
    async fn stage_entered(&self, _stage: &str) -> Result<()> {
        Ok(())
    }
}

/// Outgoing edge of a node
#[derive(Clone)]
pub enum Edge {
    To(String),
    Conditional {
        label: &'static str,
        predicate: Predicate,
        if_true: String,
        if_false: String,
    },
    FanOut {
        branches: Vec<String>,
        join: String,
    },
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::To(next) => write!(f, "-> {}", next),
            Edge::Conditional {
                label,
                if_true,
                if_false,
                ..
            } => write!(f, "-> {} if {} else {}", if_true, label, if_false),
            Edge::FanOut { branches, join } => {
                write!(f, "-> [{}] -> {}", branches.join(", "), join)
            }
        }
    }
}

impl Edge {
    /// Every node this edge can lead to
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Edge::To(next) => vec![next.as_str()],
            Edge::Conditional {
                if_true, if_false, ..
            } => vec![if_true.as_str(), if_false.as_str()],
            Edge::FanOut { branches, .. } => branches.iter().map(String::as_str).collect(),
        }
    }
}

/// Builder collecting stages and edges before validation
#[derive(Default)]
pub struct StageGraphBuilder {
    stages: HashMap<String, Arc<dyn Stage>>,
    order: Vec<String>,
    edges: HashMap<String, Edge>,
    start: Option<String>,
    problems: Vec<String>,
}

impl StageGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        let name = stage.name().to_string();
        if name == END || self.stages.contains_key(&name) {
            self.problems.push(format!("duplicate or reserved stage name '{}'", name));
        } else {
            self.order.push(name.clone());
            self.stages.insert(name, stage);
        }
        self
    }

    pub fn start(mut self, name: impl Into<String>) -> Self {
        if self.start.is_some() {
            self.problems.push("start node declared twice".to_string());
        }
        self.start = Some(name.into());
        self
    }

    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.with_edge(from.into(), Edge::To(to.into()))
    }

    pub fn conditional(
        self,
        from: impl Into<String>,
        label: &'static str,
        predicate: Predicate,
        if_true: impl Into<String>,
        if_false: impl Into<String>,
    ) -> Self {
        self.with_edge(
            from.into(),
            Edge::Conditional {
                label,
                predicate,
                if_true: if_true.into(),
                if_false: if_false.into(),
            },
        )
    }

    pub fn fan_out<I, S>(self, from: impl Into<String>, branches: I, join: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_edge(
            from.into(),
            Edge::FanOut {
                branches: branches.into_iter().map(Into::into).collect(),
                join: join.into(),
            },
        )
    }

    fn with_edge(mut self, from: String, edge: Edge) -> Self {
        if self.edges.contains_key(&from) {
            self.problems
                .push(format!("stage '{}' has more than one outgoing edge", from));
        } else {
            self.edges.insert(from, edge);
        }
        self
    }

    /// Validate and freeze the graph
    pub fn build(self) -> Result<StageGraph> {
        if let Some(problem) = self.problems.first() {
            return Err(ForgeError::InvalidGraph(problem.clone()));
        }
        let start = self
            .start
            .clone()
            .ok_or_else(|| ForgeError::InvalidGraph("no start stage".to_string()))?;
        if !self.stages.contains_key(&start) {
            return Err(ForgeError::InvalidGraph(format!(
                "start stage '{}' is not defined",
                start
            )));
        }

        for from in self.edges.keys() {
            if !self.stages.contains_key(from) {
                return Err(ForgeError::InvalidGraph(format!(
                    "edge from undefined stage '{}'",
                    from
                )));
            }
        }

        let mut branch_nodes = HashSet::new();
        for name in &self.order {
            let edge = self.edges.get(name).ok_or_else(|| {
                ForgeError::InvalidGraph(format!("stage '{}' has no outgoing edge", name))
            })?;
            for target in edge.targets() {
                if target != END && !self.stages.contains_key(target) {
                    return Err(ForgeError::InvalidGraph(format!(
                        "stage '{}' points to undefined stage '{}'",
                        name, target
                    )));
                }
            }
            if let Edge::FanOut { branches, join } = edge {
                if branches.is_empty() {
                    return Err(ForgeError::InvalidGraph(format!(
                        "fan-out from '{}' has no branches",
                        name
                    )));
                }
                if !self.stages.contains_key(join) {
                    return Err(ForgeError::InvalidGraph(format!(
                        "fan-out from '{}' joins at undefined stage '{}'",
                        name, join
                    )));
                }
                for branch in branches {
                    match self.edges.get(branch) {
                        Some(Edge::To(next)) if next == join => {}
                        _ => {
                            return Err(ForgeError::InvalidGraph(format!(
                                "branch '{}' must lead directly to join '{}'",
                                branch, join
                            )))
                        }
                    }
                    if !branch_nodes.insert(branch.clone()) || *branch == start {
                        return Err(ForgeError::InvalidGraph(format!(
                            "branch '{}' is shared or is the start stage",
                            branch
                        )));
                    }
                }
            }
        }

        let graph = StageGraph {
            stages: self.stages,
            order: self.order,
            edges: self.edges,
            start,
        };
        graph.check_acyclic()?;
        graph.check_reachability()?;
        Ok(graph)
    }
}

/// Validated, immutable stage graph
pub struct StageGraph {
    stages: HashMap<String, Arc<dyn Stage>>,
    order: Vec<String>,
    edges: HashMap<String, Edge>,
    start: String,
}

impl StageGraph {
    pub fn builder() -> StageGraphBuilder {
        StageGraphBuilder::new()
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    /// Stage names in declaration order
    pub fn stage_names(&self) -> &[String] {
        &self.order
    }

    pub fn edge(&self, stage: &str) -> Option<&Edge> {
        self.edges.get(stage)
    }

    /// Successors used for structural checks; a fan-out leads to its branches,
    /// and each branch leads to the join
    fn successors(&self, node: &str) -> Vec<&str> {
        self.edges
            .get(node)
            .map(|edge| edge.targets())
            .unwrap_or_default()
    }

    fn check_acyclic(&self) -> Result<()> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut marks: HashMap<&str, u8> = HashMap::new();
        let mut stack: Vec<(&str, usize)> = vec![(self.start.as_str(), 0)];
        marks.insert(self.start.as_str(), 1);

        while let Some((node, index)) = stack.pop() {
            let successors = self.successors(node);
            if index < successors.len() {
                stack.push((node, index + 1));
                let next = successors[index];
                if next == END {
                    continue;
                }
                match marks.get(next).copied().unwrap_or(0) {
                    1 => {
                        return Err(ForgeError::InvalidGraph(format!(
                            "cycle through stage '{}'",
                            next
                        )))
                    }
                    0 => {
                        marks.insert(next, 1);
                        stack.push((next, 0));
                    }
                    _ => {}
                }
            } else {
                marks.insert(node, 2);
            }
        }
        Ok(())
    }

    fn check_reachability(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(self.start.as_str());
        seen.insert(self.start.as_str());
        let mut reaches_end = false;

        while let Some(node) = queue.pop_front() {
            for next in self.successors(node) {
                if next == END {
                    reaches_end = true;
                } else if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        if let Some(orphan) = self.order.iter().find(|name| !seen.contains(name.as_str())) {
            return Err(ForgeError::InvalidGraph(format!(
                "stage '{}' is unreachable from '{}'",
                orphan, self.start
            )));
        }
        if !reaches_end {
            return Err(ForgeError::InvalidGraph("end is unreachable".to_string()));
        }
        Ok(())
    }

    /// Every start-to-end sequence of stages; fan-out branches appear in declaration order
    pub fn paths(&self) -> Vec<Vec<String>> {
        let mut paths = Vec::new();
        self.collect_paths(&self.start, Vec::new(), &mut paths);
        paths
    }

    fn collect_paths(&self, node: &str, mut prefix: Vec<String>, out: &mut Vec<Vec<String>>) {
        if node == END {
            out.push(prefix);
            return;
        }
        prefix.push(node.to_string());
        match self.edges.get(node) {
            Some(Edge::To(next)) => self.collect_paths(next, prefix, out),
            Some(Edge::Conditional {
                if_true, if_false, ..
            }) => {
                self.collect_paths(if_true, prefix.clone(), out);
                self.collect_paths(if_false, prefix, out);
            }
            Some(Edge::FanOut { branches, join }) => {
                prefix.extend(branches.iter().cloned());
                self.collect_paths(join, prefix, out);
            }
            None => {}
        }
    }

    fn stage_named(&self, name: &str) -> Result<&Arc<dyn Stage>> {
        self.stages
            .get(name)
            .ok_or_else(|| ForgeError::InvalidGraph(format!("unknown stage '{}'", name)))
    }

    /// Run the graph from start to end
    ///
    /// Returns the final state, or the first stage error.
    pub async fn execute(
        &self,
        mut state: RunState,
        ctx: &StageContext,
        observer: &dyn ExecutionObserver,
    ) -> Result<RunState> {
        let mut current = self.start.clone();
        info!("▶️ Executing stage graph for run {}", ctx.run_id);

        while current != END {
            let patch = self.run_stage(&current, &state, ctx, observer).await?;
            state.apply(patch);

            let edge = self.edges.get(&current).ok_or_else(|| {
                ForgeError::InvalidGraph(format!("stage '{}' has no outgoing edge", current))
            })?;
            current = match edge {
                Edge::To(next) => next.clone(),
                Edge::Conditional {
                    label,
                    predicate,
                    if_true,
                    if_false,
                } => {
                    let taken = predicate(&state);
                    debug!("🔀 {} after {}: {}", label, current, taken);
                    if taken {
                        if_true.clone()
                    } else {
                        if_false.clone()
                    }
                }
                Edge::FanOut { branches, join } => {
                    let snapshot = &state;
                    let patches = try_join_all(
                        branches
                            .iter()
                            .map(|branch| self.run_stage(branch, snapshot, ctx, observer)),
                    )
                    .await?;
                    state.apply(StatePatch::merge_parallel(patches)?);
                    join.clone()
                }
            };
        }

        info!("🏁 Stage graph finished for run {}", ctx.run_id);
        Ok(state)
    }

    async fn run_stage(
        &self,
        name: &str,
        state: &RunState,
        ctx: &StageContext,
        observer: &dyn ExecutionObserver,
    ) -> Result<StatePatch> {
        let stage = self.stage_named(name)?;
        observer.stage_entered(name).await?;
        ctx.progress.stage_started(name).await;
        let started = Instant::now();

        match stage.run(state, ctx).await {
            Ok(patch) => {
                let tokens = Some(patch.tokens()).filter(|tokens| *tokens > 0);
                ctx.progress
                    .stage_completed(name, started.elapsed(), tokens)
                    .await;
                Ok(patch)
            }
            Err(e) => {
                ctx.progress.stage_failed(name, e.to_string()).await;
                Err(match e {
                    ForgeError::InterruptTimeout { .. } | ForgeError::StageExecution { .. } => e,
                    other => ForgeError::StageExecution {
                        stage: name.to_string(),
                        message: other.to_string(),
                    },
                })
            }
        }
    }
}
