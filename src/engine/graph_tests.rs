// Tests for stage graph validation and execution
use crate::{
    engine::{
        channel::{ChannelId, InMemoryProgressChannel, ProgressChannel},
        graph::{NoopObserver, Stage, StageContext, StageGraph, END},
        interrupt::InterruptGate,
        progress::ProgressReporter,
        stages::{self, generation_graph},
        testing::{scripted_services, ScriptedGenerator},
    },
    models::{ProgressEvent, RunId, RunState, StatePatch},
    ForgeError, Result,
};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Test helpers

/// Stage that writes one key, optionally after a delay
struct WriteStage {
    name: &'static str,
    key: &'static str,
    value: &'static str,
    delay: Option<Duration>,
    runs: Arc<AtomicUsize>,
}

impl WriteStage {
    fn new(name: &'static str, key: &'static str, value: &'static str) -> Self {
        Self {
            name,
            key,
            value,
            delay: None,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Stage for WriteStage {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, _state: &RunState, _ctx: &StageContext) -> Result<StatePatch> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(StatePatch::new().set(self.key, self.value).usage(7, 0.01))
    }
}

/// Join stage that checks every branch output is visible
struct JoinStage {
    required: Vec<&'static str>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Stage for JoinStage {
    fn name(&self) -> &str {
        "join"
    }

    async fn run(&self, state: &RunState, _ctx: &StageContext) -> Result<StatePatch> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        for key in &self.required {
            if !state.contains(key) {
                return Err(ForgeError::Internal(format!("missing branch output '{}'", key)));
            }
        }
        Ok(StatePatch::new().set("joined", true))
    }
}

struct FailingStage;

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        "explode"
    }

    async fn run(&self, _state: &RunState, _ctx: &StageContext) -> Result<StatePatch> {
        Err(ForgeError::Generation("model unavailable".to_string()))
    }
}

fn write(name: &'static str, key: &'static str) -> Arc<dyn Stage> {
    Arc::new(WriteStage::new(name, key, name))
}

fn context(channel: Arc<InMemoryProgressChannel>) -> StageContext {
    let run_id = RunId::new();
    let progress = ProgressReporter::new(channel.clone(), run_id.clone());
    let gate = InterruptGate::for_run(channel, &run_id);
    StageContext::new(progress, gate)
}

async fn drain(mut subscription: crate::engine::channel::EventSubscription) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), subscription.next()).await
    {
        events.push(event);
    }
    events
}

fn flag_set(state: &RunState) -> bool {
    state.get_bool("flag")
}

fn invalid_graph(result: Result<StageGraph>) -> String {
    match result {
        Err(ForgeError::InvalidGraph(message)) => message,
        Err(other) => panic!("expected InvalidGraph, got {:?}", other),
        Ok(_) => panic!("expected InvalidGraph, graph was accepted"),
    }
}

// Validation

#[test]
fn test_rejects_unknown_target() {
    let message = invalid_graph(
        StageGraph::builder()
            .stage(write("a", "a"))
            .start("a")
            .edge("a", "missing")
            .build(),
    );
    assert!(message.contains("missing"));
}

#[test]
fn test_rejects_stage_without_edge() {
    let message = invalid_graph(
        StageGraph::builder()
            .stage(write("a", "a"))
            .stage(write("b", "b"))
            .start("a")
            .edge("a", "b")
            .build(),
    );
    assert!(message.contains("'b' has no outgoing edge"));
}

#[test]
fn test_rejects_cycle() {
    let message = invalid_graph(
        StageGraph::builder()
            .stage(write("a", "a"))
            .stage(write("b", "b"))
            .start("a")
            .edge("a", "b")
            .conditional("b", "loop back", flag_set, "a", END)
            .build(),
    );
    assert!(message.contains("cycle"));
}

#[test]
fn test_rejects_unreachable_stage() {
    let message = invalid_graph(
        StageGraph::builder()
            .stage(write("a", "a"))
            .stage(write("island", "i"))
            .start("a")
            .edge("a", END)
            .edge("island", END)
            .build(),
    );
    assert!(message.contains("unreachable"));
}

#[test]
fn test_rejects_missing_start_and_duplicates() {
    invalid_graph(StageGraph::builder().stage(write("a", "a")).edge("a", END).build());

    let message = invalid_graph(
        StageGraph::builder()
            .stage(write("a", "a"))
            .stage(write("a", "a"))
            .start("a")
            .edge("a", END)
            .build(),
    );
    assert!(message.contains("duplicate"));
}

#[test]
fn test_rejects_branch_that_skips_join() {
    let message = invalid_graph(
        StageGraph::builder()
            .stage(write("split", "s"))
            .stage(write("left", "l"))
            .stage(write("right", "r"))
            .stage(write("join", "j"))
            .start("split")
            .fan_out("split", ["left", "right"], "join")
            .edge("left", "join")
            .edge("right", END)
            .edge("join", END)
            .build(),
    );
    assert!(message.contains("'right' must lead directly to join"));
}

#[test]
fn test_generation_graph_has_four_paths() {
    let (services, _) = scripted_services(Arc::new(ScriptedGenerator::new()));
    let graph = generation_graph(&services).unwrap();
    let paths = graph.paths();
    assert_eq!(paths.len(), 4);

    for path in &paths {
        assert_eq!(path.first().map(String::as_str), Some(stages::RESEARCH));
        assert_eq!(path.last().map(String::as_str), Some(stages::ASSEMBLE));
        assert!(path.contains(&stages::RAG_CONTEXT.to_string()));
        assert!(path.contains(&stages::BUILD_STYLE_GUIDE.to_string()));
    }
    let with_both_reviews = paths
        .iter()
        .filter(|path| {
            path.contains(&stages::OUTLINE_REVIEW.to_string())
                && path.contains(&stages::EDIT_REVIEW.to_string())
        })
        .count();
    assert_eq!(with_both_reviews, 1);
}

// Execution

#[tokio::test]
async fn test_conditional_edge_routes_on_state() {
    let graph = StageGraph::builder()
        .stage(write("first", "first"))
        .stage(write("optional", "optional"))
        .stage(write("last", "last"))
        .start("first")
        .conditional("first", "flag set", flag_set, "optional", "last")
        .edge("optional", "last")
        .edge("last", END)
        .build()
        .unwrap();
    let channel = Arc::new(InMemoryProgressChannel::new());

    let mut skipped = RunState::new();
    skipped.insert("flag", json!(false));
    let result = graph
        .execute(skipped, &context(channel.clone()), &NoopObserver)
        .await
        .unwrap();
    assert!(!result.contains("optional"));
    assert!(result.contains("last"));

    let mut taken = RunState::new();
    taken.insert("flag", json!(true));
    let result = graph
        .execute(taken, &context(channel), &NoopObserver)
        .await
        .unwrap();
    assert!(result.contains("optional"));
    assert_eq!(result.get_u64("total_tokens"), 21);
}

#[tokio::test]
async fn test_fan_out_waits_for_every_branch() {
    let join_runs = Arc::new(AtomicUsize::new(0));
    let graph = StageGraph::builder()
        .stage(write("split", "split"))
        .stage(Arc::new(
            WriteStage::new("slow", "slow_out", "s").delayed(Duration::from_millis(80)),
        ))
        .stage(Arc::new(WriteStage::new("fast", "fast_out", "f")))
        .stage(Arc::new(JoinStage {
            required: vec!["slow_out", "fast_out"],
            runs: join_runs.clone(),
        }))
        .start("split")
        .fan_out("split", ["slow", "fast"], "join")
        .edge("slow", "join")
        .edge("fast", "join")
        .edge("join", END)
        .build()
        .unwrap();

    let channel = Arc::new(InMemoryProgressChannel::new());
    let ctx = context(channel);
    let result = graph
        .execute(RunState::new(), &ctx, &NoopObserver)
        .await
        .unwrap();

    assert_eq!(join_runs.load(Ordering::SeqCst), 1);
    assert!(result.get_bool("joined"));
    // Usage from both branches is summed, not overwritten
    assert_eq!(result.get_u64("total_tokens"), 21);
}

#[tokio::test]
async fn test_fan_out_conflicting_writes_fail() {
    let graph = StageGraph::builder()
        .stage(write("split", "split"))
        .stage(Arc::new(WriteStage::new("left", "shared", "l")))
        .stage(Arc::new(WriteStage::new("right", "shared", "r")))
        .stage(write("join", "join"))
        .start("split")
        .fan_out("split", ["left", "right"], "join")
        .edge("left", "join")
        .edge("right", "join")
        .edge("join", END)
        .build()
        .unwrap();

    let channel = Arc::new(InMemoryProgressChannel::new());
    let err = graph
        .execute(RunState::new(), &context(channel), &NoopObserver)
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::StateConflict { ref key } if key == "shared"));
}

#[tokio::test]
async fn test_stage_failure_aborts_and_publishes_failed() {
    let after = Arc::new(WriteStage::new("after", "after", "x"));
    let after_runs = after.runs.clone();
    let graph = StageGraph::builder()
        .stage(write("before", "before"))
        .stage(Arc::new(FailingStage))
        .stage(after)
        .start("before")
        .edge("before", "explode")
        .edge("explode", "after")
        .edge("after", END)
        .build()
        .unwrap();

    let channel = Arc::new(InMemoryProgressChannel::new());
    let ctx = context(channel.clone());
    let subscription = channel
        .subscribe(&ChannelId::for_run(&ctx.run_id))
        .await
        .unwrap();

    let err = graph
        .execute(RunState::new(), &ctx, &NoopObserver)
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some("explode"));
    assert!(err.to_string().contains("model unavailable"));
    assert_eq!(after_runs.load(Ordering::SeqCst), 0);

    let names: Vec<_> = drain(subscription)
        .await
        .iter()
        .map(|event| event.event_name())
        .collect();
    assert_eq!(
        names,
        vec!["stage:started", "stage:completed", "stage:started", "stage:failed"]
    );
}

#[tokio::test]
async fn test_generation_graph_without_reviews_completes() {
    let generator = Arc::new(ScriptedGenerator::new());
    let (services, articles) = scripted_services(generator.clone());
    let graph = generation_graph(&services).unwrap();
    let channel = Arc::new(InMemoryProgressChannel::new());
    let ctx = context(channel);
    let request = crate::models::GenerationRequest::new("Edge caching for APIs");
    let state = RunState::from_request(&ctx.run_id, "owner-1", &request);

    let result = graph.execute(state, &ctx, &NoopObserver).await.unwrap();

    let article_id = result.get_str("result_ref").unwrap().to_string();
    let article = articles.get_article(&article_id).await.unwrap();
    assert!(article.content.contains("Polished body."));
    assert!(!article.content.contains("Sure, here it is"));
    assert_eq!(generator.prompts_containing("Write the section"), 2);
    assert!(result.get_u64("total_tokens") > 0);
}
