//! Pipeline execution engine — the runner's select/dispatch/apply loop.
//!
//! Drives a [`PipelineGraph`] from its start node to completion: resolve the
//! current node's handler, run it under retry with a node-level timeout race,
//! merge its context updates, checkpoint, pick the next node from
//! `suggestedNextIds` or the first matching edge guard, and repeat until a
//! `Fail` outcome, an exit node, or an empty edge set ends the run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use pipeweave_types::{Checkpoint, Context, Outcome, PipeweaveError, Result, StageStatus};

use crate::edge_selection::select_next;
use crate::events::EventEmitter;
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::{default_registry, HandlerRegistry};
use crate::handlers::parallel::ParallelResult;
use crate::retry::{execute_with_retry, RetryConfig, RetryPolicy};
use crate::validation::validate_or_raise;

const RETRY_COUNT_PREFIX: &str = "internal.retry_count.";

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// A cooperative cancellation signal observable from any suspension point in
/// a run (handler execution, retry sleeps, parallel joins).
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)), notify: Arc::new(tokio::sync::Notify::new()) }
    }

    /// Request cancellation; wakes anything waiting on [`cancelled`](Self::cancelled).
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Configuration for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory under which per-node artifacts and the checkpoint file are written.
    pub logs_root: PathBuf,
    /// Hard bound on traversed nodes, guarding against cyclic graphs that never terminate.
    pub max_steps: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { logs_root: PathBuf::from("./pipeweave-logs"), max_steps: 10_000 }
    }
}

/// The result of a completed pipeline run.
#[derive(Debug)]
pub struct PipelineResult {
    pub completed_nodes: Vec<String>,
    pub node_outcomes: HashMap<String, StageStatus>,
    pub final_context: HashMap<String, serde_json::Value>,
    pub status: StageStatus,
    pub failure_reason: Option<String>,
}

/// The core pipeline executor. Owns a handler registry, an event emitter,
/// run configuration, and a cancellation token shared with any caller that
/// wants to interrupt an in-flight run.
pub struct PipelineExecutor {
    registry: Arc<HandlerRegistry>,
    events: EventEmitter,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl PipelineExecutor {
    pub fn new(registry: HandlerRegistry, config: PipelineConfig) -> Self {
        Self { registry: Arc::new(registry), events: EventEmitter::default(), config, cancel: CancellationToken::new() }
    }

    pub fn with_default_registry(config: PipelineConfig) -> Self {
        Self::new(default_registry(), config)
    }

    /// Build an executor that shares another run's registry, event channel,
    /// and cancellation token. Used when a `sub_pipeline` node recurses into
    /// the runner: the nested run must see the same handler set (and
    /// therefore the same injected backend) and publish onto the same event
    /// stream as the parent, just under its own `logs_root`.
    pub(crate) fn with_shared(
        registry: Arc<HandlerRegistry>,
        events: EventEmitter,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self { registry, events, config, cancel }
    }

    /// Clone of the event emitter driving this run; subscribe before calling
    /// [`run`](Self::run) to observe every event from `PIPELINE_STARTED` on.
    pub fn events(&self) -> EventEmitter {
        self.events.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `graph` to completion with a fresh [`Context`].
    pub async fn run(&self, graph: &PipelineGraph) -> Result<PipelineResult> {
        self.run_with_context(graph, Context::new()).await
    }

    /// Run `graph` to completion starting from a caller-supplied context
    /// (e.g. one seeded with CLI flags or resumed from a checkpoint).
    pub async fn run_with_context(&self, graph: &PipelineGraph, context: Context) -> Result<PipelineResult> {
        validate_or_raise(graph)?;

        let start = graph.start_node().ok_or_else(|| {
            PipeweaveError::ValidationError("pipeline has no start node".into())
        })?;

        std::fs::create_dir_all(&self.config.logs_root)?;

        self.events.pipeline_started(&graph.name, graph.all_nodes().count());
        let run_started = Instant::now();

        let mut current_id = start.id.clone();
        let mut completed_nodes = Vec::new();
        let mut node_outcomes = HashMap::new();
        let mut steps = 0usize;
        let mut final_status = StageStatus::Success;
        let mut failure_reason = None;

        loop {
            if self.cancel.is_cancelled() {
                failure_reason = Some("cancelled".to_string());
                final_status = StageStatus::Fail;
                break;
            }

            steps += 1;
            if steps > self.config.max_steps {
                failure_reason = Some(format!("exceeded max_steps ({})", self.config.max_steps));
                final_status = StageStatus::Fail;
                break;
            }

            let node = graph.node(&current_id).ok_or_else(|| {
                PipeweaveError::ValidationError(format!("node '{current_id}' not found"))
            })?;

            let handler_type = self.registry.resolve_type(node);
            self.events.stage_started(&node.id, &handler_type);
            let stage_started = Instant::now();

            let outcome = if handler_type == "parallel" {
                self.run_parallel_region(node, &context, graph).await?
            } else if handler_type == "sub_pipeline" {
                Box::pin(crate::handlers::sub_pipeline::run_sub_pipeline(
                    node,
                    &context,
                    Arc::clone(&self.registry),
                    self.events.prefixed(&node.id),
                    self.cancel.clone(),
                    &self.config,
                ))
                .await?
            } else {
                dispatch_node(&self.registry, node, &context, graph, &self.config.logs_root, &self.events, &self.cancel).await?
            };

            self.events.stage_completed(&node.id, outcome.status.as_str(), stage_started.elapsed().as_millis() as u64);

            context.apply_updates(outcome.context_updates.clone()).await;
            completed_nodes.push(node.id.clone());
            node_outcomes.insert(node.id.clone(), outcome.status);

            self.save_checkpoint(&current_id, &completed_nodes, &node_outcomes, &context).await?;

            if outcome.status == StageStatus::Fail {
                failure_reason = outcome.failure_reason.clone().or_else(|| Some("node failed".to_string()));
                final_status = StageStatus::Fail;
                break;
            }

            if graph.is_exit_node(node) {
                final_status = StageStatus::Success;
                break;
            }

            let snapshot = context.snapshot().await;
            let resolve = |key: &str| -> String {
                snapshot.get(key).map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                }).unwrap_or_default()
            };

            match select_next(&node.id, &outcome, &resolve, graph) {
                Some(next_id) => current_id = next_id,
                None => {
                    final_status = StageStatus::Success;
                    break;
                }
            }
        }

        let duration_ms = run_started.elapsed().as_millis() as u64;
        if final_status == StageStatus::Fail {
            let message = failure_reason.clone().unwrap_or_default();
            self.events.pipeline_failed(&graph.name, &message);
        } else {
            crate::checkpoint::clear_checkpoint(&self.config.logs_root).await?;
            self.events.pipeline_completed(&graph.name, &completed_nodes, duration_ms);
        }

        Ok(PipelineResult {
            completed_nodes,
            node_outcomes,
            final_context: context.snapshot().await,
            status: final_status,
            failure_reason,
        })
    }

    async fn save_checkpoint(
        &self,
        current_node: &str,
        completed_nodes: &[String],
        node_outcomes: &HashMap<String, StageStatus>,
        context: &Context,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            timestamp: chrono::Utc::now(),
            current_node: current_node.to_string(),
            completed_nodes: completed_nodes.to_vec(),
            node_retries: HashMap::new(),
            node_outcomes: node_outcomes.clone(),
            context_values: context.snapshot().await,
            logs: context.logs().await,
        };
        crate::checkpoint::save_checkpoint(&checkpoint, &self.config.logs_root).await?;
        Ok(())
    }

    /// Dispatch every outgoing-edge target of a `parallel` node concurrently
    /// over isolated context snapshots, aggregate their outcomes into
    /// `parallel.results`, and route toward the first child's first outgoing
    /// edge so traversal reaches the fan-in node.
    ///
    /// Children are awaited in declaration order rather than true completion
    /// order — a hand-rolled `Vec<JoinHandle>` join doesn't give first-done
    /// ordering without an extra dependency, so "applied in the order
    /// children finish" is approximated by "applied in spawn order".
    async fn run_parallel_region(&self, node: &PipelineNode, context: &Context, graph: &PipelineGraph) -> Result<Outcome> {
        let targets: Vec<String> = graph.outgoing_edges(&node.id).iter().map(|e| e.to.clone()).collect();
        if targets.is_empty() {
            return Ok(Outcome::success("no parallel branches"));
        }

        let registry = Arc::clone(&self.registry);
        let logs_root = self.config.logs_root.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        let mut handles = Vec::with_capacity(targets.len());
        for target in &targets {
            let node = graph.node(target).cloned().ok_or_else(|| {
                PipeweaveError::ValidationError(format!("parallel branch target '{target}' not found"))
            })?;
            let child_context = context.clone_isolated().await;
            let registry = Arc::clone(&registry);
            let graph_owned = graph.clone();
            let logs_root = logs_root.clone();
            let events = events.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let handler_type = registry.resolve_type(&node);
                events.stage_started(&node.id, &handler_type);
                let started = Instant::now();
                let result = dispatch_node(&registry, &node, &child_context, &graph_owned, &logs_root, &events, &cancel).await;
                let status = match &result {
                    Ok(o) => o.status,
                    Err(_) => StageStatus::Fail,
                };
                events.stage_completed(&node.id, status.as_str(), started.elapsed().as_millis() as u64);
                (node.id, result)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let (node_id, outcome) = handle.await.map_err(|e| PipeweaveError::Other(e.to_string()))?;
            let outcome = outcome.unwrap_or_else(|e| Outcome::fail(e.to_string()));
            results.push(ParallelResult {
                node_id,
                status: outcome.status,
                notes: outcome.notes,
                context_updates: outcome.context_updates,
                score: None,
            });
        }

        let first_child = &results[0].node_id;
        let fan_in_target = graph.outgoing_edges(first_child).first().map(|e| e.to.clone());

        let mut outcome = Outcome::success(format!("parallel region joined {} branches", results.len()));
        outcome.context_updates.insert(
            "parallel.results".to_string(),
            serde_json::to_value(&results).unwrap_or(serde_json::Value::Null),
        );
        if let Some(next) = fan_in_target {
            outcome.suggested_next_ids = vec![next];
        }
        Ok(outcome)
    }
}

/// Resolve `node`'s handler and run it under retry and a node-level timeout
/// race, tracking the in-flight attempt count in `internal.retry_count.<id>`.
async fn dispatch_node(
    registry: &HandlerRegistry,
    node: &PipelineNode,
    context: &Context,
    graph: &PipelineGraph,
    logs_root: &std::path::Path,
    events: &EventEmitter,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    if cancel.is_cancelled() {
        let mut outcome = Outcome::fail("cancelled");
        outcome.notes = "cancellation observed before dispatch".to_string();
        return Ok(outcome);
    }

    let handler = registry.resolve(node).ok_or_else(|| {
        PipeweaveError::ValidationError(format!("no handler registered for node '{}'", node.id))
    })?;

    let retry_key = format!("{RETRY_COUNT_PREFIX}{}", node.id);
    let retry_config = RetryConfig {
        max_retries: node.max_retries,
        policy: RetryPolicy::by_name(&node.retry_policy),
        allow_partial: node.allow_partial,
    };

    let attempt_counter = std::sync::atomic::AtomicUsize::new(0);
    let observer = |node_id: &str, attempt: usize, max_attempts: usize, reason: &str| {
        events.stage_retry(node_id, attempt, max_attempts, reason);
    };

    let run_attempt = || async {
        let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst) + 1;
        context.set(retry_key.clone(), serde_json::json!(attempt)).await;

        if let Some(timeout_secs) = node.timeout_seconds {
            let duration = std::time::Duration::from_secs(timeout_secs);
            tokio::select! {
                result = handler.execute(node, context, graph, logs_root) => result,
                _ = tokio::time::sleep(duration) => {
                    let mut outcome = Outcome::fail("timeout");
                    outcome.notes = format!("node exceeded timeout_seconds={timeout_secs}");
                    Ok(outcome)
                }
                _ = cancel.cancelled() => {
                    let mut outcome = Outcome::fail("cancelled");
                    outcome.notes = "cancellation observed during dispatch".to_string();
                    Ok(outcome)
                }
            }
        } else {
            tokio::select! {
                result = handler.execute(node, context, graph, logs_root) => result,
                _ = cancel.cancelled() => {
                    let mut outcome = Outcome::fail("cancelled");
                    outcome.notes = "cancellation observed during dispatch".to_string();
                    Ok(outcome)
                }
            }
        }
    };

    let outcome = execute_with_retry(run_attempt, &retry_config, &node.id, Some(&observer)).await?;

    if matches!(outcome.status, StageStatus::Success | StageStatus::PartialSuccess | StageStatus::Skipped) {
        context.delete(&retry_key).await;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(dot: &str) -> PipelineGraph {
        let parsed = pipeweave_dot::parse(dot).unwrap();
        PipelineGraph::from_dot(parsed).unwrap()
    }

    #[tokio::test]
    async fn linear_pipeline_completes() {
        let graph = parse(r#"digraph G {
            start [shape="Mdiamond"]
            work [label="Do work"]
            done [shape="Msquare"]
            start -> work -> done
        }"#);
        let tmp = tempfile::tempdir().unwrap();
        let executor = PipelineExecutor::with_default_registry(PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() });

        let result = executor.run(&graph).await.unwrap();
        assert_eq!(result.status, StageStatus::Success);
        assert_eq!(result.completed_nodes, vec!["start", "work", "done"]);
    }

    #[tokio::test]
    async fn missing_start_node_errors() {
        let graph = parse(r#"digraph G { A -> B }"#);
        let tmp = tempfile::tempdir().unwrap();
        let executor = PipelineExecutor::with_default_registry(PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() });

        let result = executor.run(&graph).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failing_node_terminates_run_as_failed() {
        let graph = parse(r#"digraph G {
            start [shape="Mdiamond"]
            gate [shape="tripleoctagon"]
            done [shape="Msquare"]
            start -> gate -> done
        }"#);
        let tmp = tempfile::tempdir().unwrap();
        let executor = PipelineExecutor::with_default_registry(PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() });

        let result = executor.run(&graph).await.unwrap();
        assert_eq!(result.status, StageStatus::Fail);
        assert_eq!(result.failure_reason.as_deref(), Some("No parallel results"));
    }

    #[tokio::test]
    async fn context_updates_propagate_between_nodes() {
        let graph = parse(r#"digraph G {
            start [shape="Mdiamond"]
            work [label="Do work"]
            done [shape="Msquare"]
            start -> work -> done
        }"#);
        let tmp = tempfile::tempdir().unwrap();
        let executor = PipelineExecutor::with_default_registry(PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() });

        let result = executor.run(&graph).await.unwrap();
        assert!(result.final_context.contains_key("last_stage"));
    }

    #[tokio::test]
    async fn node_timeout_produces_timeout_failure_reason() {
        let mut graph = parse(r#"digraph G {
            start [shape="Mdiamond"]
            slow [shape="parallelogram", tool_command="sleep 2"]
            done [shape="Msquare"]
            start -> slow -> done
        }"#);
        for node in graph.all_nodes_mut() {
            if node.id == "slow" {
                node.timeout_seconds = Some(1);
                node.max_retries = 0;
            }
        }
        let tmp = tempfile::tempdir().unwrap();
        let executor = PipelineExecutor::with_default_registry(PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() });

        let result = executor.run(&graph).await.unwrap();
        assert_eq!(result.status, StageStatus::Fail);
        assert_eq!(result.failure_reason.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn cancellation_before_run_fails_with_cancelled_reason() {
        let graph = parse(r#"digraph G {
            start [shape="Mdiamond"]
            work [label="Do work"]
            done [shape="Msquare"]
            start -> work -> done
        }"#);
        let tmp = tempfile::tempdir().unwrap();
        let executor = PipelineExecutor::with_default_registry(PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() });
        executor.cancellation_token().cancel();

        let result = executor.run(&graph).await.unwrap();
        assert_eq!(result.status, StageStatus::Fail);
        assert_eq!(result.failure_reason.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn checkpoint_written_after_each_node() {
        let graph = parse(r#"digraph G {
            start [shape="Mdiamond"]
            work [label="Do work"]
            done [shape="Msquare"]
            start -> work -> done
        }"#);
        let tmp = tempfile::tempdir().unwrap();
        let executor = PipelineExecutor::with_default_registry(PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() });

        executor.run(&graph).await.unwrap();
        // Successful runs clear the checkpoint on completion.
        assert!(crate::checkpoint::load_checkpoint(tmp.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn parallel_region_joins_and_routes_to_fan_in() {
        let graph = parse(r#"digraph G {
            start [shape="Mdiamond"]
            fork [shape="component"]
            branch_a [shape="box"]
            branch_b [shape="box"]
            merge [shape="tripleoctagon"]
            done [shape="Msquare"]
            start -> fork
            fork -> branch_a
            fork -> branch_b
            branch_a -> merge
            branch_b -> merge
            merge -> done
        }"#);
        let tmp = tempfile::tempdir().unwrap();
        let executor = PipelineExecutor::with_default_registry(PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() });

        let result = executor.run(&graph).await.unwrap();
        assert_eq!(result.status, StageStatus::Success);
        assert!(result.completed_nodes.contains(&"merge".to_string()));
        assert!(result.final_context.contains_key("parallel.fan_in.best_id"));
    }

    #[test]
    fn executor_constructors() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() };
        let _with_default = PipelineExecutor::with_default_registry(config.clone());
        let _with_custom = PipelineExecutor::new(default_registry(), config);
    }
}
