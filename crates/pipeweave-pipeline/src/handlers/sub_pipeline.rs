//! SubPipelineHandler — runs a referenced graph file as a nested pipeline.
//!
//! The nested run gets its own isolated [`Context`] (shallow-copied from the
//! parent), and on completion the keys named by the node's `export.keys`
//! attribute flow back into the parent's `contextUpdates`. Nested-pipeline
//! failure propagates as this node's own outcome.
//!
//! `sub_pipeline` nodes are special-cased by [`crate::engine::PipelineExecutor`]
//! the same way `parallel` nodes are: a normal run never calls
//! [`SubPipelineHandler::execute`] through the registry. Instead the engine
//! calls [`run_sub_pipeline`] directly, handing it the parent's own handler
//! registry, event emitter, and cancellation token, so nested codergen/fan-in
//! stages get real backend access and nested stage events land on the same
//! stream as the parent's, prefixed with this node's id. `execute` below is
//! a standalone fallback for callers that invoke the handler directly
//! (tests, or a hand-assembled registry) without going through the engine.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pipeweave_types::{Context, Outcome, PipeweaveError, Result, StageStatus};

use crate::engine::{CancellationToken, PipelineConfig, PipelineExecutor};
use crate::events::EventEmitter;
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::{HandlerRegistry, NodeHandler};
use crate::transforms::apply_transforms;

pub struct SubPipelineHandler;

#[async_trait]
impl NodeHandler for SubPipelineHandler {
    fn handler_type(&self) -> &str {
        "sub_pipeline"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        _graph: &PipelineGraph,
        logs_root: &Path,
    ) -> Result<Outcome> {
        run_sub_pipeline(
            node,
            context,
            Arc::new(crate::handler::default_registry()),
            EventEmitter::default(),
            CancellationToken::new(),
            &PipelineConfig { logs_root: logs_root.to_path_buf(), ..Default::default() },
        )
        .await
    }
}

/// Parse the graph named by `node`'s `graph` attribute and run it to
/// completion with a [`PipelineExecutor`] built from `registry`, `events`,
/// and `cancel` — the same three the caller's own run is using — under
/// `parent_config.logs_root.join(&node.id)`.
pub(crate) async fn run_sub_pipeline(
    node: &PipelineNode,
    context: &Context,
    registry: Arc<HandlerRegistry>,
    events: EventEmitter,
    cancel: CancellationToken,
    parent_config: &PipelineConfig,
) -> Result<Outcome> {
    let graph_path = node.attr_string("graph").ok_or_else(|| PipeweaveError::HandlerError {
        handler: "sub_pipeline".into(),
        node: node.id.clone(),
        message: "missing 'graph' attribute naming the referenced pipeline file".into(),
    })?;

    let dot_source = std::fs::read_to_string(&graph_path).map_err(|e| PipeweaveError::HandlerError {
        handler: "sub_pipeline".into(),
        node: node.id.clone(),
        message: format!("failed to read sub-pipeline graph '{}': {}", graph_path, e),
    })?;

    let parsed = pipeweave_dot::parse(&dot_source).map_err(|e| PipeweaveError::HandlerError {
        handler: "sub_pipeline".into(),
        node: node.id.clone(),
        message: format!("failed to parse sub-pipeline graph '{}': {}", graph_path, e),
    })?;

    let mut sub_graph = PipelineGraph::from_dot(parsed)?;
    apply_transforms(&mut sub_graph)?;

    let child_context = context.clone_isolated().await;
    let sub_logs_root = parent_config.logs_root.join(&node.id);

    let sub_executor = PipelineExecutor::with_shared(
        registry,
        events,
        PipelineConfig { logs_root: sub_logs_root, max_steps: parent_config.max_steps },
        cancel,
    );

    let result = sub_executor.run_with_context(&sub_graph, child_context).await?;

    let mut outcome = if result.status == StageStatus::Fail {
        let reason = result.failure_reason.clone().unwrap_or_else(|| format!("sub-pipeline '{}' failed", graph_path));
        let mut o = Outcome::fail(reason.clone());
        o.notes = reason;
        o
    } else {
        Outcome::success(format!("sub-pipeline '{}' completed", graph_path))
    };

    for key in &node.export_keys {
        if let Some(value) = result.final_context.get(key) {
            outcome.context_updates.insert(key.clone(), value.clone());
        }
    }

    Ok(outcome)
}
