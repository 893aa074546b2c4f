//! Fan-out (`parallel`) and fan-in (`parallel.fan_in`) handlers.
//!
//! Fan-out itself does no forking: it hands the engine its outgoing-edge
//! targets as `suggestedNextIds` and lets the engine's parallel dispatch
//! (spawn + join over isolated Context snapshots) do the concurrent work.
//! Fan-in reads back the aggregated `parallel.results` the engine wrote and
//! picks a winner.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pipeweave_types::{Context, Outcome, Result, StageStatus};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, BackendOptions, BackendResponse};
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;

pub struct ParallelHandler;

#[async_trait]
impl NodeHandler for ParallelHandler {
    fn handler_type(&self) -> &str {
        "parallel"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        _context: &Context,
        graph: &PipelineGraph,
        _logs_root: &Path,
    ) -> Result<Outcome> {
        let outgoing = graph.outgoing_edges(&node.id);
        let branch_count = outgoing.len();
        let branch_targets: Vec<String> = outgoing.iter().map(|e| e.to.clone()).collect();

        tracing::info!(
            node = %node.id,
            branches = branch_count,
            targets = ?branch_targets,
            "Parallel fan-out"
        );

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: branch_targets,
            context_updates: std::collections::HashMap::new(),
            notes: format!("Fan-out to {} branches", branch_count),
            failure_reason: None,
        })
    }
}

/// A single child's outcome, as aggregated by the engine into
/// `parallel.results` after a fan-out region completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelResult {
    pub node_id: String,
    pub status: StageStatus,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub context_updates: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub score: Option<f64>,
}

pub struct FanInHandler {
    backend: Option<Arc<dyn Backend>>,
}

impl FanInHandler {
    pub fn new(backend: Option<Arc<dyn Backend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for FanInHandler {
    fn handler_type(&self) -> &str {
        "parallel.fan_in"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        _graph: &PipelineGraph,
        logs_root: &Path,
    ) -> Result<Outcome> {
        let raw = context.get("parallel.results").await;
        let candidates: Vec<ParallelResult> = match raw {
            Some(value) => serde_json::from_value(value).unwrap_or_default(),
            None => Vec::new(),
        };

        if candidates.is_empty() {
            return Ok(Outcome::fail("No parallel results"));
        }
        if candidates.iter().all(|c| c.status == StageStatus::Fail) {
            return Ok(Outcome::fail("All parallel candidates failed"));
        }

        let mut winner = None;

        if let (Some(prompt), Some(backend)) = (node.prompt.as_deref(), &self.backend) {
            if let Some(id) = self
                .ask_backend_for_winner(backend.as_ref(), node, prompt, &candidates, context, logs_root)
                .await
            {
                winner = candidates.iter().find(|c| c.node_id == id).cloned();
            }
        }

        let winner = winner.unwrap_or_else(|| heuristic_winner(&candidates));

        let mut outcome = Outcome::success(format!("fan-in selected {}", winner.node_id));
        outcome
            .context_updates
            .insert("parallel.fan_in.best_id".to_string(), serde_json::Value::String(winner.node_id.clone()));
        outcome.context_updates.insert(
            "parallel.fan_in.best_outcome".to_string(),
            serde_json::to_value(&winner).unwrap_or(serde_json::Value::Null),
        );
        Ok(outcome)
    }
}

impl FanInHandler {
    async fn ask_backend_for_winner(
        &self,
        backend: &dyn Backend,
        node: &PipelineNode,
        prompt: &str,
        candidates: &[ParallelResult],
        context: &Context,
        logs_root: &Path,
    ) -> Option<String> {
        let listing: String = candidates
            .iter()
            .map(|c| format!("- {} ({}): {}", c.node_id, c.status.as_str(), c.notes))
            .collect::<Vec<_>>()
            .join("\n");
        let full_prompt = format!("{}\n\nCandidates:\n{}", prompt, listing);

        let options = BackendOptions {
            logs_root: Some(logs_root.to_path_buf()),
            timeout_ms: None,
        };
        let response = backend.run(node, &full_prompt, context, &options).await.ok()?;
        let text = match response {
            BackendResponse::Text(t) => t,
            BackendResponse::Outcome(_) => return None,
        };

        let first_line = text.lines().next().unwrap_or("").trim();
        if candidates.iter().any(|c| c.node_id == first_line) {
            return Some(first_line.to_string());
        }

        candidates
            .iter()
            .find(|c| text.contains(&c.node_id))
            .map(|c| c.node_id.clone())
    }
}

fn heuristic_winner(candidates: &[ParallelResult]) -> ParallelResult {
    let mut sorted: Vec<&ParallelResult> = candidates.iter().collect();
    sorted.sort_by(|a, b| {
        a.status
            .rank()
            .cmp(&b.status.rank())
            .then_with(|| {
                let sa = a.score.unwrap_or(f64::MIN);
                let sb = b.score.unwrap_or(f64::MIN);
                sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    sorted[0].clone()
}
