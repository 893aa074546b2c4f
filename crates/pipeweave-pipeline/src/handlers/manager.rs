//! Manager loop handler for "house" shaped nodes.
//!
//! Supervises a sub-section of the graph. Kept as a supplemental handler:
//! there is no dedicated manager-loop concept in the core model, but the
//! shape-mapping table still routes `house` nodes here.

use std::path::Path;

use async_trait::async_trait;
use pipeweave_types::{Context, Outcome, Result, StageStatus};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;

pub struct ManagerLoopHandler;

#[async_trait]
impl NodeHandler for ManagerLoopHandler {
    fn handler_type(&self) -> &str {
        "stack.manager_loop"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        _context: &Context,
        _graph: &PipelineGraph,
        _logs_root: &Path,
    ) -> Result<Outcome> {
        let prompt = node.prompt.as_deref().unwrap_or("Supervise sub-tasks");
        tracing::info!(node = %node.id, "Manager loop executing: {}", prompt);

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: vec![],
            context_updates: {
                let mut updates = std::collections::HashMap::new();
                updates.insert(
                    format!("{}.managed", node.id),
                    serde_json::Value::Bool(true),
                );
                updates
            },
            notes: format!("Manager completed: {}", prompt),
            failure_reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::{make_minimal_graph, make_node};
    use std::collections::HashMap;

    #[tokio::test]
    async fn manager_handler_returns_success() {
        let handler = ManagerLoopHandler;
        let node = make_node("mgr", "house", Some("Coordinate workers"), HashMap::new());
        let ctx = Context::default();
        let graph = make_minimal_graph();
        let tmp = tempfile::tempdir().unwrap();

        let outcome = handler.execute(&node, &ctx, &graph, tmp.path()).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert!(outcome.notes.contains("Coordinate workers"));
        assert_eq!(
            outcome.context_updates.get("mgr.managed"),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn manager_handler_default_prompt() {
        let handler = ManagerLoopHandler;
        let node = make_node("mgr", "house", None, HashMap::new());
        let ctx = Context::default();
        let graph = make_minimal_graph();
        let tmp = tempfile::tempdir().unwrap();

        let outcome = handler.execute(&node, &ctx, &graph, tmp.path()).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert!(outcome.notes.contains("Supervise sub-tasks"));
    }

    #[test]
    fn manager_handler_type() {
        let handler = ManagerLoopHandler;
        assert_eq!(handler.handler_type(), "stack.manager_loop");
    }
}
