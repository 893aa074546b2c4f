//! Next-node selection after a handler completes.
//!
//! Two-step cascade: an outcome's `suggestedNextIds` (if any) overrides edge
//! traversal outright; otherwise the first outgoing edge whose `guard`
//! evaluates true wins, falling back to the first edge with no guard at all.

use crate::condition::{evaluate_condition, parse_condition};
use crate::graph::PipelineGraph;
use pipeweave_types::Outcome;

/// Select the id of the next node to run after `node_id` completes with
/// `outcome`. Returns `None` when there is nothing left to run (terminal).
pub fn select_next(
    node_id: &str,
    outcome: &Outcome,
    resolve: &dyn Fn(&str) -> String,
    graph: &PipelineGraph,
) -> Option<String> {
    if let Some(first) = outcome.suggested_next_ids.first() {
        return Some(first.clone());
    }

    let edges = graph.outgoing_edges(node_id);

    for edge in edges {
        if let Some(guard) = &edge.guard {
            let matched = parse_condition(guard)
                .map(|expr| evaluate_condition(&expr, resolve))
                .unwrap_or(false);
            if matched {
                return Some(edge.to.clone());
            }
        }
    }

    edges.iter().find(|e| e.guard.is_none()).map(|e| e.to.clone())
}
