//! CodergenHandler — the default handler for plain `box`-shaped stages.
//!
//! Builds a prompt from the node's declared prompt (falling back to label,
//! then id), expands `$goal`/`$context.<key>` tokens at run time, and hands
//! it to a [`Backend`]. Without a backend it synthesises a deterministic
//! `[Simulated] ...` response so graphs can be dry-run end to end.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pipeweave_types::{Context, Outcome, Result, StageStatus};

use crate::backend::{expand_runtime_tokens, Backend, BackendOptions, BackendResponse};
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;

pub struct CodergenHandler {
    backend: Option<Arc<dyn Backend>>,
}

impl CodergenHandler {
    pub fn new(backend: Option<Arc<dyn Backend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        logs_root: &Path,
    ) -> Result<Outcome> {
        let template = node
            .prompt
            .clone()
            .unwrap_or_else(|| if node.label.is_empty() { node.id.clone() } else { node.label.clone() });
        let prompt = expand_runtime_tokens(&template, &graph.goal, context).await;

        let node_dir = logs_root.join(&node.id);
        let _ = std::fs::create_dir_all(&node_dir);
        let _ = std::fs::write(node_dir.join("prompt.md"), &prompt);

        let mut outcome = match &self.backend {
            None => {
                let response = format!("[Simulated] {}", prompt);
                let _ = std::fs::write(node_dir.join("response.md"), &response);
                let mut outcome = Outcome::success(response.clone());
                outcome
                    .context_updates
                    .insert("last_response".to_string(), serde_json::Value::String(truncate(&response, 200)));
                outcome
            }
            Some(backend) => {
                let options = BackendOptions { logs_root: Some(logs_root.to_path_buf()), timeout_ms: None };
                match backend.run(node, &prompt, context, &options).await {
                    Ok(BackendResponse::Outcome(outcome)) => outcome,
                    Ok(BackendResponse::Text(text)) => {
                        let _ = std::fs::write(node_dir.join("response.md"), &text);
                        let mut outcome = Outcome::success(text.clone());
                        outcome
                            .context_updates
                            .insert("last_response".to_string(), serde_json::Value::String(truncate(&text, 200)));
                        outcome
                    }
                    Err(e) => Outcome::fail(e.to_string()),
                }
            }
        };

        outcome
            .context_updates
            .insert("last_stage".to_string(), serde_json::Value::String(node.id.clone()));

        if let Ok(json) = serde_json::to_string_pretty(&outcome) {
            let _ = std::fs::write(node_dir.join("status.json"), json);
        }

        Ok(outcome)
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
