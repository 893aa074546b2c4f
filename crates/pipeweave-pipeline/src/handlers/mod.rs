//! Additional node handlers beyond the basic start/exit/conditional.

pub mod codergen_handler;
pub mod manager;
pub mod parallel;
pub mod sub_pipeline;
pub mod tool_handler;
pub mod wait_human;

pub use codergen_handler::CodergenHandler;
pub use manager::ManagerLoopHandler;
pub use parallel::{FanInHandler, ParallelHandler};
pub use sub_pipeline::SubPipelineHandler;
pub use tool_handler::ToolHandler;

// ---------------------------------------------------------------------------
// Shared test helpers used by child handler modules
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use pipeweave_dot::AttributeValue;

    use crate::graph::{derive_fields, PipelineGraph, PipelineNode};

    pub(crate) fn make_node(
        id: &str,
        shape: &str,
        prompt: Option<&str>,
        mut attrs: HashMap<String, AttributeValue>,
    ) -> PipelineNode {
        attrs.insert("shape".to_string(), AttributeValue::String(shape.to_string()));
        if let Some(p) = prompt {
            attrs.insert("prompt".to_string(), AttributeValue::String(p.to_string()));
        }
        let derived = derive_fields(id, &attrs);
        PipelineNode {
            id: id.to_string(),
            label: derived.label,
            shape: derived.shape,
            node_type: derived.node_type,
            prompt: derived.prompt,
            classes: derived.classes,
            llm_model: derived.llm_model,
            max_retries: derived.max_retries,
            retry_policy: derived.retry_policy,
            allow_partial: derived.allow_partial,
            timeout_seconds: derived.timeout_seconds,
            human_default_choice: derived.human_default_choice,
            export_keys: derived.export_keys,
            explicit_attrs: attrs.clone(),
            raw_attrs: attrs,
        }
    }

    pub(crate) fn make_minimal_graph() -> PipelineGraph {
        let dot = r#"digraph G { A -> B }"#;
        let parsed = pipeweave_dot::parse(dot).unwrap();
        PipelineGraph::from_dot(parsed).unwrap()
    }
}
