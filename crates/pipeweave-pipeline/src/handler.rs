//! Node handler trait, dynamic dispatch wrapper, and handler registry.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use pipeweave_types::{Context, Outcome, Result};

use crate::graph::{PipelineGraph, PipelineNode};

// ---------------------------------------------------------------------------
// NodeHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The handler type identifier (e.g. "start", "exit", "codergen").
    fn handler_type(&self) -> &str;

    /// Execute this handler for a given node. `logs_root` is the directory
    /// under which the handler may write `<nodeId>/...` artifacts.
    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        logs_root: &Path,
    ) -> Result<Outcome>;
}

// ---------------------------------------------------------------------------
// DynHandler — object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynHandler(Box<dyn NodeHandler>);

impl DynHandler {
    pub fn new(handler: impl NodeHandler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn handler_type(&self) -> &str {
        self.0.handler_type()
    }

    pub async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        logs_root: &Path,
    ) -> Result<Outcome> {
        self.0.execute(node, context, graph, logs_root).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

pub struct HandlerRegistry {
    handlers: HashMap<String, DynHandler>,
    shape_to_type: HashMap<String, String>,
    default_type: String,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut shape_to_type = HashMap::new();
        shape_to_type.insert("Mdiamond".into(), "start".into());
        shape_to_type.insert("Msquare".into(), "exit".into());
        shape_to_type.insert("box".into(), "codergen".into());
        shape_to_type.insert("hexagon".into(), "wait.human".into());
        shape_to_type.insert("diamond".into(), "conditional".into());
        shape_to_type.insert("component".into(), "parallel".into());
        shape_to_type.insert("tripleoctagon".into(), "parallel.fan_in".into());
        shape_to_type.insert("parallelogram".into(), "tool".into());
        shape_to_type.insert("house".into(), "stack.manager_loop".into());

        Self {
            handlers: HashMap::new(),
            shape_to_type,
            default_type: "codergen".to_string(),
        }
    }

    /// `register(name, handler)` replaces any prior handler under that name.
    pub fn register(&mut self, handler: impl NodeHandler + 'static) {
        let t = handler.handler_type().to_string();
        self.handlers.insert(t, DynHandler::new(handler));
    }

    /// Resolve a node to its handler type using the registry's 3-step cascade:
    /// 1. Explicit `type` attribute, if a handler is registered under that name.
    /// 2. Shape-based mapping, if the mapped type has a registered handler.
    /// 3. The registry's default handler type.
    pub fn resolve_type(&self, node: &PipelineNode) -> String {
        if let Some(ref t) = node.node_type {
            if self.handlers.contains_key(t) {
                return t.clone();
            }
        }
        if let Some(t) = self.shape_to_type.get(&node.shape) {
            if self.handlers.contains_key(t) {
                return t.clone();
            }
        }
        self.default_type.clone()
    }

    /// Resolve and fetch the handler for `node` per [`resolve_type`](Self::resolve_type).
    pub fn resolve(&self, node: &PipelineNode) -> Option<&DynHandler> {
        self.get(&self.resolve_type(node))
    }

    pub fn get(&self, handler_type: &str) -> Option<&DynHandler> {
        self.handlers.get(handler_type)
    }

    pub fn has(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers: start, exit, conditional
// ---------------------------------------------------------------------------

pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn handler_type(&self) -> &str {
        "start"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _ctx: &Context,
        _graph: &PipelineGraph,
        _logs_root: &Path,
    ) -> Result<Outcome> {
        Ok(Outcome::success("pipeline started"))
    }
}

pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    fn handler_type(&self) -> &str {
        "exit"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _ctx: &Context,
        _graph: &PipelineGraph,
        _logs_root: &Path,
    ) -> Result<Outcome> {
        let mut outcome = Outcome::success("pipeline completed");
        outcome.suggested_next_ids = Vec::new();
        Ok(outcome)
    }
}

/// Selects an outgoing edge whose `label` or `when` attribute matches a
/// predicate over Context, falling back to the edge labelled `default`.
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    fn handler_type(&self) -> &str {
        "conditional"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        ctx: &Context,
        graph: &PipelineGraph,
        _logs_root: &Path,
    ) -> Result<Outcome> {
        let snapshot = ctx.snapshot().await;
        let resolve = |key: &str| -> String {
            snapshot
                .get(key)
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };

        let edges = graph.outgoing_edges(&node.id);
        let mut fallback = None;
        for edge in edges {
            let predicate = edge.when.as_deref().or(edge.label.as_deref());
            match predicate {
                Some("default") => fallback = fallback.or(Some(edge)),
                Some(expr) => {
                    if let Ok(parsed) = crate::condition::parse_condition(expr) {
                        if crate::condition::evaluate_condition(&parsed, &resolve) {
                            let mut outcome = Outcome::success("conditional branch selected");
                            outcome.suggested_next_ids = vec![edge.to.clone()];
                            return Ok(outcome);
                        }
                    }
                }
                None => {}
            }
        }

        if let Some(edge) = fallback {
            let mut outcome = Outcome::success("conditional default branch");
            outcome.suggested_next_ids = vec![edge.to.clone()];
            return Ok(outcome);
        }

        Ok(Outcome::success("conditional pass-through"))
    }
}

// ---------------------------------------------------------------------------
// Default registry factory
// ---------------------------------------------------------------------------

pub fn default_registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(ConditionalHandler);
    reg.register(crate::handlers::ToolHandler);
    reg.register(crate::handlers::CodergenHandler::new(None));
    reg.register(crate::handlers::ParallelHandler);
    reg.register(crate::handlers::FanInHandler::new(None));
    reg.register(crate::handlers::ManagerLoopHandler);
    reg.register(crate::handlers::SubPipelineHandler);
    reg
}

/// Create the default handler registry with `WaitHumanHandler` registered
/// against the given interviewer, so graphs with `hexagon` (human review)
/// nodes can run.
pub fn default_registry_with_interviewer(
    interviewer: std::sync::Arc<dyn crate::interviewer::Interviewer>,
) -> HandlerRegistry {
    let mut reg = default_registry();
    reg.register(crate::handlers::wait_human::WaitHumanHandler::new(interviewer));
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) fn make_node(id: &str, shape: &str, node_type: Option<&str>) -> PipelineNode {
    PipelineNode {
        id: id.to_string(),
        label: id.to_string(),
        shape: shape.to_string(),
        node_type: node_type.map(String::from),
        prompt: None,
        classes: Vec::new(),
        llm_model: None,
        max_retries: 0,
        retry_policy: "standard".to_string(),
        allow_partial: false,
        timeout_seconds: None,
        human_default_choice: None,
        export_keys: Vec::new(),
        explicit_attrs: HashMap::new(),
        raw_attrs: HashMap::new(),
    }
}

#[cfg(test)]
pub(crate) fn make_minimal_graph() -> PipelineGraph {
    let dot = r#"digraph G { A -> B }"#;
    let parsed = pipeweave_dot::parse(dot).unwrap();
    PipelineGraph::from_dot(parsed).unwrap()
}
