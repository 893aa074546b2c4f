use std::collections::HashMap;

use pipeweave_dot::{AttributeValue, DotGraph, EdgeDef, NodeDef};

/// Fixed shape-to-type fallback table consulted by the handler registry
/// (kept here since [`PipelineGraph::start_node`]/[`PipelineGraph::exit_node`]
/// need the same `Mdiamond`/`Msquare` literals).
pub const SHAPE_START: &str = "Mdiamond";
pub const SHAPE_EXIT: &str = "Msquare";

#[derive(Debug, Clone)]
pub struct PipelineGraph {
    pub name: String,
    pub goal: String,
    pub prompt_base: Option<String>,
    pub stylesheet: Option<String>,
    pub default_max_retry: usize,
    pub attrs: HashMap<String, AttributeValue>,
    nodes: HashMap<String, PipelineNode>,
    /// Node ids in the order they were first declared. The DOT parser (an
    /// external collaborator) does not preserve declaration order itself, so
    /// this falls back to ascending id for deterministic tie-breaks.
    node_order: Vec<String>,
    edges: Vec<PipelineEdge>,
    /// Maps node_id to a range (start, count) into the sorted `edges` vec.
    /// Edges are sorted by `from` so each node's outgoing edges are contiguous;
    /// the sort is stable so edges sharing a `from` keep declaration order.
    adjacency: HashMap<String, (usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct PipelineNode {
    pub id: String,
    pub label: String,
    pub shape: String,
    pub node_type: Option<String>,
    pub prompt: Option<String>,
    pub classes: Vec<String>,
    pub llm_model: Option<String>,
    pub max_retries: usize,
    pub retry_policy: String,
    pub allow_partial: bool,
    pub timeout_seconds: Option<u64>,
    pub human_default_choice: Option<String>,
    pub export_keys: Vec<String>,
    /// Attributes the node declared directly, before default-layering.
    /// The stylesheet engine consults this so explicit node attributes
    /// always win over stylesheet-injected ones.
    pub explicit_attrs: HashMap<String, AttributeValue>,
    /// Attributes after graph/subgraph default layering (but before
    /// stylesheet application).
    pub raw_attrs: HashMap<String, AttributeValue>,
}

impl PipelineNode {
    /// Look up an arbitrary attribute on the node's post-layering map.
    pub fn attr(&self, key: &str) -> Option<&AttributeValue> {
        self.raw_attrs.get(key)
    }

    pub fn attr_string(&self, key: &str) -> Option<String> {
        get_string_attr(&self.raw_attrs, key)
    }

    /// `true` if the node declared `key` itself, before any default layering
    /// or stylesheet injection.
    pub fn has_explicit(&self, key: &str) -> bool {
        self.explicit_attrs.contains_key(key)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub guard: Option<String>,
    pub when: Option<String>,
    pub raw_attrs: HashMap<String, AttributeValue>,
}

// --- Attribute extraction helpers ---

fn get_string_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<String> {
    attrs.get(key).map(|v| match v {
        AttributeValue::String(s) => s.clone(),
        AttributeValue::Integer(i) => i.to_string(),
        AttributeValue::Float(f) => f.to_string(),
        AttributeValue::Boolean(b) => b.to_string(),
        AttributeValue::Duration(d) => format!("{}s", d.as_secs()),
    })
}

fn get_bool_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<bool> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::Boolean(b) => Some(*b),
        AttributeValue::String(s) => Some(s == "true"),
        _ => None,
    })
}

fn get_int_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::Integer(i) => Some(*i),
        AttributeValue::String(s) => s.parse().ok(),
        _ => None,
    })
}

// --- Conversions ---

/// Re-derive a node's typed convenience fields purely from `raw_attrs`.
/// Called at construction and again after the stylesheet engine mutates
/// `raw_attrs`, so the two stay in sync without duplicating lookup logic.
pub(crate) fn derive_fields(id: &str, attrs: &HashMap<String, AttributeValue>) -> DerivedFields {
    DerivedFields {
        shape: get_string_attr(attrs, "shape").unwrap_or_else(|| "box".to_string()),
        label: get_string_attr(attrs, "label").unwrap_or_else(|| id.to_string()),
        node_type: get_string_attr(attrs, "type"),
        prompt: get_string_attr(attrs, "prompt"),
        classes: get_string_attr(attrs, "class")
            .map(|s| {
                s.split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        llm_model: get_string_attr(attrs, "llm_model"),
        max_retries: get_int_attr(attrs, "max_retries").map(|v| v as usize).unwrap_or(0),
        retry_policy: get_string_attr(attrs, "retry_policy").unwrap_or_else(|| "standard".to_string()),
        allow_partial: get_bool_attr(attrs, "allow_partial").unwrap_or(false),
        timeout_seconds: get_int_attr(attrs, "timeout_seconds").map(|v| v as u64),
        human_default_choice: get_string_attr(attrs, "human.default_choice"),
        export_keys: get_string_attr(attrs, "export.keys")
            .map(|s| {
                s.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
    }
}

pub(crate) struct DerivedFields {
    pub shape: String,
    pub label: String,
    pub node_type: Option<String>,
    pub prompt: Option<String>,
    pub classes: Vec<String>,
    pub llm_model: Option<String>,
    pub max_retries: usize,
    pub retry_policy: String,
    pub allow_partial: bool,
    pub timeout_seconds: Option<u64>,
    pub human_default_choice: Option<String>,
    pub export_keys: Vec<String>,
}

impl PipelineNode {
    /// Re-run attribute extraction against the current `raw_attrs`. Used
    /// after the stylesheet engine injects declarations so typed fields
    /// (`llm_model`, `max_retries`, ...) observe the change.
    pub(crate) fn refresh_derived(&mut self) {
        let d = derive_fields(&self.id, &self.raw_attrs);
        self.shape = d.shape;
        self.label = d.label;
        self.node_type = d.node_type;
        self.prompt = d.prompt;
        self.classes = d.classes;
        self.llm_model = d.llm_model;
        self.max_retries = d.max_retries;
        self.retry_policy = d.retry_policy;
        self.allow_partial = d.allow_partial;
        self.timeout_seconds = d.timeout_seconds;
        self.human_default_choice = d.human_default_choice;
        self.export_keys = d.export_keys;
    }
}

fn node_def_to_pipeline_node(
    id: &str,
    node_def: &NodeDef,
    graph_defaults: &HashMap<String, AttributeValue>,
    subgraph_defaults: Option<&HashMap<String, AttributeValue>>,
    graph_default_max_retry: usize,
) -> PipelineNode {
    // Layer defaults: graph-level, then subgraph-level, then explicit node attrs.
    let mut attrs = graph_defaults.clone();
    if let Some(sg_defaults) = subgraph_defaults {
        attrs.extend(sg_defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    attrs.extend(node_def.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    // Bake the graph-level max_retries fallback into the attribute map itself
    // so later re-derivation (e.g. after stylesheet application) doesn't need
    // to remember it separately.
    if !attrs.contains_key("max_retries") {
        attrs.insert(
            "max_retries".to_string(),
            AttributeValue::Integer(graph_default_max_retry as i64),
        );
    }

    let d = derive_fields(id, &attrs);

    PipelineNode {
        id: id.to_string(),
        label: d.label,
        shape: d.shape,
        node_type: d.node_type,
        prompt: d.prompt,
        classes: d.classes,
        llm_model: d.llm_model,
        max_retries: d.max_retries,
        retry_policy: d.retry_policy,
        allow_partial: d.allow_partial,
        timeout_seconds: d.timeout_seconds,
        human_default_choice: d.human_default_choice,
        export_keys: d.export_keys,
        explicit_attrs: node_def.attrs.clone(),
        raw_attrs: attrs,
    }
}

fn edge_def_to_pipeline_edge(
    edge_def: &EdgeDef,
    edge_defaults: &HashMap<String, AttributeValue>,
) -> PipelineEdge {
    let mut attrs = edge_defaults.clone();
    attrs.extend(edge_def.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    PipelineEdge {
        from: edge_def.from.clone(),
        to: edge_def.to.clone(),
        label: get_string_attr(&attrs, "label"),
        guard: get_string_attr(&attrs, "guard"),
        when: get_string_attr(&attrs, "when"),
        raw_attrs: attrs,
    }
}

impl PipelineGraph {
    pub fn from_dot(graph: DotGraph) -> pipeweave_types::Result<Self> {
        let default_max_retry = get_int_attr(&graph.attrs, "default_max_retry")
            .map(|v| v as usize)
            .unwrap_or(0);

        let mut nodes = HashMap::new();
        let mut all_edges = Vec::new();

        // Collect top-level nodes with graph-level defaults.
        for (id, node_def) in &graph.nodes {
            let pn = node_def_to_pipeline_node(id, node_def, &graph.node_defaults, None, default_max_retry);
            nodes.insert(id.clone(), pn);
        }

        // Collect subgraph nodes (with subgraph-level defaults layered on top).
        for sg in &graph.subgraphs {
            for (id, node_def) in &sg.nodes {
                let pn = node_def_to_pipeline_node(
                    id,
                    node_def,
                    &graph.node_defaults,
                    Some(&sg.node_defaults),
                    default_max_retry,
                );
                nodes.insert(id.clone(), pn);
            }
        }

        let mut node_order: Vec<String> = nodes.keys().cloned().collect();
        node_order.sort();

        // Collect top-level edges.
        for edge_def in &graph.edges {
            all_edges.push(edge_def_to_pipeline_edge(edge_def, &graph.edge_defaults));
        }

        // Collect subgraph edges.
        for sg in &graph.subgraphs {
            let mut sg_edge_defaults = graph.edge_defaults.clone();
            sg_edge_defaults.extend(sg.edge_defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
            for edge_def in &sg.edges {
                all_edges.push(edge_def_to_pipeline_edge(edge_def, &sg_edge_defaults));
            }
        }

        // Sort edges by `from` so each node's outgoing edges form a contiguous
        // slice; the sort is stable so declaration order is preserved among
        // edges sharing a `from`.
        all_edges.sort_by(|a, b| a.from.cmp(&b.from));

        let mut adjacency: HashMap<String, (usize, usize)> = HashMap::new();
        let mut i = 0;
        while i < all_edges.len() {
            let start = i;
            let from = &all_edges[i].from;
            while i < all_edges.len() && all_edges[i].from == *from {
                i += 1;
            }
            adjacency.insert(from.clone(), (start, i - start));
        }

        let goal = get_string_attr(&graph.attrs, "goal").unwrap_or_default();
        let prompt_base = get_string_attr(&graph.attrs, "_prompt_base");
        let stylesheet = get_string_attr(&graph.attrs, "_stylesheet");

        Ok(PipelineGraph {
            name: graph.name,
            goal,
            prompt_base,
            stylesheet,
            default_max_retry,
            attrs: graph.attrs,
            nodes,
            node_order,
            edges: all_edges,
            adjacency,
        })
    }

    /// The node the runner dispatches first: `shape=Mdiamond` or `type=start`.
    /// If several qualify, the first by declaration order wins.
    pub fn start_node(&self) -> Option<&PipelineNode> {
        self.node_order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .find(|n| n.shape == SHAPE_START || n.node_type.as_deref() == Some("start"))
    }

    /// `true` if `node` is a designated terminal node (`shape=Msquare` or
    /// `type=exit`).
    pub fn is_exit_node(&self, node: &PipelineNode) -> bool {
        node.shape == SHAPE_EXIT || node.node_type.as_deref() == Some("exit")
    }

    /// Find the first node satisfying [`is_exit_node`](Self::is_exit_node).
    pub fn exit_node(&self) -> Option<&PipelineNode> {
        self.node_order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .find(|n| self.is_exit_node(n))
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    pub fn outgoing_edges(&self, node_id: &str) -> &[PipelineEdge] {
        match self.adjacency.get(node_id) {
            Some(&(start, count)) => &self.edges[start..start + count],
            None => &[],
        }
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn all_nodes_mut(&mut self) -> impl Iterator<Item = &mut PipelineNode> {
        self.nodes.values_mut()
    }

    pub fn all_edges(&self) -> &[PipelineEdge] {
        &self.edges
    }
}
