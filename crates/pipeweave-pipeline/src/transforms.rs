//! Built-in graph-to-graph transforms applied before a pipeline runs.
//!
//! Each transform is a pure `Graph -> Graph` rewrite. The built-ins run in a
//! fixed order: `$goal` substitution, stylesheet application, then
//! `@path` prompt-file inlining. User-registered transforms (none ship with
//! this core) would run after these, in registration order.

use crate::graph::PipelineGraph;
use crate::stylesheet::{apply_stylesheet, parse_stylesheet};
use pipeweave_types::{PipeweaveError, Result};

/// Apply all built-in transforms to a pipeline graph in the fixed order the
/// engine requires: variable expansion, stylesheet, then prompt-file inlining.
pub fn apply_transforms(graph: &mut PipelineGraph) -> Result<()> {
    expand_goal_token(graph);
    apply_stylesheet_attr(graph)?;
    inline_prompt_files(graph)?;
    Ok(())
}

/// Substitute the literal token `$goal` in every node's `prompt` with the
/// graph's `goal` attribute. A no-op if the goal is empty. Richer
/// `$context.*` expansion happens at execution time, not here.
fn expand_goal_token(graph: &mut PipelineGraph) {
    if graph.goal.is_empty() {
        return;
    }
    let goal = graph.goal.clone();
    for node in graph.all_nodes_mut() {
        if let Some(ref prompt) = node.prompt {
            if prompt.contains("$goal") {
                node.prompt = Some(prompt.replace("$goal", &goal));
            }
        }
    }
}

/// Parse and apply the `_stylesheet` graph attribute, if present.
fn apply_stylesheet_attr(graph: &mut PipelineGraph) -> Result<()> {
    if let Some(css) = graph.stylesheet.clone() {
        let stylesheet = parse_stylesheet(&css)?;
        apply_stylesheet(graph, &stylesheet);
    }
    Ok(())
}

/// Replace any node `prompt` beginning with `@` with the contents of the
/// file at the remainder of the string, resolved relative to the graph's
/// `_prompt_base` attribute (or the current working directory if unset).
/// An I/O error aborts the whole transform with the offending path and
/// node id in the message.
fn inline_prompt_files(graph: &mut PipelineGraph) -> Result<()> {
    let base = graph.prompt_base.clone();
    let mut updates = Vec::new();
    for node in graph.all_nodes() {
        if let Some(prompt) = &node.prompt {
            if let Some(rel_path) = prompt.strip_prefix('@') {
                let path = match &base {
                    Some(base) => std::path::Path::new(base).join(rel_path),
                    None => std::path::PathBuf::from(rel_path),
                };
                let contents = std::fs::read_to_string(&path).map_err(|e| {
                    PipeweaveError::TransformError {
                        transform: "prompt_file_inlining".to_string(),
                        message: format!(
                            "failed to read prompt file '{}' for node '{}': {}",
                            path.display(),
                            node.id,
                            e
                        ),
                    }
                })?;
                updates.push((node.id.clone(), contents));
            }
        }
    }
    for (id, contents) in updates {
        if let Some(node) = graph.all_nodes_mut().find(|n| n.id == id) {
            node.prompt = Some(contents);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PipelineGraph;

    fn parse_and_build(dot: &str) -> PipelineGraph {
        let graph = pipeweave_dot::parse(dot).unwrap();
        PipelineGraph::from_dot(graph).unwrap()
    }

    #[test]
    fn goal_token_substituted_in_prompt() {
        let dot = r#"digraph G {
            goal = "build a calculator"
            start [shape="Mdiamond"]
            work [prompt="Implement: $goal"]
            done [shape="Msquare"]
            start -> work -> done
        }"#;
        let mut graph = parse_and_build(dot);
        apply_transforms(&mut graph).unwrap();

        let work = graph.node("work").unwrap();
        assert_eq!(work.prompt.as_deref(), Some("Implement: build a calculator"));
    }

    #[test]
    fn no_goal_leaves_prompt_unchanged() {
        let dot = r#"digraph G {
            work [prompt="Implement: $goal"]
        }"#;
        let mut graph = parse_and_build(dot);
        apply_transforms(&mut graph).unwrap();

        let work = graph.node("work").unwrap();
        assert_eq!(work.prompt.as_deref(), Some("Implement: $goal"));
    }

    #[test]
    fn stylesheet_attr_applied() {
        let dot = r#"digraph G {
            _stylesheet = "* { llm_model: test-model; }"
            start [shape="Mdiamond"]
            work [label="Work"]
            done [shape="Msquare"]
            start -> work -> done
        }"#;
        let mut graph = parse_and_build(dot);
        apply_transforms(&mut graph).unwrap();

        for node in graph.all_nodes() {
            assert_eq!(node.llm_model.as_deref(), Some("test-model"));
        }
    }

    #[test]
    fn no_stylesheet_is_ok() {
        let dot = r#"digraph G {
            start [shape="Mdiamond"]
            done [shape="Msquare"]
            start -> done
        }"#;
        let mut graph = parse_and_build(dot);
        apply_transforms(&mut graph).unwrap();
    }

    #[test]
    fn prompt_file_inlined_relative_to_prompt_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("task.txt"), "Do the thing.").unwrap();

        let dot = format!(
            r#"digraph G {{
                _prompt_base = "{}"
                work [prompt="@task.txt"]
            }}"#,
            dir.path().display()
        );
        let mut graph = parse_and_build(&dot);
        apply_transforms(&mut graph).unwrap();

        assert_eq!(graph.node("work").unwrap().prompt.as_deref(), Some("Do the thing."));
    }

    #[test]
    fn prompt_file_missing_fails_whole_transform() {
        let dot = r#"digraph G {
            _prompt_base = "/nonexistent/base/dir"
            work [prompt="@missing.txt"]
        }"#;
        let mut graph = parse_and_build(dot);
        let err = apply_transforms(&mut graph).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing.txt"));
        assert!(msg.contains("work"));
    }

    #[test]
    fn prompt_without_at_prefix_untouched() {
        let dot = r#"digraph G {
            work [prompt="No file reference here"]
        }"#;
        let mut graph = parse_and_build(dot);
        apply_transforms(&mut graph).unwrap();
        assert_eq!(graph.node("work").unwrap().prompt.as_deref(), Some("No file reference here"));
    }
}
