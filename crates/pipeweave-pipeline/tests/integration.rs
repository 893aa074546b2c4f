//! End-to-end integration tests for the pipeline runner.
//!
//! Each test exercises the full path: parse DOT -> build graph -> validate ->
//! execute -> verify outcome, context, and checkpoint state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use pipeweave_dot::parse;
use pipeweave_pipeline::{
    apply_stylesheet, default_registry_with_interviewer, parse_stylesheet, validate,
    validate_or_raise, Answer, AutoApproveInterviewer, HandlerRegistry, NodeHandler,
    PipelineConfig, PipelineExecutor, PipelineGraph, PipelineNode, QueueInterviewer, Severity,
};
use pipeweave_types::{Context, Outcome, Result as PResult, StageStatus};

fn build_graph(dot: &str) -> PipelineGraph {
    let parsed = parse(dot).expect("DOT parse failed");
    PipelineGraph::from_dot(parsed).expect("PipelineGraph::from_dot failed")
}

fn executor_in(dir: &std::path::Path) -> PipelineExecutor {
    PipelineExecutor::with_default_registry(PipelineConfig {
        logs_root: dir.to_path_buf(),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Linear pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn simple_linear_pipeline_completes_in_order() {
    let graph = build_graph(
        r#"digraph Simple {
            start [shape="Mdiamond"]
            process [shape="box", prompt="Process data"]
            done [shape="Msquare"]
            start -> process -> done
        }"#,
    );

    let diags = validate_or_raise(&graph).expect("validation should pass");
    assert!(diags.iter().all(|d| d.severity != Severity::Error));

    let tmp = tempfile::tempdir().unwrap();
    let result = executor_in(tmp.path()).run(&graph).await.expect("pipeline should succeed");

    assert_eq!(result.status, StageStatus::Success);
    assert_eq!(result.completed_nodes, vec!["start", "process", "done"]);
    for node_id in &["start", "process", "done"] {
        assert_eq!(result.node_outcomes.get(*node_id), Some(&StageStatus::Success));
    }
}

// ---------------------------------------------------------------------------
// Branching via conditional handler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn branching_pipeline_routes_via_when_expression() {
    let graph = build_graph(
        r#"digraph Branch {
            start [shape="Mdiamond"]
            check [shape="diamond"]
            path_a [shape="box", prompt="Path A"]
            path_b [shape="box", prompt="Path B"]
            done [shape="Msquare"]
            start -> check
            check -> path_a [when="outcome=success"]
            check -> path_b [label="default"]
            path_a -> done
            path_b -> done
        }"#,
    );

    let tmp = tempfile::tempdir().unwrap();
    let result = executor_in(tmp.path()).run(&graph).await.expect("pipeline should succeed");

    assert!(result.completed_nodes.contains(&"path_a".to_string()));
    assert!(!result.completed_nodes.contains(&"path_b".to_string()));
    assert!(result.completed_nodes.contains(&"done".to_string()));
}

#[tokio::test]
async fn edge_guard_fallback_takes_first_unguarded_edge() {
    let graph = build_graph(
        r#"digraph EdgeFallback {
            start [shape="Mdiamond"]
            check [shape="box", prompt="Check"]
            guarded [shape="box", prompt="Guarded"]
            fallback [shape="box", prompt="Fallback"]
            done [shape="Msquare"]
            start -> check
            check -> guarded [guard="last_stage=nonexistent_stage"]
            check -> fallback
            guarded -> done
            fallback -> done
        }"#,
    );

    let tmp = tempfile::tempdir().unwrap();
    let result = executor_in(tmp.path()).run(&graph).await.expect("pipeline should succeed");

    assert!(result.completed_nodes.contains(&"fallback".to_string()));
    assert!(!result.completed_nodes.contains(&"guarded".to_string()));
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn validation_catches_missing_start_and_terminal_nodes() {
    let graph = build_graph(
        r#"digraph Bad {
            a [shape="box", prompt="A"]
            b [shape="box", prompt="B"]
            a -> b
        }"#,
    );

    let result = validate_or_raise(&graph);
    assert!(result.is_err(), "validation should fail without a start node");

    let diags = validate(&graph);
    let error_rules: Vec<_> = diags
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.rule.as_str())
        .collect();
    assert!(error_rules.contains(&"start_node"));
    assert!(error_rules.contains(&"terminal_node"));
}

#[tokio::test]
async fn validation_detects_unreachable_nodes() {
    let graph = build_graph(
        r#"digraph Unreachable {
            start [shape="Mdiamond"]
            reachable [shape="box", prompt="Reachable"]
            orphan [shape="box", prompt="Orphan"]
            done [shape="Msquare"]
            start -> reachable -> done
        }"#,
    );

    let diags = validate(&graph);
    assert!(diags.iter().any(|d| d.rule == "reachability"
        && d.severity == Severity::Error
        && d.message.contains("orphan")));
}

// ---------------------------------------------------------------------------
// Stylesheet application
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stylesheet_applies_model_and_pipeline_still_runs() {
    let mut graph = build_graph(
        r#"digraph Styled {
            start [shape="Mdiamond"]
            analyze [shape="box", prompt="Analyze", class="fast"]
            summarize [shape="box", prompt="Summarize"]
            done [shape="Msquare"]
            start -> analyze -> summarize -> done
        }"#,
    );

    let css = r#"
        * { llm_model: default-model; }
        .fast { llm_model: fast-model; }
        #summarize { llm_model: summarize-model; }
    "#;
    let stylesheet = parse_stylesheet(css).expect("stylesheet parse should succeed");
    apply_stylesheet(&mut graph, &stylesheet);

    assert_eq!(graph.node("start").unwrap().llm_model.as_deref(), Some("default-model"));
    assert_eq!(graph.node("analyze").unwrap().llm_model.as_deref(), Some("fast-model"));
    assert_eq!(graph.node("summarize").unwrap().llm_model.as_deref(), Some("summarize-model"));

    let tmp = tempfile::tempdir().unwrap();
    let result = executor_in(tmp.path()).run(&graph).await.expect("styled pipeline should execute");
    assert_eq!(result.completed_nodes.len(), 4);
}

#[tokio::test]
async fn stylesheet_never_overrides_explicit_node_attribute() {
    let mut graph = build_graph(
        r#"digraph Explicit {
            start [shape="Mdiamond"]
            work [shape="box", prompt="Do it", llm_model="explicit-model"]
            done [shape="Msquare"]
            start -> work -> done
        }"#,
    );
    let stylesheet = parse_stylesheet("* { llm_model: stylesheet-model; }").unwrap();
    apply_stylesheet(&mut graph, &stylesheet);

    assert_eq!(graph.node("work").unwrap().llm_model.as_deref(), Some("explicit-model"));
}

// ---------------------------------------------------------------------------
// Context propagation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn context_updates_propagate_between_nodes() {
    let graph = build_graph(
        r#"digraph ContextTest {
            start [shape="Mdiamond"]
            step_one [shape="box", prompt="First step"]
            step_two [shape="box", prompt="Second step"]
            done [shape="Msquare"]
            start -> step_one -> step_two -> done
        }"#,
    );

    let tmp = tempfile::tempdir().unwrap();
    let result = executor_in(tmp.path()).run(&graph).await.expect("pipeline should succeed");

    // CodergenHandler stamps last_stage with its own node id on every run.
    assert_eq!(
        result.final_context.get("last_stage"),
        Some(&serde_json::json!("done")),
        "last_stage should reflect the final executing node"
    );
    assert!(result.final_context.contains_key("last_response"));
}

// ---------------------------------------------------------------------------
// Retry behavior with a custom handler
// ---------------------------------------------------------------------------

struct FailOnceThenSucceed {
    call_count: Arc<AtomicUsize>,
}

#[async_trait]
impl NodeHandler for FailOnceThenSucceed {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        _context: &Context,
        _graph: &PipelineGraph,
        _logs_root: &std::path::Path,
    ) -> PResult<Outcome> {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst);
        if count == 0 {
            Ok(Outcome::fail("first attempt fails"))
        } else {
            let mut updates = HashMap::new();
            updates.insert(format!("{}.completed", node.id), serde_json::json!(true));
            let mut outcome = Outcome::success("retry succeeded");
            outcome.context_updates = updates;
            Ok(outcome)
        }
    }
}

#[tokio::test]
async fn node_retries_then_succeeds() {
    let mut graph = build_graph(
        r#"digraph Retry {
            start [shape="Mdiamond"]
            flaky [shape="box", prompt="Flaky step", retry_policy="none"]
            done [shape="Msquare"]
            start -> flaky -> done
        }"#,
    );
    for node in graph.all_nodes_mut() {
        if node.id == "flaky" {
            node.max_retries = 2;
        }
    }

    let mut registry = HandlerRegistry::new();
    registry.register(pipeweave_pipeline::StartHandler);
    registry.register(pipeweave_pipeline::ExitHandler);
    registry.register(FailOnceThenSucceed { call_count: Arc::new(AtomicUsize::new(0)) });

    let tmp = tempfile::tempdir().unwrap();
    let executor = PipelineExecutor::new(
        registry,
        PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() },
    );

    let result = executor.run(&graph).await.expect("pipeline should succeed after retry");
    assert_eq!(result.status, StageStatus::Success);
    assert!(result.completed_nodes.contains(&"done".to_string()));
    assert_eq!(result.final_context.get("flaky.completed"), Some(&serde_json::json!(true)));
}

// ---------------------------------------------------------------------------
// Parallel fan-out / fan-in
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_region_joins_and_routes_through_fan_in() {
    let graph = build_graph(
        r#"digraph Parallel {
            start [shape="Mdiamond"]
            fork [shape="component"]
            branch_a [shape="box", prompt="A"]
            branch_b [shape="box", prompt="B"]
            merge [shape="tripleoctagon"]
            done [shape="Msquare"]
            start -> fork
            fork -> branch_a
            fork -> branch_b
            branch_a -> merge
            branch_b -> merge
            merge -> done
        }"#,
    );

    let tmp = tempfile::tempdir().unwrap();
    let result = executor_in(tmp.path()).run(&graph).await.expect("pipeline should succeed");

    assert_eq!(result.status, StageStatus::Success);
    assert!(result.completed_nodes.contains(&"branch_a".to_string()));
    assert!(result.completed_nodes.contains(&"branch_b".to_string()));
    assert!(result.completed_nodes.contains(&"merge".to_string()));
    assert!(result.final_context.contains_key("parallel.fan_in.best_id"));
}

// ---------------------------------------------------------------------------
// Human-in-the-loop gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_human_auto_approve_picks_first_choice() {
    let graph = build_graph(
        r#"digraph HumanGate {
            start [shape="Mdiamond"]
            review [shape="hexagon", prompt="Approve this change?"]
            approved [shape="box", prompt="Approved"]
            rejected [shape="box", prompt="Rejected"]
            done [shape="Msquare"]
            start -> review
            review -> approved [label="Approve"]
            review -> rejected [label="Reject"]
            approved -> done
            rejected -> done
        }"#,
    );

    let tmp = tempfile::tempdir().unwrap();
    let interviewer = Arc::new(AutoApproveInterviewer);
    let registry = default_registry_with_interviewer(interviewer);
    let executor = PipelineExecutor::new(
        registry,
        PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() },
    );

    let result = executor.run(&graph).await.expect("pipeline should succeed");
    assert!(result.completed_nodes.contains(&"approved".to_string()));
    assert!(!result.completed_nodes.contains(&"rejected".to_string()));
}

#[tokio::test]
async fn wait_human_queue_interviewer_selects_queued_answer() {
    let graph = build_graph(
        r#"digraph HumanGateQueue {
            start [shape="Mdiamond"]
            review [shape="hexagon", prompt="Approve this change?"]
            approved [shape="box", prompt="Approved"]
            rejected [shape="box", prompt="Rejected"]
            done [shape="Msquare"]
            start -> review
            review -> approved [label="Approve"]
            review -> rejected [label="Reject"]
            approved -> done
            rejected -> done
        }"#,
    );

    let tmp = tempfile::tempdir().unwrap();
    let interviewer = Arc::new(QueueInterviewer::new(vec![Answer::new("Reject")]));
    let registry = default_registry_with_interviewer(interviewer);
    let executor = PipelineExecutor::new(
        registry,
        PipelineConfig { logs_root: tmp.path().to_path_buf(), ..Default::default() },
    );

    let result = executor.run(&graph).await.expect("pipeline should succeed");
    assert!(result.completed_nodes.contains(&"rejected".to_string()));
    assert!(!result.completed_nodes.contains(&"approved".to_string()));
}

// ---------------------------------------------------------------------------
// Checkpointing across a full run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn checkpoint_is_cleared_after_a_successful_run() {
    let graph = build_graph(
        r#"digraph Checkpointed {
            start [shape="Mdiamond"]
            work [shape="box", prompt="Work"]
            done [shape="Msquare"]
            start -> work -> done
        }"#,
    );

    let tmp = tempfile::tempdir().unwrap();
    executor_in(tmp.path()).run(&graph).await.expect("pipeline should succeed");

    let checkpoint = pipeweave_pipeline::load_checkpoint(tmp.path()).await.unwrap();
    assert!(checkpoint.is_none(), "checkpoint should be cleared on success");
}

#[tokio::test]
async fn checkpoint_survives_a_failed_run_for_inspection() {
    let graph = build_graph(
        r#"digraph Failing {
            start [shape="Mdiamond"]
            gate [shape="tripleoctagon"]
            done [shape="Msquare"]
            start -> gate -> done
        }"#,
    );

    let tmp = tempfile::tempdir().unwrap();
    let result = executor_in(tmp.path()).run(&graph).await.expect("run should complete without erroring");
    assert_eq!(result.status, StageStatus::Fail);

    let checkpoint = pipeweave_pipeline::load_checkpoint(tmp.path())
        .await
        .unwrap()
        .expect("a failed run should leave its checkpoint behind");
    assert_eq!(checkpoint.current_node, "gate");
}

// ---------------------------------------------------------------------------
// Ten-node linear chain (scale sanity check)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ten_node_linear_pipeline_completes() {
    let mut dot = String::from("digraph ManyNodes {\n    start [shape=\"Mdiamond\"]\n");
    for i in 1..=8 {
        dot.push_str(&format!("    step_{i} [shape=\"box\", prompt=\"Step {i}\"]\n"));
    }
    dot.push_str("    done [shape=\"Msquare\"]\n    start -> step_1\n");
    for i in 1..8 {
        dot.push_str(&format!("    step_{i} -> step_{}\n", i + 1));
    }
    dot.push_str("    step_8 -> done\n}\n");

    let graph = build_graph(&dot);
    let diags = validate_or_raise(&graph).expect("10-node graph should validate");
    assert!(diags.iter().all(|d| d.severity != Severity::Error));

    let tmp = tempfile::tempdir().unwrap();
    let result = executor_in(tmp.path()).run(&graph).await.expect("pipeline should succeed");

    assert_eq!(result.completed_nodes.len(), 10);
    assert_eq!(result.completed_nodes[0], "start");
    assert_eq!(result.completed_nodes[9], "done");
    for (_, status) in &result.node_outcomes {
        assert_eq!(*status, StageStatus::Success);
    }
}
