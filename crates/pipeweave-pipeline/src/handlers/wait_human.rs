//! WaitHumanHandler — pauses pipeline execution for human input.
//!
//! Choices are derived from outgoing edges rather than configured
//! separately: each edge becomes a `{key, label, target}` triple, with the
//! accelerator key extracted from a `[X] Label`-style bracket or the first
//! letter of the label's first word.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use pipeweave_types::{Context, Outcome, Result, StageStatus};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;
use crate::interviewer::{Answer, Interviewer, Question, ANSWER_SKIPPED, ANSWER_TIMEOUT};

struct Choice {
    key: String,
    label: String,
    target: String,
}

fn accelerator_key(label: &str) -> String {
    static BRACKET: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let bracket = BRACKET.get_or_init(|| Regex::new(r"^\[(\w)\]").unwrap());
    if let Some(caps) = bracket.captures(label) {
        return caps[1].to_uppercase();
    }
    label
        .split_whitespace()
        .next()
        .and_then(|word| word.chars().next())
        .map(|c| c.to_uppercase().to_string())
        .unwrap_or_default()
}

fn derive_choices(node_id: &str, graph: &PipelineGraph) -> Vec<Choice> {
    graph
        .outgoing_edges(node_id)
        .iter()
        .map(|edge| {
            let label = edge.label.clone().unwrap_or_else(|| edge.to.clone());
            let key = accelerator_key(&label);
            Choice { key, label, target: edge.to.clone() }
        })
        .collect()
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    fn handler_type(&self) -> &str {
        "wait.human"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        _ctx: &Context,
        graph: &PipelineGraph,
        logs_root: &Path,
    ) -> Result<Outcome> {
        let choices = derive_choices(&node.id, graph);
        if choices.is_empty() {
            return Ok(Outcome::fail("No choices available for human gate"));
        }

        let prompt_text = node.prompt.clone().unwrap_or_else(|| node.label.clone());
        let question = Question::multiple_choice(
            prompt_text,
            node.id.clone(),
            choices.iter().map(|c| c.label.clone()).collect(),
        );
        let mut question = question;
        question.timeout_seconds = node.timeout_seconds;

        let answer = self.interviewer.ask(&question).await?;

        let selected = self.resolve_choice(&choices, &answer, node);

        let outcome = match selected {
            SelectedChoice::Chosen(choice) => {
                let mut outcome = Outcome::success(format!("human selected '{}'", choice.label));
                outcome.suggested_next_ids = vec![choice.target.clone()];
                outcome.preferred_label = Some(choice.label.clone());
                outcome.context_updates.insert(
                    "human.gate.selected".to_string(),
                    serde_json::Value::String(choice.key.clone()),
                );
                outcome.context_updates.insert(
                    "human.gate.label".to_string(),
                    serde_json::Value::String(choice.label.clone()),
                );
                outcome.context_updates.insert(
                    "last_stage".to_string(),
                    serde_json::Value::String(node.id.clone()),
                );
                outcome
            }
            SelectedChoice::Retry => Outcome::retry("human gate timed out with no default"),
            SelectedChoice::Fail => Outcome::fail("human skipped the gate"),
        };

        self.write_status(logs_root, node, &outcome).await;
        Ok(outcome)
    }
}

enum SelectedChoice<'a> {
    Chosen(&'a Choice),
    Retry,
    Fail,
}

impl WaitHumanHandler {
    fn resolve_choice<'a>(&self, choices: &'a [Choice], answer: &Answer, node: &PipelineNode) -> SelectedChoice<'a> {
        if answer.value == ANSWER_TIMEOUT {
            if let Some(default) = &node.human_default_choice {
                let normalized_default = normalize(default);
                if let Some(choice) = choices
                    .iter()
                    .find(|c| normalize(&c.key) == normalized_default || normalize(&c.label) == normalized_default)
                {
                    return SelectedChoice::Chosen(choice);
                }
            }
            return SelectedChoice::Retry;
        }

        if answer.value == ANSWER_SKIPPED {
            return SelectedChoice::Fail;
        }

        if let Some(selected) = &answer.selected_option {
            let normalized = normalize(selected);
            if let Some(choice) = choices.iter().find(|c| normalize(&c.key) == normalized) {
                return SelectedChoice::Chosen(choice);
            }
        }

        let normalized_value = normalize(&answer.value);
        if let Some(choice) = choices
            .iter()
            .find(|c| normalize(&c.key) == normalized_value || normalize(&c.label) == normalized_value)
        {
            return SelectedChoice::Chosen(choice);
        }

        SelectedChoice::Chosen(&choices[0])
    }

    async fn write_status(&self, logs_root: &Path, node: &PipelineNode, outcome: &Outcome) {
        let dir = logs_root.join(&node.id);
        if std::fs::create_dir_all(&dir).is_err() {
            return;
        }
        if let Ok(json) = serde_json::to_string_pretty(outcome) {
            let _ = std::fs::write(dir.join("status.json"), json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interviewer::{QueueInterviewer, ANSWER_TIMEOUT};
    use crate::handlers::tests::make_node;

    fn make_graph_with_labeled_edges(node_id: &str, labels: &[&str]) -> PipelineGraph {
        let mut dot = String::from("digraph G {\n");
        dot.push_str(&format!("  {} [shape=\"hexagon\"]\n", node_id));
        for (i, label) in labels.iter().enumerate() {
            let target = format!("target_{}", i);
            dot.push_str(&format!("  {} [shape=\"box\"]\n", target));
            dot.push_str(&format!("  {} -> {} [label=\"{}\"]\n", node_id, target, label));
        }
        dot.push_str("}\n");
        let parsed = pipeweave_dot::parse(&dot).unwrap();
        PipelineGraph::from_dot(parsed).unwrap()
    }

    #[test]
    fn accelerator_key_from_bracket() {
        assert_eq!(accelerator_key("[Y] Yes"), "Y");
    }

    #[test]
    fn accelerator_key_from_first_letter() {
        assert_eq!(accelerator_key("Reject"), "R");
    }

    #[tokio::test]
    async fn derives_choices_and_selects_by_key() {
        let interviewer = Arc::new(QueueInterviewer::new(vec![Answer::with_option("Approve", "A")]));
        let handler = WaitHumanHandler::new(interviewer);
        let node = make_node("review", "hexagon", Some("Please review"), HashMap::new());
        let graph = make_graph_with_labeled_edges("review", &["Approve", "Reject"]);
        let tmp = tempfile::tempdir().unwrap();

        let ctx = Context::default();
        let outcome = handler.execute(&node, &ctx, &graph, tmp.path()).await.unwrap();

        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.suggested_next_ids, vec!["target_0".to_string()]);
        assert_eq!(
            outcome.context_updates.get("human.gate.label"),
            Some(&serde_json::Value::String("Approve".to_string()))
        );
    }

    #[tokio::test]
    async fn no_edges_fails() {
        let interviewer = Arc::new(QueueInterviewer::new(vec![]));
        let handler = WaitHumanHandler::new(interviewer);
        let node = make_node("gate", "hexagon", None, HashMap::new());
        let dot = r#"digraph G { gate [shape="hexagon"] }"#;
        let parsed = pipeweave_dot::parse(dot).unwrap();
        let graph = PipelineGraph::from_dot(parsed).unwrap();
        let tmp = tempfile::tempdir().unwrap();

        let ctx = Context::default();
        let outcome = handler.execute(&node, &ctx, &graph, tmp.path()).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[tokio::test]
    async fn timeout_with_matching_default_succeeds() {
        let interviewer = Arc::new(QueueInterviewer::new(vec![Answer::new(ANSWER_TIMEOUT)]));
        let handler = WaitHumanHandler::new(interviewer);
        let mut attrs = HashMap::new();
        attrs.insert(
            "human.default_choice".to_string(),
            pipeweave_dot::AttributeValue::String("Approve".to_string()),
        );
        let node = make_node("review", "hexagon", None, attrs);
        let graph = make_graph_with_labeled_edges("review", &["Approve", "Reject"]);
        let tmp = tempfile::tempdir().unwrap();

        let ctx = Context::default();
        let outcome = handler.execute(&node, &ctx, &graph, tmp.path()).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.suggested_next_ids, vec!["target_0".to_string()]);
    }

    #[tokio::test]
    async fn timeout_without_default_retries() {
        let interviewer = Arc::new(QueueInterviewer::new(vec![Answer::new(ANSWER_TIMEOUT)]));
        let handler = WaitHumanHandler::new(interviewer);
        let node = make_node("review", "hexagon", None, HashMap::new());
        let graph = make_graph_with_labeled_edges("review", &["Approve", "Reject"]);
        let tmp = tempfile::tempdir().unwrap();

        let ctx = Context::default();
        let outcome = handler.execute(&node, &ctx, &graph, tmp.path()).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Retry);
    }

    #[tokio::test]
    async fn skipped_fails() {
        let interviewer = Arc::new(QueueInterviewer::new(vec![Answer::new("skipped")]));
        let handler = WaitHumanHandler::new(interviewer);
        let node = make_node("review", "hexagon", None, HashMap::new());
        let graph = make_graph_with_labeled_edges("review", &["Approve", "Reject"]);
        let tmp = tempfile::tempdir().unwrap();

        let ctx = Context::default();
        let outcome = handler.execute(&node, &ctx, &graph, tmp.path()).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[tokio::test]
    async fn unmatched_answer_falls_back_to_first_choice() {
        let interviewer = Arc::new(QueueInterviewer::new(vec![Answer::new("nonsense")]));
        let handler = WaitHumanHandler::new(interviewer);
        let node = make_node("review", "hexagon", None, HashMap::new());
        let graph = make_graph_with_labeled_edges("review", &["Approve", "Reject"]);
        let tmp = tempfile::tempdir().unwrap();

        let ctx = Context::default();
        let outcome = handler.execute(&node, &ctx, &graph, tmp.path()).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.suggested_next_ids, vec!["target_0".to_string()]);
    }
}
