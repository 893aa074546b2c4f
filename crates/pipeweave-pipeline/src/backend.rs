//! The `Backend` abstraction consumed by codergen-style handlers.
//!
//! `Backend.run` is the sole contract codergen and fan-in consult; the core
//! never talks to an LLM API directly. Two implementations ship here: a
//! deterministic `StubBackend` for tests and simulated runs, and a
//! `SubprocessBackend` that shells out to an external CLI, the idiom the
//! teacher's subprocess-spawning tool handler already demonstrates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use pipeweave_types::{Context, Outcome, PipeweaveError, Result};
use serde::{Deserialize, Serialize};

use crate::graph::PipelineNode;

/// Either a plain text reply, or a handler fully hands back a finished
/// [`Outcome`] (used by backends that already know how to set status/context
/// updates themselves).
pub enum BackendResponse {
    Text(String),
    Outcome(Outcome),
}

#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub logs_root: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn run(
        &self,
        node: &PipelineNode,
        prompt: &str,
        context: &Context,
        options: &BackendOptions,
    ) -> Result<BackendResponse>;
}

/// Usage/cost artifact written by subprocess-CLI backends per stage, per
/// spec's `usage.json` format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub node_id: String,
    pub cost_usd: f64,
    pub usage: UsageCounts,
    pub duration_ms: u64,
    pub duration_api_ms: u64,
    pub num_turns: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// Deterministic backend used in tests and for dry-run simulation, echoing
/// back a fixed or templated response without spawning a process.
pub struct StubBackend {
    response: String,
}

impl StubBackend {
    pub fn new(response: impl Into<String>) -> Self {
        Self { response: response.into() }
    }
}

#[async_trait]
impl Backend for StubBackend {
    async fn run(
        &self,
        _node: &PipelineNode,
        _prompt: &str,
        _context: &Context,
        _options: &BackendOptions,
    ) -> Result<BackendResponse> {
        Ok(BackendResponse::Text(self.response.clone()))
    }
}

/// Invokes an external CLI as a subprocess, constructing argv from node
/// attributes such as `llm_model`. Parses JSON stdout into a result string
/// plus usage, and writes `usage.json` under the node's log directory.
pub struct SubprocessBackend {
    pub command: String,
}

impl SubprocessBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

#[derive(Debug, Deserialize)]
struct CliStdout {
    result: String,
    #[serde(default)]
    cost_usd: f64,
    #[serde(default)]
    usage: UsageCounts,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    duration_api_ms: u64,
    #[serde(default)]
    num_turns: u32,
}

#[async_trait]
impl Backend for SubprocessBackend {
    async fn run(
        &self,
        node: &PipelineNode,
        prompt: &str,
        _context: &Context,
        options: &BackendOptions,
    ) -> Result<BackendResponse> {
        let mut cmd = tokio::process::Command::new(&self.command);
        if let Some(model) = &node.llm_model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("--prompt").arg(prompt);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd.spawn().map_err(|e| PipeweaveError::BackendError {
            node: node.id.clone(),
            message: format!("failed to spawn backend command '{}': {}", self.command, e),
        })?;

        let timeout = Duration::from_millis(options.timeout_ms.unwrap_or(300_000));
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| PipeweaveError::CommandTimeout { timeout_ms: timeout.as_millis() as u64 })?
            .map_err(|e| PipeweaveError::BackendError {
                node: node.id.clone(),
                message: format!("backend command failed: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(PipeweaveError::BackendError {
                node: node.id.clone(),
                message: format!("backend exited with {}: {}", output.status, stderr),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let parsed: CliStdout = serde_json::from_str(&stdout).map_err(|e| PipeweaveError::BackendError {
            node: node.id.clone(),
            message: format!("could not parse backend stdout as JSON: {}", e),
        })?;

        if let Some(root) = &options.logs_root {
            let dir = root.join(&node.id);
            let _ = std::fs::create_dir_all(&dir);
            let record = UsageRecord {
                node_id: node.id.clone(),
                cost_usd: parsed.cost_usd,
                usage: parsed.usage,
                duration_ms: parsed.duration_ms,
                duration_api_ms: parsed.duration_api_ms,
                num_turns: parsed.num_turns,
            };
            if let Ok(json) = serde_json::to_string_pretty(&record) {
                let _ = std::fs::write(dir.join("usage.json"), json);
            }
        }

        Ok(BackendResponse::Text(parsed.result))
    }
}

/// Expand `$goal` and `$context.<key>` tokens in `template` at execution
/// time. Per spec, this is the runtime counterpart to the transform-time
/// `$goal`-only substitution.
pub async fn expand_runtime_tokens(template: &str, goal: &str, context: &Context) -> String {
    let mut result = template.replace("$goal", goal);

    let mut replacements: Vec<(String, String)> = Vec::new();
    let mut rest = result.as_str();
    while let Some(idx) = rest.find("$context.") {
        let after = &rest[idx + "$context.".len()..];
        let key_len = after
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
            .unwrap_or(after.len());
        let key = &after[..key_len];
        if !key.is_empty() {
            let token = format!("$context.{}", key);
            let value = context.get_string(key).await;
            replacements.push((token, value));
        }
        rest = &after[key_len..];
    }
    for (token, value) in replacements {
        result = result.replace(&token, &value);
    }
    result
}

/// Helper for handlers that need an arbitrary key/value context-updates map.
pub fn single_update(key: impl Into<String>, value: serde_json::Value) -> HashMap<String, serde_json::Value> {
    let mut m = HashMap::new();
    m.insert(key.into(), value);
    m
}
