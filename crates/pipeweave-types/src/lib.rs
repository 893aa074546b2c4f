//! Shared types, errors, context, and outcome model for the Pipeweave engine.
//!
//! This crate provides the foundational types used by the parser, the
//! transform pipeline, and the execution engine:
//! - `PipeweaveError` — unified error taxonomy
//! - `Context` — async-safe key-value store for per-run pipeline state
//! - `Outcome` — result of executing a node handler
//! - `Checkpoint` — serializable snapshot for crash recovery

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Unified error type for the graph model, transform pipeline, and engine.
#[derive(Debug, thiserror::Error)]
pub enum PipeweaveError {
    #[error("DOT parse error at line {line}, col {col}: {message}")]
    ParseError {
        line: usize,
        col: usize,
        message: String,
        source_snippet: Option<String>,
    },

    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    #[error("Handler '{handler}' failed on node '{node}': {message}")]
    HandlerError {
        handler: String,
        node: String,
        message: String,
    },

    #[error("Backend error on node '{node}': {message}")]
    BackendError { node: String, message: String },

    #[error("Transform '{transform}' failed: {message}")]
    TransformError { transform: String, message: String },

    #[error("Max retries exhausted for node '{node}' after {attempts} attempts")]
    RetriesExhausted { node: String, attempts: usize },

    #[error("Command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    #[error("Node '{node}' timed out after {timeout_ms}ms")]
    NodeTimeout { node: String, timeout_ms: u64 },

    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PipeweaveError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    ///
    /// Classifies by message content per the shouldRetry contract: rate-limit
    /// markers, 5xx, network/timeout/connection-refused are retryable; auth,
    /// bad-request, validation, and configuration errors are not.
    pub fn is_retryable(&self) -> bool {
        if matches!(self, PipeweaveError::CommandTimeout { .. } | PipeweaveError::NodeTimeout { .. }) {
            return true;
        }
        if matches!(self, PipeweaveError::ValidationError(_) | PipeweaveError::Cancelled) {
            return false;
        }
        classify_retryable_message(&self.to_string())
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipeweaveError::ValidationError(_) | PipeweaveError::Cancelled)
    }
}

/// Classify a raw error message as retryable or not, per the `shouldRetry`
/// contract: retry on rate-limit markers, 5xx, network/timeout/connection
/// errors; never retry on 401/403/400/validation/configuration markers.
pub fn classify_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    const NON_RETRYABLE: &[&str] = &[
        "401", "403", "400", "unauthorized", "forbidden", "bad request",
        "validation", "configuration", "invalid api key", "authentication",
    ];
    if NON_RETRYABLE.iter().any(|m| lower.contains(m)) {
        return false;
    }
    const RETRYABLE: &[&str] = &[
        "rate limit", "rate-limit", "429", "500", "502", "503", "504",
        "network", "timeout", "timed out", "econnrefused", "connection refused",
    ];
    RETRYABLE.iter().any(|m| lower.contains(m))
}

/// A convenience alias for `Result<T, PipeweaveError>`.
pub type Result<T> = std::result::Result<T, PipeweaveError>;

// ---------------------------------------------------------------------------
// Context — per-run key-value store for pipeline state
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

/// Async-safe key-value store shared across pipeline nodes during one run.
///
/// Cloning a `Context` yields another handle to the **same** inner state.
/// Use [`clone_isolated`](Context::clone_isolated) to get a deep copy for
/// parallel branch isolation.
#[derive(Clone)]
pub struct Context {
    inner: Arc<tokio::sync::RwLock<ContextInner>>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ContextInner {
    values: HashMap<String, serde_json::Value>,
    logs: Vec<String>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner {
                values: HashMap::new(),
                logs: Vec::new(),
            })),
        }
    }

    /// Insert or overwrite a key.
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        tracing::debug!(%key, "context key set");
        self.inner.write().await.values.insert(key, value);
    }

    /// Read a value by key (cloned).
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.values.get(key).cloned()
    }

    /// Returns the stored value as a string, or an empty string if absent or
    /// not representable as a plain string. Matches the spec's
    /// `get(key) -> string (empty if absent)` contract.
    pub async fn get_string(&self, key: &str) -> String {
        self.inner
            .read()
            .await
            .values
            .get(key)
            .map(value_to_display_string)
            .unwrap_or_default()
    }

    /// Remove a key, returning its previous value if present.
    pub async fn delete(&self, key: &str) -> Option<serde_json::Value> {
        let removed = self.inner.write().await.values.remove(key);
        if removed.is_some() {
            tracing::debug!(key, "context key deleted");
        }
        removed
    }

    /// Append a free-form log entry.
    pub async fn append_log(&self, entry: impl Into<String>) {
        self.inner.write().await.logs.push(entry.into());
    }

    /// A copy of the accumulated log entries.
    pub async fn logs(&self) -> Vec<String> {
        self.inner.read().await.logs.clone()
    }

    /// Shallow copy of the current values map.
    pub async fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.inner.read().await.values.clone()
    }

    /// Deep copy that is fully independent of the original context. Used to
    /// give parallel-region children an isolated view of the parent state.
    pub async fn clone_isolated(&self) -> Context {
        let guard = self.inner.read().await;
        Context {
            inner: Arc::new(tokio::sync::RwLock::new(guard.clone())),
        }
    }

    /// Merge `updates` into the context atomically. Existing keys not present
    /// in `updates` are preserved.
    pub async fn apply_updates(&self, updates: HashMap<String, serde_json::Value>) {
        if updates.is_empty() {
            return;
        }
        tracing::info!(count = updates.len(), "applying context updates");
        let mut guard = self.inner.write().await;
        guard.values.extend(updates);
    }
}

fn value_to_display_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StageStatus — outcome status of a pipeline node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    PartialSuccess,
    Retry,
    Fail,
    Skipped,
}

impl StageStatus {
    /// Rank used by the fan-in heuristic: lower is better.
    pub fn rank(self) -> u8 {
        match self {
            StageStatus::Success => 0,
            StageStatus::PartialSuccess => 1,
            StageStatus::Retry => 2,
            StageStatus::Fail => 3,
            StageStatus::Skipped => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::PartialSuccess => "partial_success",
            StageStatus::Retry => "retry",
            StageStatus::Fail => "fail",
            StageStatus::Skipped => "skipped",
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome — result of executing a node handler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: StageStatus,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    pub context_updates: HashMap<String, serde_json::Value>,
    pub notes: String,
    pub failure_reason: Option<String>,
}

impl Outcome {
    /// Create a successful outcome with the given notes.
    pub fn success(notes: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: HashMap::new(),
            notes: notes.into(),
            failure_reason: None,
        }
    }

    /// Create a failed outcome with the given reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: HashMap::new(),
            notes: String::new(),
            failure_reason: Some(reason.into()),
        }
    }

    /// Create a retry outcome.
    pub fn retry(notes: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Retry,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: HashMap::new(),
            notes: notes.into(),
            failure_reason: None,
        }
    }

    /// Create an outcome with a specific status and preferred label.
    pub fn with_label(status: StageStatus, label: impl Into<String>) -> Self {
        Self {
            status,
            preferred_label: Some(label.into()),
            suggested_next_ids: Vec::new(),
            context_updates: HashMap::new(),
            notes: String::new(),
            failure_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint — serializable snapshot for crash recovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub current_node: String,
    pub completed_nodes: Vec<String>,
    pub node_retries: HashMap<String, usize>,
    pub node_outcomes: HashMap<String, StageStatus>,
    pub context_values: HashMap<String, serde_json::Value>,
    pub logs: Vec<String>,
}

impl Checkpoint {
    /// Serialize this checkpoint to JSON and write it to `path`, overwriting
    /// any previous checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a checkpoint from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let checkpoint: Self = serde_json::from_str(&data)?;
        Ok(checkpoint)
    }
}
