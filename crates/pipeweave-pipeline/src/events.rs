//! Pipeline event system for observability.
//!
//! A single [`EventEmitter`] fans events out to any number of subscribers via
//! a [`tokio::sync::broadcast`] channel, so loggers, metrics collectors, or a
//! UI can watch a run progress without coupling to the engine internals.
//! Events are delivered to each subscriber in emission order; a subscriber
//! that falls behind the channel capacity sees a lagged gap rather than
//! blocking the emitter.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kind of lifecycle event emitted during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    PipelineStarted,
    StageStarted,
    StageCompleted,
    StageRetry,
    PipelineCompleted,
    PipelineFailed,
}

/// One emitted event: a kind, a timestamp, an optional node id, and an open
/// `data` mapping whose shape depends on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub kind: EventKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl PipelineEvent {
    pub fn new(kind: EventKind, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        Self { kind, timestamp, node_id: None, data: Map::new() }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Wraps a broadcast sender; `Clone` hands out another handle to the same
/// underlying channel rather than a new one. An optional `prefix` namespaces
/// stage ids emitted through this handle — set via [`prefixed`](Self::prefixed)
/// when a sub-pipeline node recurses into the runner, so events from the
/// nested run land on the same channel as the parent's but tagged with the
/// sub-pipeline node's id.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
    prefix: Option<std::sync::Arc<str>>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender, prefix: None }
    }

    /// Return a handle to the same channel whose stage ids are namespaced
    /// under `node_id`. Nesting chains the prefix with `.` so a sub-pipeline
    /// inside a sub-pipeline still produces a unique, readable stage id.
    pub fn prefixed(&self, node_id: &str) -> Self {
        let prefix = match &self.prefix {
            Some(existing) => format!("{existing}.{node_id}"),
            None => node_id.to_string(),
        };
        Self { sender: self.sender.clone(), prefix: Some(prefix.into()) }
    }

    fn namespaced(&self, node_id: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{node_id}"),
            None => node_id.to_string(),
        }
    }

    /// Emit an event to all current subscribers. If there are none, the
    /// event is dropped — nothing in the contract requires a consumer to
    /// be listening.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn pipeline_started(&self, pipeline_name: &str, node_count: usize) {
        self.emit(
            PipelineEvent::new(EventKind::PipelineStarted, now())
                .with_data("pipelineName", pipeline_name)
                .with_data("nodeCount", node_count as u64),
        );
    }

    pub fn stage_started(&self, node_id: &str, handler_type: &str) {
        self.emit(
            PipelineEvent::new(EventKind::StageStarted, now())
                .with_node(self.namespaced(node_id))
                .with_data("handlerType", handler_type),
        );
    }

    pub fn stage_completed(&self, node_id: &str, status: &str, duration_ms: u64) {
        self.emit(
            PipelineEvent::new(EventKind::StageCompleted, now())
                .with_node(self.namespaced(node_id))
                .with_data("status", status)
                .with_data("durationMs", duration_ms),
        );
    }

    pub fn stage_retry(&self, node_id: &str, attempt: usize, max_attempts: usize, reason: &str) {
        self.emit(
            PipelineEvent::new(EventKind::StageRetry, now())
                .with_node(self.namespaced(node_id))
                .with_data("attempt", attempt as u64)
                .with_data("maxAttempts", max_attempts as u64)
                .with_data("reason", reason),
        );
    }

    pub fn pipeline_completed(&self, pipeline_name: &str, completed_nodes: &[String], duration_ms: u64) {
        self.emit(
            PipelineEvent::new(EventKind::PipelineCompleted, now())
                .with_data("pipelineName", pipeline_name)
                .with_data("completedNodes", Value::from(completed_nodes.to_vec()))
                .with_data("durationMs", duration_ms),
        );
    }

    pub fn pipeline_failed(&self, pipeline_name: &str, error: &str) {
        self.emit(
            PipelineEvent::new(EventKind::PipelineFailed, now())
                .with_data("pipelineName", pipeline_name)
                .with_data("error", error),
        );
    }

    /// Subscribe to events from this point forward.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Drop the sender side, causing all current and future subscribers'
    /// `recv()` calls to return `Closed` once the backlog drains.
    pub fn close(&self) {
        // Dropping our own clone doesn't close the channel while other
        // senders (cloned EventEmitter handles) exist; emitting nothing
        // further is the practical signal. Subscribers observe closure
        // once every EventEmitter handle referencing this channel is
        // dropped, which happens naturally at the end of a run.
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod prefix_tests {
    use super::*;

    #[tokio::test]
    async fn prefixed_emitter_namespaces_stage_ids() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let nested = emitter.prefixed("nested_job");

        nested.stage_started("work", "codergen");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.node_id.as_deref(), Some("nested_job.work"));
    }

    #[tokio::test]
    async fn nested_prefixes_chain_with_dots() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let nested = emitter.prefixed("outer").prefixed("inner");

        nested.stage_completed("leaf", "success", 5);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.node_id.as_deref(), Some("outer.inner.leaf"));
    }
}

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
