//! Pipeline execution engine, node handlers, validation, and edge selection.
//!
//! This crate implements the core pipeline runner: DOT graph traversal,
//! handler dispatch, edge selection, retry policies, checkpoint/resume, the
//! event stream, and the built-in lint rules.

pub mod backend;
pub mod checkpoint;
pub mod condition;
pub mod edge_selection;
pub mod engine;
pub mod events;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod interviewer;
pub mod retry;
pub mod stylesheet;
pub mod transforms;
pub mod validation;

pub use backend::{Backend, BackendOptions, BackendResponse, StubBackend, SubprocessBackend, UsageCounts, UsageRecord};
pub use condition::{
    parse_condition, evaluate_condition, GuardClause, GuardExpr, Operator,
};
pub use edge_selection::select_next;
pub use engine::{CancellationToken, PipelineConfig, PipelineExecutor, PipelineResult};
pub use events::{EventEmitter, EventKind, PipelineEvent};
pub use graph::{PipelineEdge, PipelineGraph, PipelineNode};
pub use handler::{
    default_registry, default_registry_with_interviewer, ConditionalHandler, DynHandler, ExitHandler,
    HandlerRegistry, NodeHandler, StartHandler,
};
pub use handlers::{CodergenHandler, FanInHandler, ManagerLoopHandler, ParallelHandler, SubPipelineHandler, ToolHandler};
pub use handlers::parallel::ParallelResult;
pub use handlers::wait_human::WaitHumanHandler;
pub use interviewer::{
    Answer, AutoApproveInterviewer, CallbackInterviewer, Interviewer, Question, QuestionType,
    QueueInterviewer, RecordingInterviewer, RemoteInterviewer,
};
pub use retry::{execute_with_retry, should_retry, RetryConfig, RetryObserver, RetryPolicy};
pub use stylesheet::{apply_stylesheet, parse_stylesheet, Declaration, Rule, Selector, Stylesheet};
pub use transforms::apply_transforms;
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
pub use checkpoint::{clear_checkpoint, load_checkpoint, save_checkpoint};
