//! Interviewer trait and built-in implementations for human interaction.
//!
//! The runner never blocks on a terminal or a socket directly: it asks an
//! `Interviewer`, which abstracts over auto-approval, pre-recorded answers,
//! an arbitrary callback, and a remote/web-facing mailbox.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use pipeweave_types::Result;
use serde::{Deserialize, Serialize};

pub const ANSWER_YES: &str = "yes";
pub const ANSWER_NO: &str = "no";
pub const ANSWER_SKIPPED: &str = "skipped";
pub const ANSWER_TIMEOUT: &str = "timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    YesNo,
    MultipleChoice,
    Freeform,
    Confirmation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    #[serde(default)]
    pub options: Vec<String>,
    pub default_answer: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub stage: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Question {
    pub fn yes_no(text: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            question_type: QuestionType::YesNo,
            options: Vec::new(),
            default_answer: None,
            timeout_seconds: None,
            stage: stage.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn multiple_choice(text: impl Into<String>, stage: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            text: text.into(),
            question_type: QuestionType::MultipleChoice,
            options,
            default_answer: None,
            timeout_seconds: None,
            stage: stage.into(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub value: String,
    pub selected_option: Option<String>,
    pub text: Option<String>,
}

impl Answer {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into(), selected_option: None, text: None }
    }

    pub fn with_option(value: impl Into<String>, option: impl Into<String>) -> Self {
        Self { value: value.into(), selected_option: Some(option.into()), text: None }
    }
}

#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(&self, question: &Question) -> Result<Answer>;

    /// Default: sequential `ask` calls, preserving question order.
    async fn ask_multiple(&self, questions: &[Question]) -> Result<Vec<Answer>> {
        let mut answers = Vec::with_capacity(questions.len());
        for q in questions {
            answers.push(self.ask(q).await?);
        }
        Ok(answers)
    }

    async fn inform(&self, _message: &str, _stage: &str) {}
}

// ---------------------------------------------------------------------------
// AutoApprove
// ---------------------------------------------------------------------------

/// Answers everything without human involvement: useful for dry runs and
/// unattended pipelines.
pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let answer = match question.question_type {
            QuestionType::YesNo | QuestionType::Confirmation => Answer::new(ANSWER_YES),
            QuestionType::MultipleChoice => match question.options.first() {
                Some(opt) => Answer::with_option(opt.clone(), opt.clone()),
                None => Answer::new("auto-approved"),
            },
            QuestionType::Freeform => Answer::new("auto-approved"),
        };
        Ok(answer)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Pops pre-loaded answers in order; returns `skipped` once exhausted.
pub struct QueueInterviewer {
    answers: Mutex<std::collections::VecDeque<Answer>>,
}

impl QueueInterviewer {
    pub fn new(answers: Vec<Answer>) -> Self {
        Self { answers: Mutex::new(answers.into()) }
    }
}

#[async_trait]
impl Interviewer for QueueInterviewer {
    async fn ask(&self, _question: &Question) -> Result<Answer> {
        let mut queue = self.answers.lock().unwrap();
        Ok(queue.pop_front().unwrap_or_else(|| Answer::new(ANSWER_SKIPPED)))
    }
}

// ---------------------------------------------------------------------------
// Callback
// ---------------------------------------------------------------------------

type BoxAnswerFuture = Pin<Box<dyn Future<Output = Result<Answer>> + Send>>;
type AskFn = dyn Fn(&Question) -> BoxAnswerFuture + Send + Sync;

/// Delegates to an arbitrary async callback; races it against a `timeout`
/// answer when the question carries `timeoutSeconds`.
pub struct CallbackInterviewer {
    callback: Box<AskFn>,
}

impl CallbackInterviewer {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Question) -> BoxAnswerFuture + Send + Sync + 'static,
    {
        Self { callback: Box::new(callback) }
    }
}

#[async_trait]
impl Interviewer for CallbackInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let fut = (self.callback)(question);
        match question.timeout_seconds {
            Some(secs) => match tokio::time::timeout(std::time::Duration::from_secs(secs), fut).await {
                Ok(result) => result,
                Err(_) => Ok(Answer::new(ANSWER_TIMEOUT)),
            },
            None => fut.await,
        }
    }
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RecordedExchange {
    pub question: Question,
    pub answer: Answer,
}

/// Wraps another interviewer, appending every `{question, answer}` pair to
/// an in-memory log for later inspection (tests, audit trails).
pub struct RecordingInterviewer {
    inner: std::sync::Arc<dyn Interviewer>,
    log: Mutex<Vec<RecordedExchange>>,
}

impl RecordingInterviewer {
    pub fn new(inner: std::sync::Arc<dyn Interviewer>) -> Self {
        Self { inner, log: Mutex::new(Vec::new()) }
    }

    pub fn exchanges(&self) -> Vec<RecordedExchange> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Interviewer for RecordingInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let answer = self.inner.ask(question).await?;
        self.log.lock().unwrap().push(RecordedExchange {
            question: question.clone(),
            answer: answer.clone(),
        });
        Ok(answer)
    }

    async fn inform(&self, message: &str, stage: &str) {
        self.inner.inform(message, stage).await;
    }
}

// ---------------------------------------------------------------------------
// Remote/web
// ---------------------------------------------------------------------------

struct PendingQuestion {
    id: String,
    question: Question,
}

/// Exposes a single pending question by opaque ID for a remote/web client
/// to fetch and answer; `inform` events fan out to registered listeners.
pub struct RemoteInterviewer {
    pending: Mutex<Option<PendingQuestion>>,
    answered: tokio::sync::Mutex<HashMap<String, tokio::sync::oneshot::Sender<Answer>>>,
    next_id: std::sync::atomic::AtomicU64,
    listeners: Mutex<Vec<std::sync::Arc<dyn Fn(&str, &str) + Send + Sync>>>,
}

impl Default for RemoteInterviewer {
    fn default() -> Self {
        Self {
            pending: Mutex::new(None),
            answered: tokio::sync::Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl RemoteInterviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_listener(&self, listener: std::sync::Arc<dyn Fn(&str, &str) + Send + Sync>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Fetch the currently pending question, if any, along with its ID.
    pub fn pending_question(&self) -> Option<(String, Question)> {
        self.pending.lock().unwrap().as_ref().map(|p| (p.id.clone(), p.question.clone()))
    }

    /// Submit an answer for the pending question matching `id`. Returns
    /// `false` if there was no such pending question.
    pub async fn submit_answer(&self, id: &str, answer: Answer) -> bool {
        let sender = self.answered.lock().await.remove(id);
        if let Some(sender) = sender {
            {
                let mut pending = self.pending.lock().unwrap();
                if pending.as_ref().map(|p| p.id.as_str()) == Some(id) {
                    *pending = None;
                }
            }
            sender.send(answer).is_ok()
        } else {
            false
        }
    }
}

#[async_trait]
impl Interviewer for RemoteInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            .to_string();
        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            *pending = Some(PendingQuestion { id: id.clone(), question: question.clone() });
        }
        self.answered.lock().await.insert(id.clone(), tx);

        match rx.await {
            Ok(answer) => Ok(answer),
            Err(_) => Ok(Answer::new(ANSWER_SKIPPED)),
        }
    }

    async fn inform(&self, message: &str, stage: &str) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener(message, stage);
        }
    }
}
