//! Seam between the bridge and the host editor's AI task engine.
//!
//! The host side is modeled as two traits with typed broadcast subscriptions
//! instead of a string-keyed event emitter. Dropping a receiver unsubscribes;
//! the bridge keeps the listener task handle per task so teardown can abort
//! it explicitly.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::AskResponseKind;

/// One message in a task's ordered log.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage {
    /// Millisecond timestamp assigned by the host; doubles as the logical
    /// message identity when `id` is absent.
    pub ts: u64,
    pub id: Option<String>,
    pub kind: TaskMessageKind,
    pub text: String,
    /// Streaming chunk superseded by a later update with the same identity.
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskMessageKind {
    /// A prompt from the engine waiting for a user answer.
    Ask(String),
    /// Any non-blocking utterance (`text`, `tool`, `error`, ...).
    Say(String),
}

#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// `None` means unbounded: the remote client is a trusted driver whose
    /// session must not be cut short by the anti-runaway heuristic.
    pub consecutive_mistake_limit: Option<u64>,
}

#[derive(Clone)]
pub enum ProviderEvent {
    TaskCreated(Arc<dyn HostTask>),
    TaskDestroyed(String),
}

#[derive(Debug, Clone)]
pub enum TaskMessageEvent {
    Created(TaskMessage),
    Updated(TaskMessage),
}

impl TaskMessageEvent {
    pub fn message(&self) -> &TaskMessage {
        match self {
            Self::Created(m) | Self::Updated(m) => m,
        }
    }
}

/// Handle onto the host editor's task engine.
#[async_trait]
pub trait HostProvider: Send + Sync {
    /// Task lifecycle events (created / destroyed).
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;

    fn current_task(&self) -> Option<Arc<dyn HostTask>>;

    /// Start a new task seeded with `text` and `images`.
    async fn create_task(
        &self,
        text: &str,
        images: Vec<String>,
        options: TaskOptions,
    ) -> anyhow::Result<Arc<dyn HostTask>>;

    /// Post a message to the host webview. Used for the trigger/cancel
    /// button presses and for the connection-status push.
    async fn post_to_webview(&self, message: Value) -> anyhow::Result<()>;
}

/// A single conversation session inside the host's AI engine.
#[async_trait]
pub trait HostTask: Send + Sync {
    fn task_id(&self) -> String;

    /// Ordered snapshot of the task's message log.
    fn messages(&self) -> Vec<TaskMessage>;

    /// Message stream (created / updated).
    fn subscribe(&self) -> broadcast::Receiver<TaskMessageEvent>;

    /// Answer the currently-pending prompt.
    async fn handle_ask_response(
        &self,
        response: AskResponseKind,
        text: Option<String>,
        images: Option<Vec<String>>,
    ) -> anyhow::Result<()>;
}

/// Webview message requesting the host's default send action.
pub fn send_button_message() -> Value {
    serde_json::json!({ "type": "sendButtonClicked" })
}

/// Webview message requesting cancellation of the current operation.
pub fn cancel_button_message() -> Value {
    serde_json::json!({ "type": "cancelButtonClicked" })
}
