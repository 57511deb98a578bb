//! Adapter between host task events and the wire protocol.
//!
//! Host-to-wire: every task message (created or updated) is converted to an
//! `AIConversation` and emitted once per registered client on the outbound
//! pipe. Wire-to-host: user conversation messages create or continue the
//! current task, ask responses answer the pending prompt, trigger messages
//! press the host's send/cancel buttons. Host failures never propagate past
//! this module; they become per-client error acknowledgments.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::host::{
    self, HostProvider, HostTask, ProviderEvent, TaskMessage, TaskMessageKind, TaskOptions,
};
use crate::protocol::{
    AskPayload, AskResponseKind, Conversation, ConversationPayload, Role, TriggerAction,
    TriggerPayload, WireBody, WireMessage,
};
use crate::util::{new_id, now_ms};

/// Session id used on outbound messages until a client declares one.
pub const FALLBACK_SESSION_ID: &str = "current-session";

/// A converted message addressed to a single connection; the orchestrator
/// forwards it through the connection server.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub connection_id: String,
    pub message: WireMessage,
}

/// Bridge-side view of a connection that has sent at least one AI message.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    pub connection_id: String,
    pub session_id: Option<String>,
    pub current_task_id: Option<String>,
    pub synced_message_count: usize,
}

struct TaskListener {
    // Held so the task handle outlives its listener.
    _task: Arc<dyn HostTask>,
    listener: JoinHandle<()>,
}

/// Cheap to clone; all state is shared. Spawned listeners carry their own
/// clone, the same way the connection registry is shared with its monitor.
#[derive(Clone)]
pub struct AiBridge {
    provider: Option<Arc<dyn HostProvider>>,
    clients: Arc<Mutex<HashMap<String, BridgeClient>>>,
    task_listeners: Arc<Mutex<HashMap<String, TaskListener>>>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    provider_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AiBridge {
    pub fn new(
        provider: Option<Arc<dyn HostProvider>>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        Self {
            provider,
            clients: Arc::new(Mutex::new(HashMap::new())),
            task_listeners: Arc::new(Mutex::new(HashMap::new())),
            outbound,
            provider_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Attach to the provider: watch the current task and every task created
    /// from now on.
    pub async fn start(&self) {
        let Some(provider) = self.provider.clone() else {
            debug!("bridge running without a host provider");
            return;
        };
        if let Some(task) = provider.current_task() {
            self.watch_task(task).await;
        }
        let bridge = self.clone();
        let mut events = provider.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProviderEvent::TaskCreated(task)) => bridge.watch_task(task).await,
                    Ok(ProviderEvent::TaskDestroyed(task_id)) => bridge.unwatch_task(&task_id).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "provider event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.provider_task.lock().await = Some(handle);
    }

    /// Install a message listener for `task`. Idempotent per task id.
    pub async fn watch_task(&self, task: Arc<dyn HostTask>) {
        let task_id = task.task_id();
        let mut listeners = self.task_listeners.lock().await;
        if listeners.contains_key(&task_id) {
            return;
        }
        let bridge = self.clone();
        let mut events = task.subscribe();
        let listener_task_id = task_id.clone();
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        bridge
                            .relay_task_message(event.message(), &listener_task_id)
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(task_id = %listener_task_id, skipped, "task message stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        debug!(task_id = %task_id, "watching task messages");
        listeners.insert(task_id, TaskListener { _task: task, listener });
    }

    /// Drop the listener for a destroyed task.
    pub async fn unwatch_task(&self, task_id: &str) {
        if let Some(entry) = self.task_listeners.lock().await.remove(task_id) {
            entry.listener.abort();
            debug!(task_id = %task_id, "stopped watching task");
        }
    }

    /// Convert one task message and emit it to every registered client.
    ///
    /// Runs under the clients lock so a registration replay in progress is
    /// never interleaved with live updates for the registering client.
    async fn relay_task_message(&self, message: &TaskMessage, task_id: &str) {
        let clients = self.clients.lock().await;
        if clients.is_empty() {
            return;
        }
        let session_id = preferred_session_id(&clients);
        let Some(wire) = convert_task_message(message, &session_id, Some(task_id)) else {
            return;
        };
        for connection_id in clients.keys() {
            let _ = self.outbound.send(OutboundMessage {
                connection_id: connection_id.clone(),
                message: wire.clone(),
            });
        }
    }

    /// Register a connection on its first AI-typed message. Idempotent; a
    /// fresh registration replays the current task history to that
    /// connection before any live update can reach it.
    pub async fn register_client(&self, connection_id: &str, session_id: &str) -> bool {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get_mut(connection_id) {
            if existing.session_id.is_none() && !session_id.is_empty() {
                existing.session_id = Some(session_id.to_string());
            }
            return false;
        }

        let mut replayed = 0;
        if let Some(task) = self.provider.as_ref().and_then(|p| p.current_task()) {
            let task_id = task.task_id();
            for message in task.messages() {
                if let Some(wire) = convert_task_message(&message, session_id, Some(&task_id)) {
                    let _ = self.outbound.send(OutboundMessage {
                        connection_id: connection_id.to_string(),
                        message: wire,
                    });
                    replayed += 1;
                }
            }
        }
        info!(connection_id = %connection_id, replayed, "registered sync client");
        clients.insert(
            connection_id.to_string(),
            BridgeClient {
                connection_id: connection_id.to_string(),
                session_id: (!session_id.is_empty()).then(|| session_id.to_string()),
                current_task_id: None,
                synced_message_count: replayed,
            },
        );
        true
    }

    pub async fn remove_client(&self, connection_id: &str) {
        if self.clients.lock().await.remove(connection_id).is_some() {
            debug!(connection_id = %connection_id, "removed sync client");
        }
    }

    /// Drop client records whose connection no longer exists.
    pub async fn cleanup_stale_clients(&self, live_connections: &[String]) {
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|id, _| live_connections.iter().any(|live| live == id));
        let dropped = before - clients.len();
        if dropped > 0 {
            info!(dropped, "cleaned up stale sync clients");
        }
    }

    pub async fn clients(&self) -> Vec<BridgeClient> {
        self.clients.lock().await.values().cloned().collect()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// `AIConversation` with `role=user`: continue the task this client is
    /// driving, or start a new one.
    pub async fn handle_conversation(
        &self,
        connection_id: &str,
        conversation: &Conversation,
        inbound_id: &str,
    ) -> Option<WireMessage> {
        let payload = &conversation.payload;
        if payload.role != Role::User {
            debug!(role = ?payload.role, "ignoring non-user conversation message");
            return None;
        }
        let session_id = payload.session_id.as_str();
        let Some(provider) = self.provider.clone() else {
            return Some(error_ack(session_id, inbound_id, "no host provider available"));
        };

        let client_task_id = {
            self.clients
                .lock()
                .await
                .get(connection_id)
                .and_then(|c| c.current_task_id.clone())
        };
        if let Some(task) = provider.current_task() {
            if client_task_id.as_deref() == Some(task.task_id().as_str()) {
                let result = task
                    .handle_ask_response(
                        AskResponseKind::MessageResponse,
                        Some(payload.content.clone()),
                        Some(Vec::new()),
                    )
                    .await;
                return Some(match result {
                    Ok(()) => task_ack(
                        session_id,
                        inbound_id,
                        &task.task_id(),
                        "Message sent to current task",
                    ),
                    Err(e) => {
                        error!(error = %e, "failed to forward message to current task");
                        error_ack(session_id, inbound_id, &e.to_string())
                    }
                });
            }
        }

        match provider
            .create_task(&payload.content, Vec::new(), TaskOptions::default())
            .await
        {
            Ok(task) => {
                let task_id = task.task_id();
                {
                    let mut clients = self.clients.lock().await;
                    if let Some(client) = clients.get_mut(connection_id) {
                        client.current_task_id = Some(task_id.clone());
                    }
                }
                // The provider also announces the task; watching here closes
                // the gap between creation and the announcement.
                self.watch_task(task).await;
                info!(task_id = %task_id, connection_id = %connection_id, "task created from remote message");
                Some(task_ack(session_id, inbound_id, &task_id, "Task created"))
            }
            Err(e) => {
                error!(error = %e, "failed to create task");
                Some(error_ack(session_id, inbound_id, &e.to_string()))
            }
        }
    }

    /// `AskResponse`: answer the currently-pending prompt.
    pub async fn handle_ask_response(
        &self,
        payload: &AskPayload,
        inbound_id: &str,
    ) -> WireMessage {
        let session_id = payload.session_id.as_str();
        let result_meta = json!({
            "type": "ask_response_result",
            "success": true,
            "askResponse": payload.ask_response.as_str(),
            "originalMessageId": inbound_id,
        });
        match self.provider.as_ref().and_then(|p| p.current_task()) {
            Some(task) => {
                match task
                    .handle_ask_response(
                        payload.ask_response,
                        payload.text.clone(),
                        payload.images.clone(),
                    )
                    .await
                {
                    Ok(()) => ack(session_id, "Response delivered", result_meta),
                    Err(e) => {
                        error!(error = %e, "ask response failed");
                        error_ack(session_id, inbound_id, &e.to_string())
                    }
                }
            }
            None => {
                warn!("ask response received with no current task");
                ack(session_id, "No task is currently active", result_meta)
            }
        }
    }

    /// `TriggerSend`: press the host's send or cancel button.
    pub async fn handle_trigger(&self, payload: &TriggerPayload, inbound_id: &str) -> WireMessage {
        let session_id = payload.session_id.as_str();
        let (webview_message, meta_type, status) = match payload.action {
            TriggerAction::Send => (host::send_button_message(), "trigger_result", "Send triggered"),
            TriggerAction::Cancel => (
                host::cancel_button_message(),
                "cancel_result",
                "Cancel requested",
            ),
        };
        let Some(provider) = self.provider.as_ref() else {
            return error_ack(session_id, inbound_id, "no host provider available");
        };
        match provider.post_to_webview(webview_message).await {
            Ok(()) => ack(
                session_id,
                status,
                json!({
                    "type": meta_type,
                    "success": true,
                    "originalMessageId": inbound_id,
                }),
            ),
            Err(e) => {
                error!(error = %e, action = ?payload.action, "trigger failed");
                error_ack(session_id, inbound_id, &e.to_string())
            }
        }
    }

    /// Tear down listeners and tables. Best-effort by design; the host emits
    /// no further events for destroyed tasks.
    pub async fn shutdown(&self) {
        if let Some(task) = self.provider_task.lock().await.take() {
            task.abort();
        }
        let mut listeners = self.task_listeners.lock().await;
        for (_, entry) in listeners.drain() {
            entry.listener.abort();
        }
        self.clients.lock().await.clear();
    }
}

/// Any registered client's declared session id will do; first found wins.
fn preferred_session_id(clients: &HashMap<String, BridgeClient>) -> String {
    clients
        .values()
        .find_map(|c| c.session_id.clone())
        .unwrap_or_else(|| FALLBACK_SESSION_ID.to_string())
}

/// Convert one host task message to its wire form. Returns `None` for
/// messages that trim to nothing; those are never broadcast.
pub fn convert_task_message(
    message: &TaskMessage,
    session_id: &str,
    task_id: Option<&str>,
) -> Option<WireMessage> {
    let content = message.text.trim();
    if content.is_empty() {
        return None;
    }

    let (role, original_type) = match &message.kind {
        TaskMessageKind::Ask(_) => (Role::User, "ask"),
        TaskMessageKind::Say(kind) => match kind.as_str() {
            "text" | "completion_result" => (Role::Assistant, "say"),
            "error" | "tool" => (Role::System, "say"),
            _ => (Role::Assistant, "say"),
        },
    };

    let mut metadata = json!({
        "timestamp": message.ts,
        "messageId": message.ts,
        "source": "roo-code",
        "originalType": original_type,
    });
    match &message.kind {
        TaskMessageKind::Ask(kind) => metadata["askType"] = json!(kind),
        TaskMessageKind::Say(kind) => metadata["sayType"] = json!(kind),
    }
    if let Some(tid) = task_id {
        metadata["taskId"] = json!(tid);
    }

    let wire_id = new_id();
    let is_streaming = message.partial;
    // The stable identity clients fold deltas under: the task message's own
    // id when it has one, this wire message's id otherwise.
    let stream_id = message.id.clone().unwrap_or_else(|| wire_id.clone());

    Some(WireMessage {
        body: WireBody::AiConversation(Conversation {
            payload: ConversationPayload {
                session_id: session_id.to_string(),
                role,
                content: content.to_string(),
                metadata: Some(metadata),
                partial: is_streaming.then_some(true),
            },
            is_streaming: Some(is_streaming),
            is_final: Some(!is_streaming),
            stream_id: Some(stream_id),
            chunk_index: Some(0),
        }),
        timestamp: now_ms(),
        id: wire_id,
    })
}

fn ack(session_id: &str, content: &str, metadata: Value) -> WireMessage {
    WireMessage::new(WireBody::AiConversation(Conversation {
        payload: ConversationPayload {
            session_id: session_id.to_string(),
            role: Role::Assistant,
            content: content.to_string(),
            metadata: Some(metadata),
            partial: None,
        },
        is_streaming: None,
        is_final: None,
        stream_id: None,
        chunk_index: None,
    }))
}

fn task_ack(session_id: &str, inbound_id: &str, task_id: &str, status: &str) -> WireMessage {
    ack(
        session_id,
        status,
        json!({
            "type": "task_created",
            "taskId": task_id,
            "originalMessageId": inbound_id,
        }),
    )
}

fn error_ack(session_id: &str, inbound_id: &str, detail: &str) -> WireMessage {
    ack(
        session_id,
        &format!("Error: {detail}"),
        json!({
            "type": "error",
            "originalMessageId": inbound_id,
        }),
    )
}
