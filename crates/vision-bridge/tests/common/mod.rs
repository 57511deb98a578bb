//! Shared test harness: an in-process fake host and a scripted WS client.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use vision_bridge::host::{
    HostProvider, HostTask, ProviderEvent, TaskMessage, TaskMessageEvent, TaskMessageKind,
    TaskOptions,
};
use vision_bridge::protocol::AskResponseKind;
use vision_bridge::util::new_id;
use vision_bridge::{SyncConfig, SyncService};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ── Fake host ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AskCall {
    pub response: AskResponseKind,
    pub text: Option<String>,
    pub images: Option<Vec<String>>,
}

pub struct FakeTask {
    id: String,
    messages: Mutex<Vec<TaskMessage>>,
    events: broadcast::Sender<TaskMessageEvent>,
    pub ask_calls: Mutex<Vec<AskCall>>,
}

impl FakeTask {
    pub fn new(id: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            id: id.to_string(),
            messages: Mutex::new(Vec::new()),
            events,
            ask_calls: Mutex::new(Vec::new()),
        })
    }

    /// Append to the log without emitting an event (pre-existing history).
    pub fn seed(&self, message: TaskMessage) {
        self.messages.lock().expect("messages lock").push(message);
    }

    pub fn emit_created(&self, message: TaskMessage) {
        self.upsert(&message);
        let _ = self.events.send(TaskMessageEvent::Created(message));
    }

    pub fn emit_updated(&self, message: TaskMessage) {
        self.upsert(&message);
        let _ = self.events.send(TaskMessageEvent::Updated(message));
    }

    fn upsert(&self, message: &TaskMessage) {
        let mut log = self.messages.lock().expect("messages lock");
        match log
            .iter_mut()
            .find(|m| m.id.is_some() && m.id == message.id)
        {
            Some(existing) => *existing = message.clone(),
            None => log.push(message.clone()),
        }
    }

    pub fn ask_calls(&self) -> Vec<AskCall> {
        self.ask_calls.lock().expect("ask lock").clone()
    }
}

#[async_trait]
impl HostTask for FakeTask {
    fn task_id(&self) -> String {
        self.id.clone()
    }

    fn messages(&self) -> Vec<TaskMessage> {
        self.messages.lock().expect("messages lock").clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskMessageEvent> {
        self.events.subscribe()
    }

    async fn handle_ask_response(
        &self,
        response: AskResponseKind,
        text: Option<String>,
        images: Option<Vec<String>>,
    ) -> anyhow::Result<()> {
        self.ask_calls.lock().expect("ask lock").push(AskCall {
            response,
            text,
            images,
        });
        Ok(())
    }
}

pub struct FakeProvider {
    events: broadcast::Sender<ProviderEvent>,
    current: Mutex<Option<Arc<FakeTask>>>,
    pub create_calls: Mutex<Vec<(String, Vec<String>)>>,
    pub webview_posts: Mutex<Vec<Value>>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            events,
            current: Mutex::new(None),
            create_calls: Mutex::new(Vec::new()),
            webview_posts: Mutex::new(Vec::new()),
        })
    }

    pub fn with_current(task: Arc<FakeTask>) -> Arc<Self> {
        let provider = Self::new();
        provider.set_current(task);
        provider
    }

    pub fn set_current(&self, task: Arc<FakeTask>) {
        *self.current.lock().expect("current lock") = Some(task);
    }

    pub fn current(&self) -> Option<Arc<FakeTask>> {
        self.current.lock().expect("current lock").clone()
    }

    pub fn destroy_task(&self, task_id: &str) {
        let _ = self
            .events
            .send(ProviderEvent::TaskDestroyed(task_id.to_string()));
    }

    pub fn create_calls(&self) -> Vec<(String, Vec<String>)> {
        self.create_calls.lock().expect("create lock").clone()
    }

    pub fn webview_posts(&self) -> Vec<Value> {
        self.webview_posts.lock().expect("webview lock").clone()
    }
}

#[async_trait]
impl HostProvider for FakeProvider {
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    fn current_task(&self) -> Option<Arc<dyn HostTask>> {
        self.current
            .lock()
            .expect("current lock")
            .clone()
            .map(|t| t as Arc<dyn HostTask>)
    }

    async fn create_task(
        &self,
        text: &str,
        images: Vec<String>,
        _options: TaskOptions,
    ) -> anyhow::Result<Arc<dyn HostTask>> {
        self.create_calls
            .lock()
            .expect("create lock")
            .push((text.to_string(), images));
        let task = FakeTask::new(&new_id());
        self.set_current(task.clone());
        let _ = self.events.send(ProviderEvent::TaskCreated(task.clone()));
        Ok(task)
    }

    async fn post_to_webview(&self, message: Value) -> anyhow::Result<()> {
        self.webview_posts.lock().expect("webview lock").push(message);
        Ok(())
    }
}

// ── Task message builders ────────────────────────────────────────────────────

pub fn say(ts: u64, id: Option<&str>, text: &str, partial: bool) -> TaskMessage {
    TaskMessage {
        ts,
        id: id.map(str::to_string),
        kind: TaskMessageKind::Say("text".to_string()),
        text: text.to_string(),
        partial,
    }
}

pub fn ask(ts: u64, text: &str) -> TaskMessage {
    TaskMessage {
        ts,
        id: None,
        kind: TaskMessageKind::Ask("followup".to_string()),
        text: text.to_string(),
        partial: false,
    }
}

// ── Service and client plumbing ──────────────────────────────────────────────

pub type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Start a full sync service on ephemeral ports; returns (service, ws port,
/// discovery port).
pub async fn start_service(
    provider: Option<Arc<dyn HostProvider>>,
    max_connections: usize,
) -> (Arc<SyncService>, u16, u16) {
    let config = SyncConfig {
        enabled: true,
        port: 0,
        discovery_port: 0,
        service_name: "RooCode-test".to_string(),
        max_connections,
    };
    let service = SyncService::new(config);
    service.start(provider).await.expect("service start");
    let status = service.status().await;
    (
        service,
        status.websocket_port.expect("ws port"),
        status.discovery_port.expect("discovery port"),
    )
}

pub async fn connect(port: u16) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
        .await
        .expect("ws connect");
    ws
}

pub async fn send_json(ws: &mut WsClient, value: &Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Read text frames until one of the given `type`, skipping everything else.
pub async fn recv_type(ws: &mut WsClient, kind: &str) -> Value {
    let wanted = kind.to_string();
    timeout(RECV_TIMEOUT, async move {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value =
                        serde_json::from_str(text.as_str()).expect("frame is JSON");
                    if value["type"] == wanted.as_str() {
                        return value;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended while waiting for {wanted}: {other:?}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

/// Perform the client handshake and return the `ConnectionAccepted` payload.
pub async fn handshake(ws: &mut WsClient) -> Value {
    send_json(
        ws,
        &serde_json::json!({
            "type": "ClientHandshake",
            "clientType": "visionOS",
            "version": "1.0.0",
            "capabilities": [],
        }),
    )
    .await;
    recv_type(ws, "ConnectionAccepted").await
}
