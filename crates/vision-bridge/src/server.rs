//! WebSocket connection server: accept, handshake, heartbeat, routing.
//!
//! Owns the connection registry. Each socket gets a writer task draining an
//! unbounded outbound queue and a read loop that doubles as the heartbeat
//! driver. The server answers handshake, ping and echo itself; everything
//! else is surfaced to the orchestrator through the [`ServerEvent`] pipe.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::{self, ServerInfo, WireBody, WireMessage};
use crate::util::{new_id, now_ms};

pub const SERVER_NAME: &str = "Roo Code";
pub const SERVER_VERSION: &str = "1.0.0";
pub const SERVER_CAPABILITIES: [&str; 3] = ["ai_conversation", "trigger_send", "echo"];

pub const REJECT_AT_CAPACITY: &str = "Server at maximum capacity";
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_CAPACITY: u16 = 1013;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub client_type: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub connected_at: u64,
    pub last_activity: u64,
    pub state: ConnectionState,
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected(ConnectionInfo),
    ClientDisconnected {
        connection_id: String,
        reason: String,
    },
    MessageReceived {
        connection_id: String,
        message: WireMessage,
    },
    MessageSent {
        connection_id: String,
        message: WireMessage,
    },
    Error {
        connection_id: Option<String>,
        detail: String,
    },
}

enum OutboundFrame {
    Message(String),
    Ping,
    Close { code: u16, reason: String },
}

struct ConnectionHandle {
    info: ConnectionInfo,
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

struct ServerState {
    max_connections: usize,
    heartbeat_interval: Duration,
    heartbeat_grace: Duration,
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

pub struct ConnectionServer {
    state: Arc<ServerState>,
    local_addr: SocketAddr,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

/// Identity the server declares in `ConnectionAccepted`.
pub fn server_info() -> ServerInfo {
    ServerInfo {
        name: SERVER_NAME.to_string(),
        version: SERVER_VERSION.to_string(),
        platform: std::env::consts::OS.to_string(),
        capabilities: SERVER_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
    }
}

impl ConnectionServer {
    pub async fn start(
        port: u16,
        max_connections: usize,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> anyhow::Result<Self> {
        Self::start_with_heartbeat(port, max_connections, HEARTBEAT_INTERVAL, HEARTBEAT_GRACE, events)
            .await
    }

    /// Same as [`start`](Self::start) with heartbeat timing overridden;
    /// exists so timeout behavior can be exercised without 35-second waits.
    pub async fn start_with_heartbeat(
        port: u16,
        max_connections: usize,
        heartbeat_interval: Duration,
        heartbeat_grace: Duration,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> anyhow::Result<Self> {
        let state = Arc::new(ServerState {
            max_connections,
            heartbeat_interval,
            heartbeat_grace,
            connections: Mutex::new(HashMap::new()),
            events,
        });
        let app = Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind websocket port {port}"))?;
        let local_addr = listener
            .local_addr()
            .context("websocket listener has no local address")?;
        let serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "websocket server exited");
            }
        });
        info!(port = local_addr.port(), "websocket server listening");
        Ok(Self {
            state,
            local_addr,
            serve_task: Mutex::new(Some(serve_task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Send one message to one connection. `false` when the connection is
    /// gone or its socket already closed.
    pub async fn send_message(&self, connection_id: &str, message: &WireMessage) -> bool {
        send_to(&self.state, connection_id, message).await
    }

    /// Best-effort fan-out to every connected (handshake-complete) session.
    /// Returns the number of successful sends; one slow or dead peer never
    /// blocks the rest.
    pub async fn broadcast(&self, message: &WireMessage) -> usize {
        let targets: Vec<String> = {
            let conns = self.state.connections.lock().await;
            conns
                .values()
                .filter(|h| h.info.state == ConnectionState::Connected)
                .map(|h| h.info.id.clone())
                .collect()
        };
        let mut sent = 0;
        for id in targets {
            if send_to(&self.state, &id, message).await {
                sent += 1;
            } else {
                warn!(connection_id = %id, "broadcast send failed");
            }
        }
        sent
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let conns = self.state.connections.lock().await;
        conns.values().map(|h| h.info.clone()).collect()
    }

    /// All allocated connection records, handshaken or not.
    pub async fn connection_count(&self) -> usize {
        self.state.connections.lock().await.len()
    }

    /// Handshake-complete sessions only.
    pub async fn connected_count(&self) -> usize {
        let conns = self.state.connections.lock().await;
        conns
            .values()
            .filter(|h| h.info.state == ConnectionState::Connected)
            .count()
    }

    /// Stop accepting, close every client with `1000 "Server shutdown"` and
    /// clear the registry.
    pub async fn stop(&self) {
        if let Some(task) = self.serve_task.lock().await.take() {
            task.abort();
        }
        let drained: Vec<ConnectionHandle> = {
            let mut conns = self.state.connections.lock().await;
            conns.drain().map(|(_, h)| h).collect()
        };
        for handle in drained {
            let _ = handle.tx.send(OutboundFrame::Close {
                code: CLOSE_NORMAL,
                reason: "Server shutdown".to_string(),
            });
        }
        info!("websocket server stopped");
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sink, mut stream) = socket.split();
    let id = new_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();

    // Capacity check and record allocation under one lock so concurrent
    // accepts cannot race past the cap.
    {
        let mut conns = state.connections.lock().await;
        if conns.len() >= state.max_connections {
            drop(conns);
            warn!("rejecting connection: server at maximum capacity");
            let reject = WireMessage::connection_rejected(REJECT_AT_CAPACITY);
            if let Ok(text) = protocol::encode(&reject) {
                let _ = sink.send(Message::Text(text.into())).await;
            }
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_CAPACITY,
                    reason: REJECT_AT_CAPACITY.into(),
                })))
                .await;
            return;
        }
        let now = now_ms();
        conns.insert(
            id.clone(),
            ConnectionHandle {
                info: ConnectionInfo {
                    id: id.clone(),
                    client_type: "unknown".to_string(),
                    version: String::new(),
                    capabilities: Vec::new(),
                    connected_at: now,
                    last_activity: now,
                    state: ConnectionState::Connecting,
                },
                tx: tx.clone(),
            },
        );
    }
    debug!(connection_id = %id, "socket accepted");

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Message(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Ping => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let timeout = state.heartbeat_interval + state.heartbeat_grace;
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + state.heartbeat_interval,
        state.heartbeat_interval,
    );
    let mut last_pong = tokio::time::Instant::now();
    let close_reason;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let _ = tx.send(OutboundFrame::Ping);
            }
            // The deadline tracks the last pong, so a silent client is cut
            // off as soon as the grace window lapses, not a full ping
            // interval later.
            _ = tokio::time::sleep_until(last_pong + timeout) => {
                warn!(connection_id = %id, "ping timeout, disconnecting");
                let _ = tx.send(OutboundFrame::Close {
                    code: CLOSE_NORMAL,
                    reason: "Ping timeout".to_string(),
                });
                close_reason = "Ping timeout".to_string();
                break;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(Message::Text(text))) => handle_frame(&state, &id, text.as_str()).await,
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    // axum answers protocol pings itself.
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        debug!(connection_id = %id, "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) => {
                        close_reason = "Client closed connection".to_string();
                        break;
                    }
                    Some(Err(e)) => {
                        close_reason = format!("Socket error: {e}");
                        break;
                    }
                    None => {
                        close_reason = "Socket closed".to_string();
                        break;
                    }
                }
            }
        }
    }

    {
        let mut conns = state.connections.lock().await;
        conns.remove(&id);
    }
    drop(tx);
    let _ = writer.await;
    info!(connection_id = %id, reason = %close_reason, "client disconnected");
    let _ = state.events.send(ServerEvent::ClientDisconnected {
        connection_id: id,
        reason: close_reason,
    });
}

async fn handle_frame(state: &Arc<ServerState>, id: &str, text: &str) {
    let message = match protocol::decode(text) {
        Ok(m) => m,
        Err(e) => {
            // Protocol errors are contained: log, surface, drop the frame.
            warn!(connection_id = %id, error = %e, "dropping invalid frame");
            let _ = state.events.send(ServerEvent::Error {
                connection_id: Some(id.to_string()),
                detail: e.to_string(),
            });
            return;
        }
    };

    {
        let mut conns = state.connections.lock().await;
        if let Some(handle) = conns.get_mut(id) {
            handle.info.last_activity = now_ms();
        }
    }
    let _ = state.events.send(ServerEvent::MessageReceived {
        connection_id: id.to_string(),
        message: message.clone(),
    });

    match &message.body {
        WireBody::ClientHandshake(handshake) => {
            let info = {
                let mut conns = state.connections.lock().await;
                let Some(handle) = conns.get_mut(id) else { return };
                handle.info.state = ConnectionState::Connected;
                handle.info.client_type = handshake.client_type.clone();
                handle.info.version = handshake.version.clone();
                handle.info.capabilities = handshake.capabilities.clone();
                handle.info.clone()
            };
            let accepted = WireMessage::connection_accepted(id, server_info());
            send_to(state, id, &accepted).await;
            info!(connection_id = %id, client_type = %info.client_type, "client connected");
            let _ = state.events.send(ServerEvent::ClientConnected(info));
        }
        WireBody::Ping => {
            send_to(state, id, &WireMessage::pong()).await;
        }
        WireBody::Echo { payload } => {
            send_to(state, id, &WireMessage::echo(payload.message.clone())).await;
        }
        // Everything else belongs to the orchestrator.
        _ => {}
    }
}

async fn send_to(state: &Arc<ServerState>, id: &str, message: &WireMessage) -> bool {
    let text = match protocol::encode(message) {
        Ok(t) => t,
        Err(e) => {
            error!(kind = message.kind(), error = %e, "failed to encode outbound message");
            return false;
        }
    };
    let sent = {
        let conns = state.connections.lock().await;
        conns
            .get(id)
            .map(|h| h.tx.send(OutboundFrame::Message(text)).is_ok())
            .unwrap_or(false)
    };
    if sent && !message.body.is_system() {
        let _ = state.events.send(ServerEvent::MessageSent {
            connection_id: id.to_string(),
            message: message.clone(),
        });
    }
    sent
}
