//! Sync service orchestrator: lifecycle, wiring and the public event surface.
//!
//! Owns the connection server, the discovery endpoint and the AI bridge, and
//! pumps messages between them: bridge-originated outbound messages flow to
//! the connection server, server events flow into dispatch (AI messages to
//! the bridge, everything to the public [`SyncEvent`] stream and the host
//! status push).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::{AiBridge, OutboundMessage};
use crate::config::SyncConfig;
use crate::discovery::DiscoveryServer;
use crate::host::HostProvider;
use crate::network::{self, NetworkInfo};
use crate::protocol::{WireBody, WireMessage};
use crate::server::{ConnectionInfo, ConnectionServer, ServerEvent};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything observable about the service, closed set.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ServiceStarted {
        port: u16,
        discovery_port: u16,
    },
    ServiceStopped,
    ClientConnected(ConnectionInfo),
    ClientDisconnected {
        connection_id: String,
        reason: String,
    },
    MessageReceived {
        connection_id: String,
        kind: &'static str,
    },
    MessageSent {
        connection_id: String,
        kind: &'static str,
    },
    Error {
        connection_id: Option<String>,
        detail: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub running: bool,
    pub config: SyncConfig,
    pub network_info: Option<NetworkInfo>,
    pub connections: Vec<ConnectionInfo>,
    pub connected_clients: usize,
    pub websocket_port: Option<u16>,
    pub discovery_port: Option<u16>,
}

struct Running {
    server: Arc<ConnectionServer>,
    discovery: DiscoveryServer,
    bridge: AiBridge,
    network: NetworkInfo,
    websocket_port: u16,
    discovery_port: u16,
    pumps: Vec<JoinHandle<()>>,
}

pub struct SyncService {
    config: Mutex<SyncConfig>,
    events: broadcast::Sender<SyncEvent>,
    inner: Mutex<Option<Running>>,
}

impl SyncService {
    pub fn new(config: SyncConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config: Mutex::new(config),
            events,
            inner: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Replace the configuration. Takes effect on the next `start()`.
    pub async fn update_config(&self, config: SyncConfig) {
        *self.config.lock().await = config;
    }

    /// Bring the whole service up. Only startup errors escape to the caller;
    /// any partial startup is rolled back before returning.
    pub async fn start(&self, provider: Option<Arc<dyn HostProvider>>) -> anyhow::Result<()> {
        let config = self.config.lock().await.clone();
        if !config.enabled {
            info!("sync service disabled by configuration");
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            bail!("sync service already running");
        }

        let network = network::probe().await;
        info!(
            ip = %network.ip_address,
            interface = %network.interface,
            online = network.online,
            "network probe complete"
        );

        let ws_port = network::find_available_port(config.port)
            .await
            .with_context(|| format!("no free websocket port starting at {}", config.port))?;
        let discovery_port = network::find_available_port(config.discovery_port)
            .await
            .with_context(|| {
                format!("no free discovery port starting at {}", config.discovery_port)
            })?;

        let (server_events_tx, server_events_rx) = mpsc::unbounded_channel();
        let server = Arc::new(
            ConnectionServer::start(ws_port, config.max_connections, server_events_tx).await?,
        );
        let websocket_port = server.port();

        let discovery = match DiscoveryServer::start(
            discovery_port,
            config.service_name.clone(),
            websocket_port,
            network.clone(),
        )
        .await
        {
            Ok(d) => d,
            Err(e) => {
                server.stop().await;
                return Err(e);
            }
        };
        let discovery_port = discovery.port();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let bridge = AiBridge::new(provider.clone(), outbound_tx);
        bridge.start().await;

        let mut pumps = Vec::new();
        pumps.push(spawn_outbound_pump(outbound_rx, server.clone()));
        pumps.push(spawn_event_pump(
            server_events_rx,
            server.clone(),
            bridge.clone(),
            provider,
            self.events.clone(),
        ));
        pumps.push(spawn_cleanup_timer(server.clone(), bridge.clone()));

        info!(websocket_port, discovery_port, "sync service started");
        let _ = self.events.send(SyncEvent::ServiceStarted {
            port: websocket_port,
            discovery_port,
        });
        *inner = Some(Running {
            server,
            discovery,
            bridge,
            network,
            websocket_port,
            discovery_port,
            pumps,
        });
        Ok(())
    }

    /// Idempotent teardown.
    pub async fn stop(&self) {
        let Some(running) = self.inner.lock().await.take() else {
            return;
        };
        for pump in running.pumps {
            pump.abort();
        }
        running.bridge.shutdown().await;
        running.server.stop().await;
        running.discovery.stop().await;
        info!("sync service stopped");
        let _ = self.events.send(SyncEvent::ServiceStopped);
    }

    pub async fn status(&self) -> SyncStatus {
        let config = self.config.lock().await.clone();
        let inner = self.inner.lock().await;
        match inner.as_ref() {
            Some(running) => SyncStatus {
                running: true,
                config,
                network_info: Some(running.network.clone()),
                connections: running.server.connections().await,
                connected_clients: running.server.connected_count().await,
                websocket_port: Some(running.websocket_port),
                discovery_port: Some(running.discovery_port),
            },
            None => SyncStatus {
                running: false,
                config,
                network_info: None,
                connections: Vec::new(),
                connected_clients: 0,
                websocket_port: None,
                discovery_port: None,
            },
        }
    }
}

fn spawn_outbound_pump(
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    server: Arc<ConnectionServer>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(out) = outbound.recv().await {
            if !server.send_message(&out.connection_id, &out.message).await {
                warn!(connection_id = %out.connection_id, "dropping outbound message for closed connection");
            }
        }
    })
}

fn spawn_event_pump(
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    server: Arc<ConnectionServer>,
    bridge: AiBridge,
    provider: Option<Arc<dyn HostProvider>>,
    public: broadcast::Sender<SyncEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::ClientConnected(info) => {
                    let _ = public.send(SyncEvent::ClientConnected(info));
                    push_status(&provider, &server).await;
                }
                ServerEvent::ClientDisconnected {
                    connection_id,
                    reason,
                } => {
                    bridge.remove_client(&connection_id).await;
                    let _ = public.send(SyncEvent::ClientDisconnected {
                        connection_id,
                        reason,
                    });
                    push_status(&provider, &server).await;
                }
                ServerEvent::MessageReceived {
                    connection_id,
                    message,
                } => {
                    let _ = public.send(SyncEvent::MessageReceived {
                        connection_id: connection_id.clone(),
                        kind: message.kind(),
                    });
                    dispatch(&bridge, &server, &connection_id, message).await;
                }
                ServerEvent::MessageSent {
                    connection_id,
                    message,
                } => {
                    let _ = public.send(SyncEvent::MessageSent {
                        connection_id,
                        kind: message.kind(),
                    });
                }
                ServerEvent::Error {
                    connection_id,
                    detail,
                } => {
                    let _ = public.send(SyncEvent::Error {
                        connection_id,
                        detail,
                    });
                }
            }
        }
    })
}

fn spawn_cleanup_timer(server: Arc<ConnectionServer>, bridge: AiBridge) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
        tick.tick().await; // immediate first tick is a no-op
        loop {
            tick.tick().await;
            let live: Vec<String> = server
                .connections()
                .await
                .into_iter()
                .map(|c| c.id)
                .collect();
            bridge.cleanup_stale_clients(&live).await;
        }
    })
}

/// Route an AI-typed inbound message to the bridge and deliver the returned
/// acknowledgment to the originating connection.
async fn dispatch(
    bridge: &AiBridge,
    server: &Arc<ConnectionServer>,
    connection_id: &str,
    message: WireMessage,
) {
    let session_id = match &message.body {
        WireBody::AiConversation(c) => c.payload.session_id.clone(),
        WireBody::AskResponse { payload } => payload.session_id.clone(),
        WireBody::TriggerSend { payload } => payload.session_id.clone(),
        _ => return,
    };
    bridge.register_client(connection_id, &session_id).await;

    let response = match &message.body {
        WireBody::AiConversation(conversation) => {
            bridge
                .handle_conversation(connection_id, conversation, &message.id)
                .await
        }
        WireBody::AskResponse { payload } => {
            Some(bridge.handle_ask_response(payload, &message.id).await)
        }
        WireBody::TriggerSend { payload } => {
            Some(bridge.handle_trigger(payload, &message.id).await)
        }
        _ => None,
    };
    if let Some(response) = response {
        if !server.send_message(connection_id, &response).await {
            warn!(connection_id = %connection_id, "failed to deliver acknowledgment");
        }
    }
}

/// Keep the host UI honest without polling: every connect/disconnect pushes
/// the current connection list.
async fn push_status(provider: &Option<Arc<dyn HostProvider>>, server: &Arc<ConnectionServer>) {
    let Some(provider) = provider else { return };
    let connections = server.connections().await;
    let connected = connections
        .iter()
        .filter(|c| c.state == crate::server::ConnectionState::Connected)
        .count();
    let status = json!({
        "type": "visionSyncStatus",
        "connections": connections,
        "connectedClients": connected,
    });
    if let Err(e) = provider.post_to_webview(status).await {
        warn!(error = %e, "status push to host failed");
    }
}
