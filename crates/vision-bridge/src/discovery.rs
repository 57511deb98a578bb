//! HTTP discovery surface: `/discover`, `/health` and an index at `/`.
//!
//! Clients hit `/discover` first to learn the WebSocket URL, so everything
//! here is CORS-open and pretty-printed for humans poking at it with curl.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::network::{self, NetworkInfo};
use crate::util::now_ms;

pub const DISCOVERY_CAPABILITIES: [&str; 4] =
    ["ai_conversation", "trigger_send", "echo", "ping_pong"];

const AVAILABLE_ENDPOINTS: [&str; 3] = ["/discover", "/health", "/"];

struct DiscoveryState {
    service_name: String,
    websocket_port: u16,
    network: NetworkInfo,
    started_at: Instant,
}

pub struct DiscoveryServer {
    local_addr: SocketAddr,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryServer {
    pub async fn start(
        port: u16,
        service_name: String,
        websocket_port: u16,
        network: NetworkInfo,
    ) -> anyhow::Result<Self> {
        let state = Arc::new(DiscoveryState {
            service_name,
            websocket_port,
            network,
            started_at: Instant::now(),
        });
        let app = Router::new()
            .route("/discover", get(discover))
            .route("/health", get(health))
            .route("/", get(index))
            .fallback(not_found)
            .layer(tower_http::cors::CorsLayer::permissive())
            .with_state(state);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind discovery port {port}"))?;
        let local_addr = listener
            .local_addr()
            .context("discovery listener has no local address")?;
        let serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "discovery server exited");
            }
        });
        info!(port = local_addr.port(), "discovery server listening");
        Ok(Self {
            local_addr,
            serve_task: Mutex::new(Some(serve_task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub async fn stop(&self) {
        if let Some(task) = self.serve_task.lock().await.take() {
            task.abort();
        }
        info!("discovery server stopped");
    }
}

/// Responses are pretty-printed on purpose; this surface is for humans and
/// first-contact clients, not hot paths.
fn pretty_json(status: StatusCode, value: &Value) -> Response {
    let body = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

async fn discover(State(state): State<Arc<DiscoveryState>>) -> Response {
    let Some(ip) = state.network.primary_ip() else {
        return pretty_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({
                "error": "Network unavailable",
                "message": "could not determine a primary LAN address",
            }),
        );
    };
    pretty_json(
        StatusCode::OK,
        &json!({
            "name": state.service_name,
            "websocket_url": network::websocket_url(ip, state.websocket_port),
            "version": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
            "app": "Roo Code",
            "capabilities": DISCOVERY_CAPABILITIES,
        }),
    )
}

async fn health(State(state): State<Arc<DiscoveryState>>) -> Response {
    pretty_json(
        StatusCode::OK,
        &json!({
            "status": "healthy",
            "timestamp": now_ms(),
            "service": state.service_name,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

async fn index(State(state): State<Arc<DiscoveryState>>) -> Response {
    pretty_json(
        StatusCode::OK,
        &json!({
            "service": state.service_name,
            "endpoints": AVAILABLE_ENDPOINTS,
            "websocket_port": state.websocket_port,
        }),
    )
}

async fn not_found(uri: Uri) -> Response {
    pretty_json(
        StatusCode::NOT_FOUND,
        &json!({
            "error": "Not found",
            "path": uri.path(),
            "available_endpoints": AVAILABLE_ENDPOINTS,
        }),
    )
}
