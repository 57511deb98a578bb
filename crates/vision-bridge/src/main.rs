use clap::Parser;
use tracing::info;
use tracing_subscriber::prelude::*;

use vision_bridge::{SyncConfig, SyncService};

#[derive(Parser, Debug, Clone)]
#[command(name = "vision-bridge", about = "LAN sync bridge for Roo Code AI sessions", version)]
struct Opts {
    /// Preferred WebSocket port (scanned upward if busy)
    #[arg(long, env = "VISION_BRIDGE_PORT", default_value_t = 8765)]
    port: u16,

    /// Preferred HTTP discovery port (scanned upward if busy)
    #[arg(long, env = "VISION_BRIDGE_DISCOVERY_PORT", default_value_t = 8766)]
    discovery_port: u16,

    /// Name advertised in the /discover response
    #[arg(long, env = "VISION_BRIDGE_SERVICE_NAME")]
    service_name: Option<String>,

    /// Hard cap on simultaneous connected sessions
    #[arg(long, env = "VISION_BRIDGE_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: usize,

    /// Parse options and exit without binding any port
    #[arg(long, env = "VISION_BRIDGE_DISABLED")]
    disabled: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let opts = Opts::parse();

    let config = SyncConfig {
        enabled: !opts.disabled,
        port: opts.port,
        discovery_port: opts.discovery_port,
        service_name: opts
            .service_name
            .unwrap_or_else(|| SyncConfig::default().service_name),
        max_connections: opts.max_connections,
    };

    // Standalone mode: no host provider attached. Discovery, handshake, echo
    // and heartbeat all work; AI commands get error acknowledgments.
    let service = SyncService::new(config);
    service.start(None).await?;

    let status = service.status().await;
    info!(
        websocket_port = ?status.websocket_port,
        discovery_port = ?status.discovery_port,
        "vision-bridge running, ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    service.stop().await;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .try_init();
}
