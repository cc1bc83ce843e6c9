//! Shared-state sync server
//!
//! Stores one Automerge document per shared element, grouped by room, and
//! relays awareness between the connections of a room.
//!
//! # Configuration
//!
//! Environment variables:
//! - `SHAREDSTATE_PORT`: Port to listen on (default: 8080)
//! - `SHAREDSTATE_DATA_DIR`: Directory to store documents (default: ~/.local/share/sharedstate-server)
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint
//! - `GET /sync`: WebSocket sync endpoint

use sharedstate::server::{router, RoomHub, ServerStorage};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// Directory to store Automerge documents
    data_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("SHAREDSTATE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = std::env::var("SHAREDSTATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("sharedstate-server")
            });

        Self { port, data_dir }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sharedstate=info,sharedstate_server=info,sharedstate_core=info,tower_http=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        tracing::error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }
    tracing::info!("Data directory: {}", config.data_dir.display());

    let hub = Arc::new(RoomHub::new(ServerStorage::new(&config.data_dir)));
    let app = router(hub);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
