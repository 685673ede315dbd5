//! Server lifecycle management
//!
//! Serves the signaling WebSocket plus health and stats endpoints, and exits
//! the process when the media worker dies.

use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use roomrelay_sfu::{Relay, RelayStats};

use crate::config::Config;
use crate::ws;

/// Shared state of every HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub max_message_size: usize,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::websocket_handler))
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn stats(State(state): State<AppState>) -> Json<RelayStats> {
    Json(state.relay.stats())
}

pub struct RelayServer {
    config: Config,
    relay: Arc<Relay>,
}

impl RelayServer {
    pub const fn new(config: Config, relay: Arc<Relay>) -> Self {
        Self { config, relay }
    }

    /// Serve until a shutdown signal arrives
    pub async fn start(self) -> anyhow::Result<()> {
        let address = self.config.http_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {address}: {e}"))?;
        info!(address = %address, engine = self.relay.workers().engine_name(), "Signaling server listening");

        self.spawn_worker_death_watch();

        let app = create_router(AppState {
            relay: Arc::clone(&self.relay),
            max_message_size: self.config.server.max_message_size,
        });
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        let stats = self.relay.stats();
        info!(rooms = stats.rooms, peers = stats.peers, "Signaling server shut down gracefully");
        Ok(())
    }

    /// Worker death is unrecoverable: log, wait the grace period, exit with status 1
    fn spawn_worker_death_watch(&self) {
        let mut death = self.relay.workers().subscribe_death();
        let grace = Duration::from_secs(self.config.worker_death_grace_secs);

        tokio::spawn(async move {
            let Ok(reason) = death
                .wait_for(Option::is_some)
                .await
                .map(|reason| (*reason).clone().unwrap_or_default())
            else {
                return;
            };
            error!(
                reason = %reason,
                grace_secs = grace.as_secs(),
                "Media worker died, exiting"
            );
            tokio::time::sleep(grace).await;
            std::process::exit(1);
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
