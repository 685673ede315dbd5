mod config;
mod logging;
mod server;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use roomrelay_sfu::{LocalEngine, MediaEngine, Relay};

use config::{load_config, Config, EngineKind, MediaConfig};
use server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "roomrelay")]
#[command(about = "RoomRelay SFU signaling server", long_about = None)]
struct Args {
    /// Config file (YAML, TOML or JSON)
    #[arg(short, long, env = "ROOMRELAY_CONFIG_PATH")]
    config: Option<String>,
}

fn build_engine(media: &MediaConfig) -> Result<Arc<dyn MediaEngine>> {
    match media.engine {
        EngineKind::Local => Ok(Arc::new(LocalEngine::new())),
        #[cfg(feature = "mediasoup")]
        EngineKind::Mediasoup => Ok(Arc::new(roomrelay_sfu::MediasoupEngine::new())),
        #[cfg(not(feature = "mediasoup"))]
        EngineKind::Mediasoup => Err(anyhow::anyhow!(
            "media.engine is 'mediasoup' but this binary was built without the `mediasoup` feature"
        )),
    }
}

/// The media worker is started by the first room, not here
fn build_relay(config: &Config, engine: Arc<dyn MediaEngine>) -> Arc<Relay> {
    Relay::new(engine, config.worker_settings(), config.sfu_config())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "RoomRelay starting...");

    // 3. Media engine
    let engine = build_engine(&config.media)?;
    let relay = build_relay(&config, engine);

    // 4. Serve until shutdown
    RelayServer::new(config, relay).start().await
}
