use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, anyhow};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ws_tts_gateway::routes::build_router;
use ws_tts_gateway::{AppState, GatewayConfig, create_engine};

/// How often expired orphans are swept out of the registry.
const REAPER_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Real-time TTS streaming gateway
#[derive(Parser, Debug)]
#[command(name = "ws-tts-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to an env-format configuration file (loaded before WS_TTS_*
    /// variables are read)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env (or the explicit file) before config resolution.
    match &cli.config {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("loading config file {}", path.display()))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::from_env();
    let engine = create_engine(&config.engine).map_err(|e| anyhow!(e.to_string()))?;
    info!(
        engine = engine.name(),
        native_sample_rate = ?engine.native_sample_rate(),
        "engine ready"
    );

    let address = config.address();
    let state = AppState::new(config, engine);
    let _reaper = state.registry.spawn_reaper(REAPER_INTERVAL);

    let app = build_router(state);

    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("invalid server address '{address}': {e}"))?;
    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("binding {socket_addr}"))?;
    info!("listening on http://{socket_addr}");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
