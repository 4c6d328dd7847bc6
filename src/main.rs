use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use voicebridge::core::{AriClient, Orchestrator, TranscriptMailer};
use voicebridge::handlers::api::HealthState;
use voicebridge::routes;
use voicebridge::{BridgeConfig, ChannelControl};

/// Voice bridge between an Asterisk ARI application and a realtime
/// conversational AI endpoint
#[derive(Parser, Debug)]
#[command(name = "voicebridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to an env-format configuration file (defaults to ./.env)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load the configuration bundle before anything reads the environment.
    match &cli.config {
        Some(path) => {
            dotenvy::from_path(path)
                .map_err(|e| anyhow!("cannot load config file {}: {e}", path.display()))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    // LOG_LEVEL drives the default filter; RUST_LOG still wins when set.
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("voicebridge={log_level}"))),
        )
        .init();

    let config = Arc::new(BridgeConfig::from_env()?);
    info!(app = %config.ari_app, "starting voice bridge");

    let mailer = match &config.email {
        Some(settings) => Some(TranscriptMailer::new(settings)?),
        None => None,
    };

    let ari = Arc::new(AriClient::new(&config)?);
    let control: Arc<dyn ChannelControl> = ari.clone();
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), control, mailer));

    // Health probe (optional).
    if config.health_port > 0 {
        let state = Arc::new(HealthState::new(ari.connected_flag()));
        let router = routes::api::create_health_router().with_state(state);
        let addr: SocketAddr = ([0, 0, 0, 0], config.health_port).into();
        tokio::spawn(async move {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(%addr, "health endpoint listening");
                    if let Err(e) = axum::serve(listener, router).await {
                        error!("health endpoint failed: {e}");
                    }
                }
                Err(e) => error!(%addr, "cannot bind health endpoint: {e}"),
            }
        });
    }

    // PBX event stream feeding the orchestrator.
    let (event_tx, event_rx) = mpsc::channel(64);
    let event_loop = {
        let ari = ari.clone();
        tokio::spawn(async move { ari.run_events(event_tx).await })
    };
    let dispatcher = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(event_rx).await })
    };

    shutdown_signal().await;
    info!("shutdown signal received");

    event_loop.abort();
    dispatcher.abort();
    if tokio::time::timeout(config.shutdown_timeout, orchestrator.shutdown())
        .await
        .is_err()
    {
        warn!("shutdown grace elapsed, exiting with calls possibly unclean");
        std::process::exit(1);
    }

    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
