use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tare_hub::{
    api::{self, AppState},
    config::{BackendConfig, Config},
    discovery::{Candidate, Discovery, mock::MockDiscovery, run_discovery_consumer},
    feed::{FeedHub, run_feed_loop},
    registry::BoardRegistry,
    transport::{Transport, mock::MockTransport},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "tare-hub")]
#[command(about = "Live mass feed for Wii balance boards")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "tare-hub.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tare_hub=info,tare_core=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    match config.backend.clone() {
        BackendConfig::Mock {
            poll_interval_ms,
            boards,
        } => {
            info!(boards = boards.len(), "Using simulated boards");
            let transport = MockTransport::simulated(boards.iter().map(|b| b.simulated()));
            // a remote that never connects, so the name filter has something to do
            let candidates = boards
                .iter()
                .map(|b| Candidate::board(b.address.as_str()))
                .chain([Candidate::new("00:17:AB:00:00:99", "Nintendo RVL-CNT-01")]);
            let discovery =
                MockDiscovery::new(candidates, Duration::from_millis(poll_interval_ms));
            run_hub(&config, transport, discovery).await?;
        }
        #[cfg(feature = "bluez")]
        BackendConfig::Bluez {
            adapter,
            rescan_interval_ms,
        } => {
            use tare_hub::discovery::bluez::BluezDiscovery;
            use tare_hub::transport::bluez::BluezTransport;

            info!(adapter = ?adapter, "Using BlueZ");
            let discovery = BluezDiscovery::new(adapter, Duration::from_millis(rescan_interval_ms));
            run_hub(&config, BluezTransport::new(), discovery).await?;
        }
        #[cfg(not(feature = "bluez"))]
        BackendConfig::Bluez { .. } => {
            return Err(color_eyre::eyre::eyre!(
                "this build has no BlueZ support, rebuild with --features bluez"
            ));
        }
    }

    Ok(())
}

async fn run_hub<T, D>(config: &Config, transport: T, discovery: D) -> color_eyre::Result<()>
where
    T: Transport,
    D: Discovery,
{
    let cancel = CancellationToken::new();

    let registry = BoardRegistry::new(transport, config.session.settings());
    let feed = Arc::new(FeedHub::new(config.feed.client_buffer, config.feed.max_drops));

    let candidates = discovery.start(cancel.clone()).await?;
    let consumer = tokio::spawn(run_discovery_consumer(
        candidates,
        registry.clone(),
        config.session.reap_interval(),
        cancel.clone(),
    ));
    let broadcaster = tokio::spawn(run_feed_loop(
        registry.clone(),
        Arc::clone(&feed),
        config.feed.period(),
        cancel.clone(),
    ));

    let http_addr = config.server.http_addr;
    let http_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, static_root = ?config.server.static_root, "HTTP server listening");

    let feed_addr = config.server.feed_addr;
    let feed_listener = TcpListener::bind(feed_addr).await?;
    info!(%feed_addr, "Feed server listening");

    let http_app = api::router(
        AppState::new(registry.clone(), Arc::clone(&feed)),
        &config.server.static_root,
    );
    let feed_app = api::feed_router(Arc::clone(&feed));

    let http_cancel = cancel.clone();
    let feed_cancel = cancel.clone();
    tokio::select! {
        result = axum::serve(http_listener, http_app).with_graceful_shutdown(async move {
            http_cancel.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        result = axum::serve(feed_listener, feed_app).with_graceful_shutdown(async move {
            feed_cancel.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "Feed server error");
            }
            info!("Feed server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    cancel.cancel();
    for task in [consumer, broadcaster] {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task failed");
        }
    }
    registry.shutdown().await;

    Ok(())
}
