//! Bulk archive installer server.

use anyhow::Result;
use axum::serve;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use box_installer::api::{self, AppState};
use box_installer_core::config::InstallConfig;
use box_installer_core::events::EventBus;
use box_installer_core::installer::Installer;
use box_installer_core::progress::{MemoryProgressCache, ProgressCache, RedisProgressCache};
use box_installer_core::storage::{Backend, MemoryStore};

#[derive(Parser)]
#[command(name = "box-installer")]
#[command(about = "Installs bulk archives into boxes")]
struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:3000")]
    addr: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Redis URL for the shared progress cache (default: $REDIS_URL, else in-process)
    #[arg(long)]
    redis_url: Option<String>,

    /// Cells to create at startup
    #[arg(long = "cell", default_value = "default")]
    cells: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let redis_url = cli.redis_url.clone().or_else(|| std::env::var("REDIS_URL").ok());
    let config = match &cli.config {
        Some(path) => InstallConfig::load(path)?,
        None => InstallConfig::default(),
    };
    std::fs::create_dir_all(&config.temp_dir)?;

    let cache: Arc<dyn ProgressCache> = match &redis_url {
        Some(url) => Arc::new(RedisProgressCache::new(url, config.progress_ttl_secs)?),
        None => {
            let memory = Arc::new(MemoryProgressCache::new(Duration::from_secs(
                config.progress_ttl_secs,
            )));
            let purger = memory.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(60));
                loop {
                    tick.tick().await;
                    let purged = purger.purge_expired();
                    if purged > 0 {
                        debug!(purged, "dropped expired progress records");
                    }
                }
            });
            memory
        }
    };

    let store = Arc::new(MemoryStore::new());
    for cell in &cli.cells {
        store.create_cell(cell);
    }
    let backend: Arc<dyn Backend> = store.clone();

    let events = EventBus::new();
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => debug!(?event, "install event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let installer = Installer::new(backend, cache.clone(), config);
    let state = AppState::new(store, installer, cache, events);
    let app = api::router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&cli.addr).await?;
    info!("Listening on {}", cli.addr);
    serve(listener, app.into_make_service()).await?;
    Ok(())
}
