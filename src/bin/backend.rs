#![forbid(unsafe_code)]

//! YouGen HTTP backend.
//!
//! Wires yt-dlp, the caption host and the LLM behind the service layer and
//! serves the JSON API plus the progress WebSocket until Ctrl+C.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use yougen::api::{AppState, Providers, router};
use yougen::config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config};
use yougen::llm::GroqClient;
use yougen::logging::init_logging;
use yougen::progress::ProgressChannel;
use yougen::store::Store;
use yougen::ytdlp::YtDlp;

#[derive(Parser, Debug, Clone)]
#[command(name = "yougen-backend")]
#[command(about = "Video notes, chat and batch downloads over HTTP", long_about = None)]
struct BackendArgs {
    /// Directory holding the database and downloaded media
    #[arg(long)]
    media_root: Option<PathBuf>,

    /// Listen address (IPv4 or IPv6)
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Alternative .env file
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            media_root: self.media_root,
            port: self.port,
            host: self.host,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/YOUGEN_HOST")
}

async fn build_state(config: &RuntimeConfig) -> Result<AppState> {
    let downloads_dir = config.downloads_dir();
    std::fs::create_dir_all(&downloads_dir)
        .with_context(|| format!("creating {}", downloads_dir.display()))?;

    let store = Store::open(&config.database_path())
        .await
        .context("initializing database")?;

    let ytdlp = Arc::new(YtDlp::new(
        config.ytdlp_bin.clone(),
        downloads_dir.clone(),
        config.timeouts.metadata,
        config.timeouts.fetch,
    ));
    if config.llm.api_key.is_none() {
        warn!("GROQ_API_KEY is not set; chat requests will fail");
    }
    let providers = Providers {
        metadata: ytdlp.clone(),
        transcripts: ytdlp.clone(),
        fetcher: ytdlp,
        llm: Arc::new(GroqClient::new(&config.llm, config.timeouts.llm)),
    };

    Ok(AppState::new(
        store,
        providers,
        ProgressChannel::new(config.progress_queue_capacity),
        downloads_dir,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = resolve_runtime_config(BackendArgs::parse().into_overrides())?;
    init_logging(config.log_format);

    let host = parse_host_arg(&config.host)?;
    let state = build_state(&config).await?;
    let app = router(state);

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        media_root = %config.media_root.display(),
        ytdlp = %config.ytdlp_bin.display(),
        "API server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}
