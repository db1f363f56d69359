//! `footfall serve`

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use footfall_config::Settings;
use footfall_query::AppState;

use crate::cli::error::HelpfulError;

#[derive(Debug, Clone)]
pub struct ServeArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub reload: bool,
}

pub fn run(settings: Settings, args: ServeArgs) -> Result<()> {
    let host = args.host.unwrap_or_else(|| settings.api_host.clone());
    let port = args.port.unwrap_or(settings.api_port);
    let addr = format!("{}:{}", host, port);

    if args.reload {
        info!("--reload has no effect; restart the process to pick up changes");
    }
    if settings.internal_api_token.is_none() {
        warn!(
            "INTERNAL_API_TOKEN is not set; {} will reject every call",
            footfall_query::CLEAR_CACHE_PATH
        );
    }
    if !settings.duckdb_path().exists() {
        warn!(
            "Analytical store {} does not exist yet; run `footfall run-etl` first",
            settings.duckdb_path().display()
        );
    }

    let state = AppState::from_settings(&settings);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    rt.block_on(serve_until_shutdown(&addr, state))
}

async fn serve_until_shutdown(addr: &str, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| HelpfulError::bind_failed(addr, e))?;
    footfall_query::serve(listener, state, shutdown_signal())
        .await
        .context("Query service stopped with an error")?;
    info!("Query service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
