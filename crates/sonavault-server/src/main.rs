//! The `sonavault` server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sonavault_core::Config;
use sonavault_core::store::MemoryStore;
use sonavault_server::{AppState, build_router, sweeper};

#[derive(Parser, Debug)]
#[command(name = "sonavault", about = "Protected audio streaming server", version)]
struct Args {
    /// Address to bind, overriding BIND_ADDRESS.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    // ROOT_KEY is mandatory; a missing key aborts startup here.
    let config = Config::from_env().context("configuration error")?;
    let bind = args.bind.unwrap_or(config.bind_address);

    tokio::fs::create_dir_all(&config.media_storage_root)
        .await
        .context("creating media storage root")?;
    tokio::fs::create_dir_all(&config.chapter_storage_root)
        .await
        .context("creating chapter storage root")?;

    let state = AppState::new(&config, Arc::new(MemoryStore::new()));
    let sweeper = sweeper::spawn(state.clone());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(address = %listener.local_addr()?, "Sonavault listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    sweeper.abort();
    Ok(())
}
