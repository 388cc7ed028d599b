use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use palaver::config::Config;
use palaver::dispatch::registry::Registry;
use palaver::relay::{Multiplexer, Stores};
use palaver::store::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env from the binary's directory first, then fall back to the CWD search.
    let beside_binary = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
        .filter(|path| path.exists());
    match beside_binary {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing::info!("palaver starting");

    let config = Config::load()?;
    let registry = Registry::from_config(&config)?;
    let stores = open_stores(&config)?;
    let relay = Multiplexer::new(Arc::new(registry), stores, &config);

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    tracing::info!(addr = %config.server.bind, "listening");

    axum::serve(listener, palaver::server::router(relay))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failure")?;

    tracing::info!("palaver shutting down");
    Ok(())
}

#[cfg(feature = "duckdb-store")]
fn open_stores(config: &Config) -> anyhow::Result<Stores> {
    use palaver::store::duckdb::DuckDbStore;

    if let Some(path) = &config.store.duckdb_path {
        let store = DuckDbStore::open(Some(path.clone()))?;
        return Ok(Stores::shared(Arc::new(store)));
    }
    tracing::warn!("no duckdb_path configured, history and accounts are kept in memory");
    Ok(Stores::shared(Arc::new(MemoryStore::new())))
}

#[cfg(not(feature = "duckdb-store"))]
fn open_stores(config: &Config) -> anyhow::Result<Stores> {
    if config.store.duckdb_path.is_some() {
        tracing::warn!("duckdb_path set but built without the duckdb-store feature, ignoring");
    }
    tracing::warn!("history and accounts are kept in memory");
    Ok(Stores::shared(Arc::new(MemoryStore::new())))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
    }
}
