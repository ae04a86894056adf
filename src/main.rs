use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use parley_engine::{create_default_registry, EngineConfig, SessionManager};
use parley_llm::HttpModelBackend;
use parley_server::{RateLimiter, ServerConfig, StaticTokenAuth};
use parley_store::{Database, SqliteBlobStore, SqliteRecordStore};

/// Streaming conversation server.
#[derive(Debug, Parser)]
#[command(name = "parley", version)]
struct Cli {
    /// Settings file (defaults to ~/.parley/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port, overriding settings.
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database path, overriding settings.
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = parley_settings::load_settings(cli.config.as_deref()).context("loading settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(path) = cli.database {
        settings.store.database_path = path.to_string_lossy().into_owned();
    }

    parley_telemetry::init_telemetry(&settings.telemetry).context("initializing telemetry")?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting parley");

    let db = Database::open(Path::new(&settings.store.database_path)).context("opening database")?;
    let records = Arc::new(SqliteRecordStore::new(db.clone()));
    let blobs = Arc::new(SqliteBlobStore::new(db));

    let backend = HttpModelBackend::new(
        settings.model.base_url.clone(),
        settings.model.api_key(),
        settings.model.framing,
        settings.model.connect_timeout(),
    )
    .context("creating model backend")?;
    if settings.model.api_key.is_none() {
        tracing::warn!(endpoint = %settings.model.base_url, "no model api key configured");
    }

    let registry = create_default_registry(&settings.tools, &settings.engine);
    tracing::info!(tools = ?registry.names(), "tool registry ready");

    let manager = Arc::new(SessionManager::new(
        Arc::new(backend),
        Arc::new(registry),
        records,
        blobs,
        EngineConfig::from_settings(&settings),
    ));

    let auth = StaticTokenAuth::from_settings(&settings.auth);
    if auth.is_empty() {
        tracing::warn!("no auth tokens configured; every request will be rejected");
    }
    let limiter = Arc::new(RateLimiter::from_settings(&settings.rate_limit));

    let handle = parley_server::start(
        ServerConfig::from_settings(&settings.server, &settings.engine),
        Arc::clone(&manager),
        Arc::new(auth),
        limiter,
    )
    .await
    .context("starting server")?;
    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    tracing::info!("shutting down");

    manager.close_all();
    handle.shutdown().await;
    Ok(())
}
