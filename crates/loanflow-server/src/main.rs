use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use loanflow_core::AppConfig;
use loanflow_server::{AppState, build_router, telemetry};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

#[derive(Parser, Debug)]
#[command(name = "loanflow-server", version, about = "Conversational loan application backend")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "LOANFLOW_CONFIG", default_value = "loanflow.yaml")]
    config: PathBuf,

    /// Override `server.bind`.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    telemetry::init(&config.logging);

    let pool = if config.needs_sqlite() {
        Some(open_pool(&config).await?)
    } else {
        None
    };

    let bind = config.server.bind.clone();
    let (state, outbox_worker) = AppState::from_config(config, pool)
        .await
        .context("Failed to initialise services")?;

    let pruner = state
        .config()
        .rate_limit
        .enabled
        .then(|| spawn_pruner(state.clone()));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!("loanflow-server listening on {}", bind);

    let app = build_router(state.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(pruner) = pruner {
        pruner.abort();
    }
    tracing::info!(pending = state.outbox().in_flight(), "Draining audit outbox");
    state.outbox().flush().await;
    outbox_worker.abort();

    Ok(())
}

async fn open_pool(config: &AppConfig) -> Result<SqlitePool> {
    let path = Path::new(&config.storage.sqlite_path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let url = config.storage.sqlite_url();
    let mut options = SqlitePoolOptions::new();
    if config.storage.sqlite_path == ":memory:" {
        // Each in-memory connection is a separate database.
        options = options.max_connections(1);
    }
    options
        .connect(&url)
        .await
        .with_context(|| format!("Failed to open SQLite database at {}", url))
}

/// Periodically drop rate-limit hits that have left the window.
fn spawn_pruner(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.limiter().window());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.limiter().prune().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Pruned rate limit hits"),
                Err(err) => tracing::warn!("Rate limit pruning failed: {}", err),
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
