use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use clap::Parser;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

/// Headroom over the upload limit for multipart framing and text fields.
const BODY_LIMIT_OVERHEAD: usize = 64 * 1024;

const LOCK_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let config_existed = std::path::Path::new(&args.config).exists();
    let config = config::Config::load(&args.config)?;

    if let Some(cli::Command::IssueToken { user_id, username }) = &args.command {
        let token = parley_core::auth::JwtIdentityProvider::new(config.auth.jwt_secret.clone())
            .issue(*user_id, username, config.auth.jwt_expiry_seconds)?;
        println!("{token}");
        return Ok(());
    }

    init_tracing(&config.logging);
    if !config_existed {
        tracing::info!("Generated default config at '{}'", args.config);
    }

    ensure_data_dirs(&config);

    let db = parley_db::create_pool(&config.database.url, config.database.max_connections).await?;
    parley_db::run_migrations(&db).await?;

    let state = parley_core::AppState::new(db, config.app_config());
    spawn_lock_pruner(state.threads.clone());

    let body_limit = usize::try_from(config.media.max_upload_size)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_OVERHEAD);
    let app = parley_api::build_router()
        .merge(parley_ws::gateway_router())
        .nest_service(
            "/media",
            tower_http::services::ServeDir::new(state.media.base_path()),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    print_startup_banner(&config);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Ensure all data directories exist before the server starts.
fn ensure_data_dirs(config: &config::Config) {
    if let Err(e) = std::fs::create_dir_all(&config.media.storage_path) {
        tracing::warn!(
            "Could not create directory '{}': {}",
            config.media.storage_path,
            e
        );
    }

    if let Some(db_path) = config
        .database
        .url
        .strip_prefix("sqlite://")
        .and_then(|s| s.split('?').next())
    {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
    }
}

/// Thread locks are created on demand; drop the ones nobody holds.
fn spawn_lock_pruner(threads: parley_core::thread_store::ThreadStore) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LOCK_PRUNE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let pruned = threads.prune_locks();
            if pruned > 0 {
                tracing::debug!(pruned, "pruned idle thread locks");
            }
        }
    });
}

async fn shutdown_signal(sessions: Arc<Notify>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    println!();
    tracing::info!("Shutting down (ctrl-c)...");
    sessions.notify_waiters();
}

fn print_startup_banner(config: &config::Config) {
    println!();
    println!("  parley");
    println!();
    println!("  Listening:   http://{}", config.server.bind_address);
    println!("  Gateway:     ws://{}/gateway", config.server.bind_address);
    println!("  Database:    {}", config.database.url);
    println!("  Media:       {}", config.media.storage_path);
    println!();
}
