use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

mod cli;

use gemgate_auth::{CallbackListener, ListenerConfig, OAuthEndpoints, TokenManager};
use gemgate_core::{EngineConfig, ProxyEngine, UpstreamClient, UpstreamClientConfig};
use gemgate_project::ProjectResolver;
use gemgate_router::{app_router, AppState};
use gemgate_storage::SqliteStore;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("gemgate failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = Cli::parse().into_patch().into_config()?;
    info!(
        host = %config.host,
        port = config.port,
        db_path = %config.db_path,
        proxy = %config.proxy.as_deref().unwrap_or(""),
        "config loaded"
    );

    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    info!(db_path = %config.db_path, "credential store ready");

    let upstream = UpstreamClient::new(UpstreamClientConfig::from_global(&config))?;
    let endpoints = OAuthEndpoints::default();
    let resolver = Arc::new(ProjectResolver::new(store.clone(), upstream.http()));
    let tokens = Arc::new(TokenManager::new(
        store.clone(),
        resolver.clone(),
        upstream.http(),
        endpoints.clone(),
    ));
    let callback = Arc::new(CallbackListener::new(
        store,
        upstream.http(),
        endpoints.clone(),
        ListenerConfig::default(),
    ));
    let engine = Arc::new(ProxyEngine::new(
        tokens.clone(),
        resolver,
        upstream,
        EngineConfig::default(),
    ));

    let app = app_router(AppState {
        engine,
        tokens,
        callback,
        endpoints,
    });

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, "listening");
    info!("proxy endpoints: /codeassist/* and /gemini/*; auth control: /auth/login, /auth/status, /auth/logout");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gemgate=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
