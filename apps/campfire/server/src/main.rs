mod cli;
mod config;
mod delivery;
mod error;
mod handlers;
mod reconcile;
mod registry;
mod session;
mod storage;
mod telemetry;
mod tokens;
mod websocket;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use rand::RngCore;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::ServerConfig;
use crate::delivery::DeliveryPipeline;
use crate::reconcile::ReconcileEngine;
use crate::registry::TransportRegistry;
use crate::storage::{MembershipStore, RedisStore};
use crate::telemetry::Telemetry;
use crate::tokens::ResumeTokenKeeper;

/// Shared state handed to the HTTP and WebSocket layers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub engine: Arc<ReconcileEngine>,
    pub registry: TransportRegistry,
    pub store: Arc<dyn MembershipStore>,
    pub metrics: PrometheusHandle,
    pub public_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    if let Some(Commands::Watch {
        url,
        passphrase,
        name,
    }) = cli.command.take()
    {
        tracing_subscriber::fmt::init();
        return cli::run_watch_client(url, passphrase, name).await;
    }

    let telemetry = Telemetry::init()?;
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        redis_url = %config.redis_url,
        room_ttl_seconds = config.room_ttl_seconds,
        "starting campfire server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let store = RedisStore::connect(&config.redis_url, config.room_ttl_seconds)
        .await
        .map_err(|err| anyhow::anyhow!("failed to connect to redis: {err}"))?;
    let store: Arc<dyn MembershipStore> = Arc::new(store);

    let registry = TransportRegistry::default();
    let delivery = DeliveryPipeline::new(registry.clone());
    let tokens = ResumeTokenKeeper::new(token_secret(&config), config.resume_token_ttl);
    let engine = Arc::new(ReconcileEngine::new(
        store.clone(),
        registry.clone(),
        delivery,
        tokens,
    ));
    let sweeper = engine.spawn_heartbeat_sweeper(config.sweep_interval, config.heartbeat_timeout);

    let state = AppState {
        engine,
        registry,
        store,
        metrics,
        public_url: config.public_url.clone(),
    };

    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/rooms", post(handlers::create_room))
        .route("/rooms/:passphrase", get(handlers::room_status))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("campfire listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    sweeper.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

fn token_secret(config: &ServerConfig) -> Vec<u8> {
    match &config.resume_token_secret {
        Some(secret) => secret.clone().into_bytes(),
        None => {
            info!("no resume-token secret configured; tokens will not survive a restart");
            let mut secret = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            secret
        }
    }
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
