//! uplinkd — fleet-telemetry uplink server.
//!
//! Terminates long-lived WebSocket connections from field devices,
//! tracks their latest state, persists notable events, dispatches
//! operator commands, and fans live updates out to observers.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::services::{ServeDir, ServeFile};
use tracing_subscriber::EnvFilter;

use uplink_api::ApiState;
use uplink_core::config::Config;
use uplink_store::{
    response_store, AuthDirectory, CommandRouter, ConnectionRegistry, EventStore, ResponseStore,
    StateStore,
};

mod cli;
mod metered;
mod observer;
mod peer;
mod serve;

/// Shared handles for the WebSocket handlers.
#[derive(Clone)]
pub struct DaemonState {
    pub auth: Arc<AuthDirectory>,
    pub registry: Arc<ConnectionRegistry>,
    pub responses: Arc<ResponseStore>,
    pub states: Arc<StateStore>,
    pub events: Arc<EventStore>,
    pub api_key: String,
    pub keepalive_interval: Duration,
    pub idle_timeout: Option<Duration>,
    pub message_rate_limit: u32,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    match &args.command {
        Some(cli::Command::Init) => cli::init(&args.config),
        Some(cli::Command::AddClient(add)) => cli::add_client(&args.config, add),
        Some(cli::Command::Serve) | None => run(&args.config).await,
    }
}

async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting uplinkd");

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    let auth = Arc::new(AuthDirectory::new(config.auth.tokens.clone()));
    let registry = Arc::new(ConnectionRegistry::new(config.server.max_connections));
    let responses = Arc::new(ResponseStore::new(config.storage.response_ttl()));
    let states = Arc::new(StateStore::new(&config.storage.state_path));
    let events = Arc::new(EventStore::new(
        config.storage.max_events_per_peer,
        &config.storage.events_path,
    ));
    let commands = CommandRouter::new(registry.clone(), responses.clone());

    tracker.spawn(
        registry
            .clone()
            .aggregate_loop(config.logging.stats_interval(), shutdown.clone()),
    );
    tracker.spawn(
        responses
            .clone()
            .sweep_loop(response_store::SWEEP_INTERVAL, shutdown.clone()),
    );

    let daemon_state = DaemonState {
        auth,
        registry: registry.clone(),
        responses,
        states: states.clone(),
        events: events.clone(),
        api_key: config.auth.api_key.clone(),
        keepalive_interval: config.server.keepalive_interval(),
        idle_timeout: config.server.idle_timeout(),
        message_rate_limit: config.server.message_rate_limit,
        shutdown: shutdown.clone(),
        tracker: tracker.clone(),
    };
    let api_state = ApiState {
        registry,
        commands,
        states,
        events,
        api_key: config.auth.api_key.clone(),
    };

    let mut app = Router::new()
        .route("/ws", get(peer::handle_ws))
        .route("/ws/web", get(observer::handle_ws_web))
        .with_state(daemon_state)
        .nest("/api", uplink_api::router(api_state));

    if config.server.enable_web_ui {
        app = app
            .route_service("/", ServeFile::new("web/index.html"))
            .nest_service("/images", ServeDir::new("web/images"));
        tracing::info!("web UI enabled at /");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.ws_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        port = config.server.ws_port,
        peers = config.auth.tokens.len(),
        keepalive_secs = config.server.keepalive_interval_secs,
        "listening"
    );

    spawn_signal_handler(shutdown.clone());

    serve::serve(app, listener, shutdown.clone(), &tracker).await?;

    // Every session observes the root token; give tasks a bounded
    // window to drain.
    tracker.close();
    if tokio::time::timeout(Duration::from_secs(30), tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!("shutdown timed out waiting for tasks");
    }
    tracing::info!("server stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to install SIGINT handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
            _ = shutdown.cancelled() => return,
        }
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });
}
