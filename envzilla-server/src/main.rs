use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use envzilla_server::api::api_router;
use envzilla_server::config::Config;
use envzilla_server::health::health_handler;
use envzilla_server::queue::worker::{spawn_stall_monitor, spawn_workers};
use envzilla_server::queue::{RedisJobQueue, RetryPolicy};
use envzilla_server::store::RedisDeploymentRepository;
use envzilla_server::sweeper;
use envzilla_server::tunnel::spawn_health_monitor;
use envzilla_server::webhook::webhook_router;
use envzilla_server::AppState;

/// How long drain waits for in-flight jobs before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
/// Tunnel health monitor cadence.
const TUNNEL_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "starting envzilla preview controller v{}",
        envzilla_server::get_server_version()
    );

    let config = Config::from_env().context("failed to load configuration from environment")?;
    if config.forge.is_none() {
        warn!("FORGE_APP_ID/FORGE_PRIVATE_KEY not set; PR comments will be skipped");
    }

    let redis_url = config.redis.url();
    let client = redis::Client::open(redis_url.clone())
        .with_context(|| format!("invalid redis URL {redis_url}"))?;
    let connection = ConnectionManager::new(client)
        .await
        .context("could not connect to redis")?;
    info!(
        "connected to redis at {}:{}",
        config.redis.host, config.redis.port
    );

    let repository = Arc::new(RedisDeploymentRepository::new(connection.clone()));
    let queue = Arc::new(RedisJobQueue::new(connection, RetryPolicy::default()));
    let state = Arc::new(AppState::new(config, repository, queue));

    // Crash recovery before any request or worker touches the store.
    match sweeper::recover_orphans(&state).await {
        Ok(0) => {}
        Ok(recovered) => info!("recovered {recovered} orphaned deployments"),
        Err(e) => warn!("orphan recovery failed: {e}"),
    }

    let cancel = CancellationToken::new();
    let workers = spawn_workers(state.clone(), state.config.job_concurrency, cancel.clone());
    let stall_monitor =
        spawn_stall_monitor(state.queue.clone(), state.config.stall_window, cancel.clone());
    let sweep_loop = sweeper::spawn_sweeper(state.clone(), cancel.clone());
    let tunnel_monitor = spawn_health_monitor(
        state.tunnels.clone(),
        TUNNEL_MONITOR_INTERVAL,
        cancel.clone(),
    );

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .merge(api_router())
        .merge(webhook_router(state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
    if let Some(origin) = &state.config.cors_origin {
        app = app.layer(cors_layer(origin));
    }
    let app = app.with_state(state.clone());

    let listener = TcpListener::bind(("0.0.0.0", state.config.port))
        .await
        .with_context(|| format!("could not bind port {}", state.config.port))?;
    info!("listening on port {}", state.config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Drain: stop taking work, let in-flight jobs finish, then take the
    // tunnels down with the process.
    info!("draining: waiting for in-flight jobs");
    cancel.cancel();
    for handle in workers {
        if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
            warn!("a worker did not drain within {DRAIN_TIMEOUT:?}");
        }
    }
    stall_monitor.abort();
    sweep_loop.abort();
    tunnel_monitor.abort();
    state.tunnels.stop_all().await;
    info!("shutdown complete");
    Ok(())
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        CorsLayer::new().allow_origin(Any)
    } else {
        match origin.parse::<axum::http::HeaderValue>() {
            Ok(value) => CorsLayer::new().allow_origin(value),
            Err(_) => {
                warn!("CORS_ORIGIN {origin:?} is not a valid origin, ignoring");
                CorsLayer::new()
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
