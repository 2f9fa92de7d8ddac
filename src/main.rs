use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seat_lease::{
    cache::CacheService,
    clock::SystemClock,
    config::{Config, LogFormat},
    controllers,
    database::Database,
    redis_client::RedisClient,
    AppState,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Failed to load configuration")?;

    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&config.app.rust_log));
    match config.app.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!("Starting seat lease service ({})", config.app.environment);

    // Connect to the database
    let db = Database::new(&config.database.url, config.database.pool_size)
        .await
        .context("Failed to connect to database")?;

    db.run_migrations().await.context("Failed to run migrations")?;

    // Redis only backs the details cache, so the service runs without it
    let cache = match &config.redis.url {
        Some(url) => match RedisClient::new(url).await {
            Ok(redis) => Some(CacheService::new(redis, config.redis.cache_ttl_secs)),
            Err(e) => {
                warn!("Redis unavailable, event details will not be cached: {}", e);
                None
            }
        },
        None => {
            info!("REDIS_URL not set, event details will not be cached");
            None
        }
    };

    let app_state = AppState::new(
        db.ledger(),
        Arc::new(SystemClock),
        config.leasing.policy(),
        config.leasing.max_event_capacity,
        cache,
    );

    // --- Start background tasks ---

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = app_state.spawn_sweeper(
        config.leasing.sweep_batch_size,
        config.leasing.schedule(),
        shutdown_rx,
    );

    // --- Start the web server ---

    let app = controllers::router(app_state);

    let host: std::net::IpAddr = config
        .app
        .host
        .parse()
        .with_context(|| format!("HOST '{}' is not an IP address", config.app.host))?;
    let addr = SocketAddr::from((host, config.app.port));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped, waiting for the sweeper");
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        error!("Sweeper task ended abnormally: {}", e);
    }

    db.pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
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
    info!("Shutdown signal received");
}
