use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use staff_chat::{
    build_router,
    channel_layer::{ChannelLayer, InMemoryChannelLayer},
    config::AppConfig,
    db,
    middleware::spawn_user_rate_limit_cleanup,
    pubsub::RedisChannelLayer,
    storage::Storage,
    AppState,
};

// ─── Main ──────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "staff_chat=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!("Starting staff chat on {}:{}", config.host, config.port);

    let pool = db::init_pool(&config).await?;

    let channels: Arc<dyn ChannelLayer> = if config.redis_enabled() {
        Arc::new(RedisChannelLayer::connect(&config.redis_url).await?)
    } else {
        tracing::info!("Redis not configured, using in-memory channel layer (single-instance mode)");
        Arc::new(InMemoryChannelLayer::new())
    };

    let storage = Storage::from_config(&config).await?;

    let state = AppState::new(pool, config.clone(), storage, channels);

    // Sockets from a previous run are gone and never closed cleanly
    state
        .presence
        .reset_all()
        .await
        .context("Failed to reset stale presence")?;

    spawn_user_rate_limit_cleanup(state.ws_rate_limiter.clone());

    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!("Staff chat listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    tracing::info!("Staff chat shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
