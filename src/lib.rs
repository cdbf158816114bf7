// Library re-exports for integration tests.
// The binary (main.rs) builds the state and router from these modules.

pub mod api;
pub mod auth;
pub mod channel_layer;
pub mod config;
pub mod db;
pub mod errors;
pub mod message_router;
pub mod middleware;
pub mod models;
pub mod presence;
pub mod pubsub;
pub mod session;
pub mod storage;
pub mod ws;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::{DefaultOnResponse, TraceLayer},
};

use channel_layer::ChannelLayer;
use config::AppConfig;
use message_router::MessageRouter;
use middleware::{rate_limit_middleware, RateLimiter, UserRateLimiter};
use presence::PresenceTracker;

// ─── Application State ─────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: db::Pool,
    pub config: AppConfig,
    pub storage: storage::Storage,
    /// In-memory or Redis-backed group fan-out
    pub channels: Arc<dyn ChannelLayer>,
    pub presence: PresenceTracker,
    pub messages: MessageRouter,
    /// Per-user limiter for chat frames on the socket
    pub ws_rate_limiter: UserRateLimiter,
}

impl AppState {
    pub fn new(
        db: db::Pool,
        config: AppConfig,
        storage: storage::Storage,
        channels: Arc<dyn ChannelLayer>,
    ) -> Self {
        let ws_rate_limiter =
            UserRateLimiter::new(config.ws_messages_per_window, config.ws_rate_window_secs);
        Self {
            presence: PresenceTracker::new(db.clone()),
            messages: MessageRouter::new(db.clone(), channels.clone()),
            db,
            config,
            storage,
            channels,
            ws_rate_limiter,
        }
    }
}

// ─── Router ────────────────────────────────────────────

pub fn build_router(state: AppState) -> Router {
    // ─── CORS ──────────────────────────────────────────
    let allow_origin = if state.config.cors_origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origins
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };
    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    // ─── Rate Limiting ─────────────────────────────────
    let global_limiter = RateLimiter::new(state.config.max_requests_per_minute, 60);
    middleware::spawn_rate_limit_cleanup(global_limiter.clone());

    // Stricter limit for auth endpoints to resist brute-force
    let auth_limiter = RateLimiter::new(state.config.auth_requests_per_minute, 60);
    middleware::spawn_rate_limit_cleanup(auth_limiter.clone());

    let auth_routes = Router::new()
        .route("/register", post(api::auth_routes::register))
        .route("/login", post(api::auth_routes::login))
        .layer(axum_mw::from_fn(move |req, next| {
            let limiter = auth_limiter.clone();
            rate_limit_middleware(limiter, req, next)
        }));

    let upload_routes = Router::new()
        .route("/upload", post(api::attachments::upload))
        .layer(DefaultBodyLimit::max(state.config.max_upload_size_bytes as usize));

    let chat_routes = Router::new()
        .route("/users", get(api::users::list_contacts))
        .route("/messages", get(api::messages::list_inbox))
        .route(
            "/:user_id/messages",
            get(api::messages::get_conversation).post(api::messages::send_message),
        )
        .merge(upload_routes);

    let api = Router::new()
        .nest("/auth", auth_routes)
        .nest("/chat", chat_routes)
        .route("/presence", get(api::presence::get_presence));

    Router::new()
        .route("/api/v1/ws", get(ws::ws_handler))
        .nest("/api/v1", api)
        .route("/media/chat_uploads/:name", get(api::attachments::download))
        .route("/health", get(health_check))
        .layer(CompressionLayer::new())
        // TraceLayer: custom span excludes remote_addr
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::extract::Request| {
                    tracing::info_span!(
                        "http_request",
                        method = %req.method(),
                        uri = %req.uri(),
                        version = ?req.version(),
                    )
                })
                .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG)),
        )
        .layer(axum_mw::from_fn(move |req, next| {
            let limiter = global_limiter.clone();
            rate_limit_middleware(limiter, req, next)
        }))
        .layer(cors)
        // ─── Security Headers ──────────────────────────
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}
