use std::env;
use std::str::FromStr;

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct AppConfig {
    // Server
    pub host: String,
    pub port: u16,

    // Database
    pub database_url: String,
    pub db_max_connections: u32,

    // Redis (empty → in-memory channel layer, single-process mode)
    pub redis_url: String,

    // JWT
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,

    // File storage ("local" or "s3")
    pub storage_backend: String,
    pub storage_dir: String,
    pub s3_endpoint: String,
    pub s3_bucket: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_region: String,

    // CORS ("*" or comma-separated origins)
    pub cors_origins: String,

    // Rate Limiting
    pub max_requests_per_minute: u32,
    pub auth_requests_per_minute: u32,
    pub ws_messages_per_window: u32,
    pub ws_rate_window_secs: u64,

    // Socket liveness: ping cadence and how long a silent peer is kept
    pub ws_ping_interval_secs: u64,
    pub ws_idle_timeout_secs: u64,

    // File Upload
    pub max_upload_size_bytes: u64,
}

/// Read an optional env var, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Config with test-appropriate defaults (no env vars needed).
    pub fn test_default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: String::new(), // not used, pool comes from #[sqlx::test]
            db_max_connections: 5,
            redis_url: String::new(),
            jwt_secret: "test-jwt-secret-that-is-long-enough-for-hmac".into(),
            jwt_expiry_hours: 24,
            storage_backend: "local".into(),
            storage_dir: "/tmp/staff-chat-test-storage".into(),
            s3_endpoint: String::new(),
            s3_bucket: String::new(),
            s3_access_key: String::new(),
            s3_secret_key: String::new(),
            s3_region: String::new(),
            cors_origins: "*".into(),
            max_requests_per_minute: 10_000,
            auth_requests_per_minute: 10_000,
            ws_messages_per_window: 1000,
            ws_rate_window_secs: 10,
            ws_ping_interval_secs: 30,
            ws_idle_timeout_secs: 90,
            max_upload_size_bytes: 10_000_000,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let port = match env::var("STAFFCHAT_PORT") {
            Ok(p) => p.parse().context("STAFFCHAT_PORT must be a valid u16")?,
            Err(_) => 8080,
        };

        Ok(Self {
            host: env::var("STAFFCHAT_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port,

            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20),

            redis_url: env::var("REDIS_URL").unwrap_or_default(),

            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            jwt_expiry_hours: env_or("JWT_EXPIRY_HOURS", 24),

            storage_backend: env::var("STORAGE_BACKEND").unwrap_or_else(|_| "local".into()),
            storage_dir: env::var("STORAGE_DIR").unwrap_or_else(|_| "./data/media".into()),
            s3_endpoint: env::var("S3_ENDPOINT").unwrap_or_default(),
            s3_bucket: env::var("S3_BUCKET").unwrap_or_default(),
            s3_access_key: env::var("S3_ACCESS_KEY").unwrap_or_default(),
            s3_secret_key: env::var("S3_SECRET_KEY").unwrap_or_default(),
            s3_region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into()),

            cors_origins: env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".into()),

            max_requests_per_minute: env_or("MAX_REQUESTS_PER_MINUTE", 120),
            auth_requests_per_minute: env_or("AUTH_REQUESTS_PER_MINUTE", 10),
            ws_messages_per_window: env_or("WS_MESSAGES_PER_WINDOW", 30),
            ws_rate_window_secs: env_or("WS_RATE_WINDOW_SECS", 10),
            ws_ping_interval_secs: env_or("WS_PING_INTERVAL_SECS", 30),
            ws_idle_timeout_secs: env_or("WS_IDLE_TIMEOUT_SECS", 90),

            max_upload_size_bytes: env_or("MAX_UPLOAD_SIZE_BYTES", 26_214_400), // 25MB
        })
    }

    pub fn redis_enabled(&self) -> bool {
        !self.redis_url.trim().is_empty()
    }
}
