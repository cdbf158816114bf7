#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use staff_chat::channel_layer::{ChannelLayer, InMemoryChannelLayer};
use staff_chat::db::Pool;
use staff_chat::storage::Storage;
use staff_chat::{build_router, config::AppConfig, AppState};
use tower::ServiceExt;

pub const TEST_PASSWORD: &str = "testpassword123";

/// Test helper that wraps a fully-built chat router.
///
/// Each test gets a fresh database via `#[sqlx::test]`, an in-memory channel
/// layer (unless one is supplied) and its own upload directory.
pub struct TestApp {
    pub state: AppState,
    pub pool: Pool,
    _storage_dir: tempfile::TempDir,
}

impl TestApp {
    /// Build a TestApp from the pool provided by `#[sqlx::test]`.
    pub async fn new(pool: Pool) -> Self {
        Self::build(pool, AppConfig::test_default(), Arc::new(InMemoryChannelLayer::new()))
    }

    /// Same as `new`, with a caller-supplied channel layer.
    pub async fn with_channels(pool: Pool, channels: Arc<dyn ChannelLayer>) -> Self {
        Self::build(pool, AppConfig::test_default(), channels)
    }

    /// Same as `new`, after `tweak` has adjusted the test config.
    pub async fn with_config(pool: Pool, tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let mut config = AppConfig::test_default();
        tweak(&mut config);
        Self::build(pool, config, Arc::new(InMemoryChannelLayer::new()))
    }

    fn build(pool: Pool, mut config: AppConfig, channels: Arc<dyn ChannelLayer>) -> Self {
        let storage_dir = tempfile::tempdir().expect("Failed to create storage dir");
        config.storage_dir = storage_dir.path().to_string_lossy().into_owned();

        let storage = Storage::Local {
            dir: storage_dir.path().to_path_buf(),
        };

        let state = AppState::new(pool.clone(), config, storage, channels);

        TestApp {
            state,
            pool,
            _storage_dir: storage_dir,
        }
    }

    /// Get a fresh clone of the router for a `oneshot` request.
    fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Get a router suitable for `axum::serve` (WS integration tests).
    pub fn router_clone(&self) -> Router {
        build_router(self.state.clone())
    }

    // ── Request helpers ──────────────────────────────────

    /// Send a request through the router and return (status, body as Value).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let body_bytes = body
            .map(|v| serde_json::to_vec(&v).unwrap())
            .unwrap_or_default();

        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(t) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", t));
        }

        if !body_bytes.is_empty() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }

        let req = builder.body(Body::from(body_bytes)).unwrap();
        let (status, _, bytes) = self.send(req).await;
        (status, to_value(&bytes))
    }

    /// POST a multipart body with a single part named `field`.
    pub async fn upload(
        &self,
        token: &str,
        field: &str,
        file_name: &str,
        data: &[u8],
    ) -> (StatusCode, Value) {
        let boundary = "----staffchat-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                field, file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/chat/upload")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();

        let (status, _, bytes) = self.send(req).await;
        (status, to_value(&bytes))
    }

    /// GET returning raw bytes and headers (for media downloads).
    pub async fn get_raw(&self, uri: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send(req).await
    }

    async fn send(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = self.router().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
            .await
            .unwrap();
        (status, headers, bytes.to_vec())
    }

    // ── High-level helpers ───────────────────────────────

    /// Register a new user. Returns (access_token, user_id).
    pub async fn register_user(&self, username: &str) -> (String, i64) {
        let body = json!({
            "username": username,
            "password": TEST_PASSWORD,
        });

        let (status, value) = self
            .request(Method::POST, "/api/v1/auth/register", None, Some(body))
            .await;

        assert_eq!(status, StatusCode::CREATED, "Registration failed: {}", value);

        let token = value["access_token"].as_str().unwrap().to_string();
        let user_id = value["user"]["id"].as_i64().unwrap();
        (token, user_id)
    }

    /// Login an existing user. Returns (access_token, user_id).
    pub async fn login_user(&self, username: &str) -> (String, i64) {
        let body = json!({
            "username": username,
            "password": TEST_PASSWORD,
        });

        let (status, value) = self
            .request(Method::POST, "/api/v1/auth/login", None, Some(body))
            .await;

        assert_eq!(status, StatusCode::OK, "Login failed: {}", value);

        let access = value["access_token"].as_str().unwrap().to_string();
        let user_id = value["user"]["id"].as_i64().unwrap();
        (access, user_id)
    }

    /// Send a private message through the REST fallback. Returns the stored row.
    pub async fn send_message(&self, token: &str, receiver_id: i64, text: &str) -> Value {
        let uri = format!("/api/v1/chat/{}/messages", receiver_id);
        let (status, value) = self
            .request(Method::POST, &uri, Some(token), Some(json!({ "message": text })))
            .await;
        assert_eq!(status, StatusCode::CREATED, "Send message failed: {}", value);
        value
    }

    /// Open the conversation with `other_id`. Returns the response body.
    pub async fn conversation(&self, token: &str, other_id: i64) -> Value {
        let uri = format!("/api/v1/chat/{}/messages", other_id);
        let (status, value) = self.request(Method::GET, &uri, Some(token), None).await;
        assert_eq!(status, StatusCode::OK, "Get conversation failed: {}", value);
        value
    }

    /// Number of message rows between two users, straight from the database.
    pub async fn count_messages(&self, sender_id: i64, receiver_id: i64) -> i64 {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM messages WHERE sender_id = $1 AND receiver_id = $2",
        )
        .bind(sender_id)
        .bind(receiver_id)
        .fetch_one(&self.pool)
        .await
        .unwrap()
    }
}

fn to_value(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(bytes).to_string()))
    }
}
