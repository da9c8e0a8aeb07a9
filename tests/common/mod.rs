//! Shared fixtures for the HTTP-level tests.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Request, header},
};
use chrono::Utc;
use harvest_api::{
    build_router,
    config::Config,
    db,
    mail::{MailError, Mailer, OutgoingEmail},
    models::User,
    routes::auth::issue_token_pair,
    state::AppState,
};
use serde_json::Value;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tower::util::ServiceExt;

/// Keeps every message instead of sending it.
#[derive(Default, Clone)]
pub struct RecordingMailer {
    pub sent: Arc<Mutex<Vec<OutgoingEmail>>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        self.sent.lock().expect("mailer lock").push(email);
        Ok(())
    }
}

impl RecordingMailer {
    /// Waits for background dispatches to land.
    pub async fn wait_for(&self, count: usize) -> Vec<OutgoingEmail> {
        for _ in 0..100 {
            {
                let sent = self.sent.lock().expect("mailer lock");
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent.lock().expect("mailer lock").clone()
    }
}

pub struct TestApp {
    pub router: Router,
    pub pool: SqlitePool,
    pub config: Config,
    pub mailer: RecordingMailer,
    /// Holds a file-backed database open for the life of the app.
    pub db_dir: Option<TempDir>,
}

pub fn test_config() -> Config {
    Config {
        secret_key: "integration-secret".to_string(),
        bcrypt_cost: 4,
        rate_limit_requests: 10_000,
        ..Config::default()
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(test_config()).await
}

pub async fn spawn_app_with(config: Config) -> TestApp {
    let pool = db::init_db("sqlite::memory:", 1).await.expect("database");
    assemble(pool, config, None)
}

/// An app on a database file with a multi-connection pool, for tests where
/// requests really run side by side.
pub async fn spawn_file_app() -> TestApp {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("harvest.db").display());
    let pool = db::init_db(&url, 10).await.expect("database");
    assemble(pool, test_config(), Some(dir))
}

fn assemble(pool: SqlitePool, config: Config, db_dir: Option<TempDir>) -> TestApp {
    let mailer = RecordingMailer::default();
    let state = AppState::new(pool.clone(), config.clone(), Arc::new(mailer.clone()));
    TestApp {
        router: build_router(state),
        pool,
        config,
        mailer,
        db_dir,
    }
}

impl TestApp {
    pub async fn create_user(&self, username: &str, password: &str, role: &str) -> User {
        let hashed = bcrypt::hash(password, 4).expect("hash");
        sqlx::query_as::<_, User>(
            "INSERT INTO users (username, email, hashed_password, role, affiliation, date_joined) \
             VALUES (?, ?, ?, ?, 'Field Lab', ?) RETURNING *",
        )
        .bind(username)
        .bind(format!("{username}@example.org"))
        .bind(hashed)
        .bind(role)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .expect("insert user")
    }

    pub fn token_for(&self, user: &User) -> String {
        issue_token_pair(&self.config, user).expect("tokens").access
    }

    /// A fresh user with a bearer token.
    pub async fn login(&self, username: &str, role: &str) -> (User, String) {
        let user = self.create_user(username, "Str0ngPassword", role).await;
        let token = self.token_for(&user);
        (user, token)
    }

    pub async fn send(&self, request: Request<Body>) -> (axum::http::StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, body)
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> (axum::http::StatusCode, Value) {
        self.send(request("GET", uri, token, None)).await
    }

    pub async fn post(
        &self,
        uri: &str,
        token: Option<&str>,
        body: Value,
    ) -> (axum::http::StatusCode, Value) {
        self.send(request("POST", uri, token, Some(body))).await
    }
}

pub fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

/// Attaches the socket peer address the server would have seen.
pub fn from_peer(mut request: Request<Body>, peer: &str) -> Request<Body> {
    let addr: SocketAddr = peer.parse().expect("socket address");
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

/// Same as [`request`] but as a specific guest session.
pub fn guest_request(method: &str, uri: &str, session: &str, body: Option<Value>) -> Request<Body> {
    let mut request = request(method, uri, None, body);
    request
        .headers_mut()
        .insert("x-session-key", session.parse().expect("header"));
    request
}
