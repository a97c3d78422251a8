// Shared helpers for HTTP-level tests: an in-memory app and request plumbing.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use tamagotchi_backend::api::{self, AppState};
use tamagotchi_backend::auth::create_token;
use tamagotchi_backend::chat::ChatClient;
use tamagotchi_backend::db::{Database, User};
use tamagotchi_backend::pet::decay::DecayRates;
use tamagotchi_backend::pet::session::{SessionRegistry, SessionTimers};
use tamagotchi_backend::rate_limit::RateLimiter;

pub struct TestApp {
    pub app: Router,
    pub db: Arc<Database>,
    pub sessions: SessionRegistry,
}

pub async fn setup() -> TestApp {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let sessions = SessionRegistry::new();
    let state = AppState {
        db: db.clone(),
        chat: Arc::new(ChatClient::disabled()),
        rate_limiter: RateLimiter::new(),
        sessions: sessions.clone(),
        timers: SessionTimers {
            decay_interval: Duration::from_secs(3600),
            sync_interval: Duration::from_secs(3600),
            rates: DecayRates::default(),
        },
    };
    TestApp {
        app: api::app(state),
        db,
        sessions,
    }
}

impl TestApp {
    /// Serve the app on an ephemeral local port; returns `host:port`.
    pub async fn serve(&self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.app.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    /// Create a user directly in the store and mint a token for it.
    pub async fn user(&self, username: &str) -> (User, String) {
        let user = self
            .db
            .create_user(username, &format!("{username}@example.com"), "hash", username)
            .await
            .unwrap();
        let token = create_token(user.id, &user.username).unwrap();
        (user, token)
    }

    /// A user with their hatched pet. Returns (user id, token, pet id).
    pub async fn owner_with_pet(&self, username: &str) -> (i64, String, i64) {
        let (user, token) = self.user(username).await;
        let (status, pet) = self
            .request("GET", &format!("/api/pet/{}", user.id), None, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        (user.id, token, pet["id"].as_i64().unwrap())
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let req = match body {
            Some(json) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, json)
    }
}
