use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tracing_subscriber::EnvFilter;

use tamagotchi_backend::api::{self, AppState};
use tamagotchi_backend::chat::ChatClient;
use tamagotchi_backend::config::Config;
use tamagotchi_backend::db::Database;
use tamagotchi_backend::pet::decay::DecayRates;
use tamagotchi_backend::pet::session::{SessionRegistry, SessionTimers};
use tamagotchi_backend::rate_limit::RateLimiter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load();

    let db = Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    let chat = match &config.ollama_url {
        Some(url) => {
            tracing::info!(url = %url, model = %config.ollama_model, "Chat backed by Ollama");
            ChatClient::new(Some(url.clone()), config.ollama_model.clone(), config.llm_timeout)
        }
        None => {
            tracing::info!("OLLAMA_URL not set, chat uses canned replies");
            ChatClient::disabled()
        }
    };

    let state = AppState {
        db,
        chat: Arc::new(chat),
        rate_limiter: RateLimiter::new(),
        sessions: SessionRegistry::new(),
        timers: SessionTimers {
            decay_interval: config.decay_interval,
            sync_interval: config.sync_interval,
            rates: DecayRates::default(),
        },
    };

    let mut app = api::app(state);

    // Serve the frontend build, falling back to index.html for client-side routes.
    if let Some(dir) = &config.static_dir {
        tracing::info!(dir = %dir.display(), "Serving static files");
        let index = dir.join("index.html");
        app = app.fallback_service(ServeDir::new(dir).not_found_service(ServeFile::new(index)));
    }
    let app = app.layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("Tamagotchi backend listening on port {}", config.port);
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
