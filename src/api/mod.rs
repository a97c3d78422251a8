// HTTP API routes (pets, worlds, chat, memories, caretakers).

pub mod ws;

use axum::{
    extract::{rejection::JsonRejection, Json, Path, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::auth::{self, authorize_pet, AuthUser, PetAccess};
use crate::chat::{self, ChatClient, TalkReply};
use crate::db::{Caretaker, Database, Memory, Pet};
use crate::metrics;
use crate::pet::actions::{apply_action, Action};
use crate::pet::session::{SessionRegistry, SessionSlot, SessionTimers};
use crate::pet::world::{self, WorldView, MAX_CODE_ATTEMPTS};
use crate::pet::{self, PetError, Stats};
use crate::rate_limit::{RateLimitType, RateLimiter};

pub const DEFAULT_MEMORY_LIMIT: i64 = 20;
pub const MAX_MEMORY_LIMIT: i64 = 50;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ActionRequest {
    pub action: String,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct WorldRequest {
    pub open: bool,
}

#[derive(Deserialize)]
pub struct TalkRequest {
    pub message: String,
}

#[derive(Deserialize)]
pub struct AddCaretakerRequest {
    pub username: String,
}

#[derive(Deserialize)]
pub struct MemoriesParams {
    pub limit: Option<i64>,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub chat: Arc<ChatClient>,
    pub rate_limiter: RateLimiter,
    pub sessions: SessionRegistry,
    pub timers: SessionTimers,
}

// ── Error helpers ─────────────────────────────────────────────────────

/// Error body shared by every endpoint: `{ "error": code, "message": text }`.
pub fn json_error(status: StatusCode, code: &str, msg: &str) -> Response {
    (status, Json(json!({ "error": code, "message": msg }))).into_response()
}

impl PetError {
    pub fn status(&self) -> StatusCode {
        match self {
            PetError::Validation(_) => StatusCode::BAD_REQUEST,
            PetError::NotFound(_) => StatusCode::NOT_FOUND,
            PetError::Forbidden(_) => StatusCode::FORBIDDEN,
            PetError::Conflict(_) => StatusCode::CONFLICT,
            PetError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            PetError::GenerationExhausted { .. } | PetError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PetError::Validation(_) => "validation_error",
            PetError::NotFound(_) => "not_found",
            PetError::Forbidden(_) => "forbidden",
            PetError::Conflict(_) => "conflict",
            PetError::RateLimited(_) => "rate_limited",
            PetError::GenerationExhausted { .. } => "generation_exhausted",
            PetError::Database(_) => "internal_error",
        }
    }

    /// Message safe to show a client; database details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            PetError::Database(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for PetError {
    fn into_response(self) -> Response {
        if let PetError::Database(e) = &self {
            tracing::error!("Database error: {e}");
        }
        json_error(self.status(), self.code(), &self.public_message())
    }
}

/// Claim a pet's stats for one REST write. A live session owns the stats and
/// would overwrite the write on its next sync, so the write is refused instead.
fn claim_stats(state: &AppState, pet_id: i64) -> Result<SessionSlot, PetError> {
    state.sessions.try_acquire(pet_id).ok_or_else(|| {
        PetError::Conflict(
            "This pet has a live session; send changes through the session".to_string(),
        )
    })
}

/// Unwrap a JSON body, reporting malformed payloads in the standard error shape.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, PetError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| PetError::Validation(rejection.body_text()))
}

// ── Router ────────────────────────────────────────────────────────────

/// The complete application: health, auth, pet API, metrics and WebSocket sessions.
pub fn app(state: AppState) -> Router {
    metrics::register_metrics();

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Auth routes (no auth required)
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/me", get(auth::me))
        .with_state(state.db.clone())
        .merge(router(state))
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Pets (the single-segment route takes a user id: get-or-create)
        .route("/api/pet/{id}", get(get_or_create_pet))
        .route("/api/pet/{id}/action", post(pet_action))
        .route("/api/pet/{id}/sync", post(sync_pet))
        .route("/api/pet/{id}/name", put(rename_pet))
        .route("/api/pet/{id}/restart", post(restart_pet))
        .route("/api/pet/{id}/memories", get(list_memories))
        .route("/api/pet/{id}/talk", post(talk))
        // Caretakers
        .route(
            "/api/pet/{id}/caretakers",
            get(list_caretakers).post(add_caretaker),
        )
        .route(
            "/api/pet/{id}/caretakers/{user_id}",
            delete(remove_caretaker),
        )
        // Worlds
        .route("/api/pet/{id}/world", post(set_world))
        .route("/api/world/{code}", get(visit_world))
        .route("/api/worlds", get(list_worlds))
        // WebSocket session
        .route("/ws/pet/{id}", get(ws::ws_pet))
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "tamagotchi-backend" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        metrics::gather_metrics(),
    )
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let start = Instant::now();

    let response = next.run(req).await;

    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[&method, &endpoint, response.status().as_str()])
        .inc();
    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[&endpoint])
        .observe(start.elapsed().as_secs_f64());
    response
}

// ── Pet handlers ──────────────────────────────────────────────────────

async fn get_or_create_pet(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Pet>, PetError> {
    pet::get_or_create(&state.db, user_id).await.map(Json)
}

async fn pet_action(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
    payload: Result<Json<ActionRequest>, JsonRejection>,
) -> Result<Json<Pet>, PetError> {
    let req = body(payload)?;
    let action: Action = req.action.parse()?;
    authorize_pet(&state.db, claims.sub, id, PetAccess::Care).await?;
    let _slot = claim_stats(&state, id)?;
    apply_action(&state.db, id, action).await.map(Json)
}

async fn sync_pet(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
    payload: Result<Json<Stats>, JsonRejection>,
) -> Result<Json<Pet>, PetError> {
    let stats = body(payload)?;
    authorize_pet(&state.db, claims.sub, id, PetAccess::Care).await?;
    let _slot = claim_stats(&state, id)?;
    pet::sync_stats(&state.db, id, stats).await.map(Json)
}

async fn rename_pet(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> Result<Json<Pet>, PetError> {
    let req = body(payload)?;
    authorize_pet(&state.db, claims.sub, id, PetAccess::Owner).await?;
    pet::rename(&state.db, id, &req.name).await.map(Json)
}

async fn restart_pet(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Pet>, PetError> {
    authorize_pet(&state.db, claims.sub, id, PetAccess::Owner).await?;
    let _slot = claim_stats(&state, id)?;
    pet::restart(&state.db, id).await.map(Json)
}

async fn list_memories(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<MemoriesParams>,
) -> Result<Json<Vec<Memory>>, PetError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_MEMORY_LIMIT)
        .clamp(1, MAX_MEMORY_LIMIT);
    pet::require_pet(&state.db, id).await?;
    let memories = state.db.recent_memories(id, limit).await?;
    Ok(Json(memories))
}

async fn talk(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
    payload: Result<Json<TalkRequest>, JsonRejection>,
) -> Result<Json<TalkReply>, PetError> {
    let req = body(payload)?;
    authorize_pet(&state.db, claims.sub, id, PetAccess::Care).await?;
    state
        .rate_limiter
        .check_limit(id, RateLimitType::Talk)
        .map_err(|e| PetError::RateLimited(e.to_string()))?;
    chat::talk(&state.db, &state.chat, id, &req.message)
        .await
        .map(Json)
}

// ── Caretaker handlers ────────────────────────────────────────────────

async fn list_caretakers(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Caretaker>>, PetError> {
    authorize_pet(&state.db, claims.sub, id, PetAccess::Care).await?;
    Ok(Json(state.db.list_caretakers(id).await?))
}

async fn add_caretaker(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
    payload: Result<Json<AddCaretakerRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Vec<Caretaker>>), PetError> {
    let req = body(payload)?;
    let pet = authorize_pet(&state.db, claims.sub, id, PetAccess::Owner).await?;

    let user = state
        .db
        .get_user_by_username(req.username.trim())
        .await?
        .ok_or(PetError::NotFound("User"))?;
    if user.id == pet.user_id {
        return Err(PetError::Validation(
            "the owner cannot be their own pet's caretaker".to_string(),
        ));
    }

    match state.db.add_caretaker(id, user.id).await {
        Ok(()) => {}
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            return Err(PetError::Conflict(format!(
                "{} is already a caretaker",
                user.username
            )))
        }
        Err(e) => return Err(e.into()),
    }
    tracing::info!(pet_id = id, user_id = user.id, "Caretaker added");
    Ok((StatusCode::CREATED, Json(state.db.list_caretakers(id).await?)))
}

async fn remove_caretaker(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path((id, user_id)): Path<(i64, i64)>,
) -> Result<StatusCode, PetError> {
    authorize_pet(&state.db, claims.sub, id, PetAccess::Owner).await?;
    if state.db.remove_caretaker(id, user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(PetError::NotFound("Caretaker"))
    }
}

// ── World handlers ────────────────────────────────────────────────────

async fn set_world(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
    payload: Result<Json<WorldRequest>, JsonRejection>,
) -> Result<Json<Pet>, PetError> {
    let req = body(payload)?;
    authorize_pet(&state.db, claims.sub, id, PetAccess::Owner).await?;

    if !req.open {
        return world::close_world(&state.db, id).await.map(Json);
    }

    state
        .rate_limiter
        .check_limit(id, RateLimitType::WorldOpen)
        .map_err(|e| PetError::RateLimited(e.to_string()))?;
    let mut rng = StdRng::from_entropy();
    world::open_world(&state.db, id, &mut rng, MAX_CODE_ATTEMPTS)
        .await
        .map(Json)
}

async fn visit_world(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<WorldView>, PetError> {
    world::visit_world(&state.db, &code).await.map(Json)
}

async fn list_worlds(State(state): State<AppState>) -> Result<Json<Vec<WorldView>>, PetError> {
    world::list_open_worlds(&state.db).await.map(Json)
}
