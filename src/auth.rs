// Authentication: password hashing, JWT tokens, request extractors and pet access checks.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::json_error;
use crate::db::{Database, Pet, User};
use crate::pet::{require_pet, PetError};

// ── JWT ──────────────────────────────────────────────────────────────

/// JWT secret – in production this should come from an env var.
fn jwt_secret() -> Vec<u8> {
    std::env::var("JWT_SECRET")
        .unwrap_or_else(|_| "tamagotchi-dev-secret-change-in-production".to_string())
        .into_bytes()
}

const TOKEN_LIFETIME_HOURS: i64 = 24 * 7;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: i64, // user id
    pub username: String,
    pub exp: usize, // expiry (unix timestamp)
}

pub fn create_token(user_id: i64, username: &str) -> Result<String, String> {
    let expiration = (chrono::Utc::now() + chrono::Duration::hours(TOKEN_LIFETIME_HOURS))
        .timestamp() as usize;

    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(&jwt_secret()),
    )
    .map_err(|e| format!("Failed to create token: {e}"))
}

pub fn verify_token(token: &str) -> Result<Claims, String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(&jwt_secret()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| format!("Invalid token: {e}"))
}

// ── Password hashing ─────────────────────────────────────────────────

pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| format!("Failed to hash password: {e}"))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| format!("Invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

// ── Axum extractor: AuthUser ─────────────────────────────────────────

fn unauthorized(msg: &str) -> Response {
    json_error(StatusCode::UNAUTHORIZED, "unauthorized", msg)
}

/// Extracts the authenticated user from the `Authorization: Bearer` header.
/// Usage: `AuthUser(claims)` in handler parameters.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("Missing Authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized("Invalid Authorization header format"))?;

        verify_token(token)
            .map(AuthUser)
            .map_err(|_| unauthorized("Invalid token"))
    }
}

// ── Pet access ───────────────────────────────────────────────────────

/// Level of access an operation needs on a pet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PetAccess {
    /// Owner only: rename, worlds, restart, caretaker management.
    Owner,
    /// Owner or caretaker: care actions, sync, chat.
    Care,
}

/// Load a pet and check the user may perform an operation on it.
pub async fn authorize_pet(
    db: &Database,
    user_id: i64,
    pet_id: i64,
    access: PetAccess,
) -> Result<Pet, PetError> {
    let pet = require_pet(db, pet_id).await?;
    if pet.user_id == user_id {
        return Ok(pet);
    }
    match access {
        PetAccess::Care if db.is_caretaker(pet_id, user_id).await? => Ok(pet),
        PetAccess::Care => Err(PetError::Forbidden(
            "Only the owner or a caretaker can do that",
        )),
        PetAccess::Owner => Err(PetError::Forbidden("Only the owner can do that")),
    }
}

// ── Auth API handlers ────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserPublic,
}

#[derive(Serialize)]
pub struct UserPublic {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: String,
}

impl From<User> for UserPublic {
    fn from(user: User) -> Self {
        UserPublic {
            id: user.id,
            username: user.username,
            email: user.email,
            display_name: user.display_name,
            created_at: user.created_at,
        }
    }
}

fn internal(context: &str, e: impl std::fmt::Display) -> Response {
    tracing::error!("{context}: {e}");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "Internal error",
    )
}

fn token_response(status: StatusCode, user: User) -> Response {
    match create_token(user.id, &user.username) {
        Ok(token) => (
            status,
            Json(AuthResponse {
                token,
                user: user.into(),
            }),
        )
            .into_response(),
        Err(e) => internal("Token creation error", e),
    }
}

fn bad_body(rejection: JsonRejection) -> Response {
    json_error(
        StatusCode::BAD_REQUEST,
        "validation_error",
        &rejection.body_text(),
    )
}

pub async fn register(
    State(db): State<Arc<Database>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return bad_body(rejection),
    };

    if req.username.is_empty() || req.password.is_empty() || req.email.is_empty() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "username, email, and password are required",
        );
    }

    let username_len = req.username.chars().count();
    if !(3..=30).contains(&username_len) {
        return json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "username must be 3-30 characters",
        );
    }

    if req.password.len() < 8 {
        return json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "password must be at least 8 characters",
        );
    }

    let password_hash = match hash_password(&req.password) {
        Ok(h) => h,
        Err(e) => return internal("Password hash error", e),
    };

    let display_name = req.display_name.unwrap_or_else(|| req.username.clone());

    match db
        .create_user(&req.username, &req.email, &password_hash, &display_name)
        .await
    {
        Ok(user) => {
            tracing::info!(user_id = user.id, "Registered user");
            token_response(StatusCode::CREATED, user)
        }
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => json_error(
            StatusCode::CONFLICT,
            "conflict",
            "Username or email already taken",
        ),
        Err(e) => internal("DB error in register", e),
    }
}

pub async fn login(
    State(db): State<Arc<Database>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return bad_body(rejection),
    };

    let invalid = || {
        json_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Invalid username or password",
        )
    };

    let user = match db.get_user_by_username(&req.username).await {
        Ok(Some(u)) => u,
        Ok(None) => return invalid(),
        Err(e) => return internal("DB error in login", e),
    };

    let Some(ref password_hash) = user.password_hash else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "This account uses OAuth login",
        );
    };

    match verify_password(&req.password, password_hash) {
        Ok(true) => token_response(StatusCode::OK, user),
        Ok(false) => invalid(),
        Err(e) => internal("Password verify error", e),
    }
}

pub async fn me(AuthUser(claims): AuthUser, State(db): State<Arc<Database>>) -> Response {
    match db.get_user(claims.sub).await {
        Ok(Some(user)) => (StatusCode::OK, Json(UserPublic::from(user))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", "User not found"),
        Err(e) => internal("DB error", e),
    }
}
