use super::{AppError, AppState};
use crate::clock::Clock;
use crate::metrics;
use crate::models::{User, UserProfile};
use crate::security::{CurrentUser, generate_api_key};
use axum::{
    Extension, Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub(super) fn public_routes() -> Router<AppState> {
    Router::new().route("/auth/register", post(register))
}

pub(super) fn protected_routes() -> Router<AppState> {
    Router::new().route("/auth/me", get(me))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    user: UserProfile,
    /// Shown once; store it client side.
    api_key: String,
}

fn normalize_email(raw: &str) -> Result<String, AppError> {
    let email = raw.trim().to_ascii_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(AppError::BadRequest("email is not valid".into())),
    }
}

/// Creates a user and mints its API key.
///
/// - Method: `POST`
/// - Path: `/api/auth/register`
/// - Auth: none
async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    metrics::inc_requests("/api/auth/register");
    let email = normalize_email(&payload.email)?;
    let now = state.clock.now();
    let user = state
        .store
        .create_user(User {
            id: Uuid::new_v4(),
            email,
            api_key: generate_api_key(),
            created_at: now,
            updated_at: now,
        })
        .await?;
    info!(target = "buysmart.api", user_id = %user.id, "user_registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user: UserProfile::from(&user),
            api_key: user.api_key,
        }),
    ))
}

async fn me(Extension(current): Extension<CurrentUser>) -> Json<UserProfile> {
    metrics::inc_requests("/api/auth/me");
    Json(UserProfile::from(&current.0))
}
