//! HTTP surface. Public routes live here; everything under `/api` except
//! registration goes through [`require_api_auth`].

mod auth;
mod listings;
mod messages;
mod requirements;
mod scheduler;
mod scraper;

use crate::advisor::AdvisorService;
use crate::clock::Clock;
use crate::lifecycle::{TransitionError, UpdateError};
use crate::models::{ApiError, Listing, Requirement, ValidationError};
use crate::scraper::ScrapeError;
use crate::scraping::ScrapeRunner;
use crate::security::{AuthState, require_api_auth};
use crate::store::{Store, StoreError};
use crate::tasks::{TaskError, TaskQueue};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub runner: ScrapeRunner,
    pub advisor: AdvisorService,
    pub queue: TaskQueue,
    pub clock: Arc<dyn Clock>,
    pub openapi: Arc<Value>,
    pub prometheus: PrometheusHandle,
    pub metrics_key: Option<String>,
    pub openapi_key: Option<String>,
}

impl AppState {
    /// Requirements of other users are reported as missing.
    async fn owned_requirement(&self, id: Uuid, user_id: Uuid) -> Result<Requirement, AppError> {
        self.store
            .get_requirement(id)
            .await?
            .filter(|r| r.user_id == user_id)
            .ok_or(AppError::NotFound("requirement"))
    }

    async fn owned_listing(&self, id: Uuid, user_id: Uuid) -> Result<Listing, AppError> {
        self.store
            .get_listing(id)
            .await?
            .filter(|l| l.user_id == user_id)
            .ok_or(AppError::NotFound("listing"))
    }
}

pub fn router(state: AppState, auth: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .merge(auth::protected_routes())
        .merge(requirements::routes())
        .merge(listings::routes())
        .merge(messages::routes())
        .merge(scraper::routes())
        .merge(scheduler::routes())
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    let api = Router::new().merge(auth::public_routes()).merge(protected);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .nest("/api", api)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Liveness check.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "buysmart-api-rs",
    }))
}

fn header_matches(headers: &HeaderMap, name: &str, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| presented == expected)
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    if let Some(key) = &state.openapi_key
        && !header_matches(&headers, "X-Docs-Key", key)
    {
        return Err(AppError::Unauthorized("docs key required"));
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> impl IntoResponse {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>BuySmart API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key
        && !header_matches(&headers, "X-Metrics-Key", secret)
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(&'static str),
    NotFound(&'static str),
    Conflict(String),
    Unavailable(String),
    Upstream(String),
    Internal(String),
}

impl From<ValidationError> for AppError {
    fn from(value: ValidationError) -> Self {
        Self::BadRequest(value.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(detail) => Self::Conflict(detail),
            StoreError::Invariant(err) => Self::Conflict(err.to_string()),
            err @ (StoreError::Request(_) | StoreError::Deserialize(_)) => {
                Self::Upstream(err.to_string())
            }
        }
    }
}

impl From<UpdateError> for AppError {
    fn from(value: UpdateError) -> Self {
        match value {
            UpdateError::Validation(err) => err.into(),
            UpdateError::Transition(err) => err.into(),
        }
    }
}

impl From<TransitionError> for AppError {
    fn from(value: TransitionError) -> Self {
        Self::Conflict(value.to_string())
    }
}

impl From<TaskError> for AppError {
    fn from(value: TaskError) -> Self {
        match value {
            TaskError::NotFound => Self::NotFound("task"),
            err @ TaskError::NotCancellable(_) => Self::Conflict(err.to_string()),
            err @ (TaskError::QueueFull | TaskError::WorkerGone) => {
                Self::Unavailable(err.to_string())
            }
            err @ TaskError::Backend(_) => Self::Upstream(err.to_string()),
        }
    }
}

impl From<ScrapeError> for AppError {
    fn from(value: ScrapeError) -> Self {
        Self::Upstream(value.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "invalid_input", detail),
            AppError::Unauthorized(detail) => {
                (StatusCode::UNAUTHORIZED, "unauthorized", detail.to_string())
            }
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
            AppError::Conflict(detail) => (StatusCode::CONFLICT, "conflict", detail),
            AppError::Unavailable(detail) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", detail)
            }
            AppError::Upstream(detail) => {
                warn!(target = "buysmart.api", error = %detail, "upstream_failure");
                (StatusCode::BAD_GATEWAY, "upstream_error", detail)
            }
            AppError::Internal(detail) => {
                error!(target = "buysmart.api", error = %detail, "internal_error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", detail)
            }
        };
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}
