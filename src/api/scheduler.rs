use super::{AppError, AppState};
use crate::metrics;
use crate::security::CurrentUser;
use crate::tasks::{QueueStatus, TaskRecord, TaskRequest};
use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use serde::Deserialize;
use std::collections::HashSet;
use uuid::Uuid;

const MAX_LISTINGS_PER_TASK: usize = 50;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/scheduler/search", post(submit_search))
        .route("/scheduler/analyze", post(submit_analyze))
        .route("/scheduler/valuate", post(submit_valuate))
        .route("/scheduler/status/{task_id}", get(status))
        .route("/scheduler/cancel/{task_id}", delete(cancel))
        .route("/scheduler/tasks", get(list))
        .route("/scheduler/queue/status", get(queue_status))
}

#[derive(Debug, Deserialize)]
struct SearchTask {
    requirement_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ListingsTask {
    listing_ids: Vec<Uuid>,
}

impl ListingsTask {
    fn into_ids(self) -> Result<Vec<Uuid>, AppError> {
        let mut seen = HashSet::new();
        let mut ids = self.listing_ids;
        ids.retain(|id| seen.insert(*id));
        if ids.is_empty() {
            return Err(AppError::BadRequest("listing_ids must not be empty".into()));
        }
        if ids.len() > MAX_LISTINGS_PER_TASK {
            return Err(AppError::BadRequest(format!(
                "at most {MAX_LISTINGS_PER_TASK} listings per task"
            )));
        }
        Ok(ids)
    }
}

async fn enqueue(
    state: &AppState,
    user: &CurrentUser,
    request: TaskRequest,
) -> Result<(StatusCode, Json<TaskRecord>), AppError> {
    let record = state.queue.submit(user.id(), request).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// Queues a scrape of one owned requirement.
async fn submit_search(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<SearchTask>,
) -> Result<(StatusCode, Json<TaskRecord>), AppError> {
    metrics::inc_requests("/api/scheduler/search");
    state
        .owned_requirement(payload.requirement_id, user.id())
        .await?;
    let request = TaskRequest::Search {
        requirement_id: payload.requirement_id,
    };
    enqueue(&state, &user, request).await
}

async fn submit_analyze(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<ListingsTask>,
) -> Result<(StatusCode, Json<TaskRecord>), AppError> {
    metrics::inc_requests("/api/scheduler/analyze");
    let request = TaskRequest::Analyze {
        listing_ids: payload.into_ids()?,
    };
    enqueue(&state, &user, request).await
}

async fn submit_valuate(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<ListingsTask>,
) -> Result<(StatusCode, Json<TaskRecord>), AppError> {
    metrics::inc_requests("/api/scheduler/valuate");
    let request = TaskRequest::Valuate {
        listing_ids: payload.into_ids()?,
    };
    enqueue(&state, &user, request).await
}

async fn status(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskRecord>, AppError> {
    metrics::inc_requests("/api/scheduler/status/{task_id}");
    Ok(Json(state.queue.get(task_id, user.id()).await?))
}

/// Only queued tasks can be cancelled.
async fn cancel(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskRecord>, AppError> {
    metrics::inc_requests("/api/scheduler/cancel/{task_id}");
    Ok(Json(state.queue.cancel(task_id, user.id()).await?))
}

async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<Vec<TaskRecord>>, AppError> {
    metrics::inc_requests("/api/scheduler/tasks");
    Ok(Json(state.queue.list_for_user(user.id()).await?))
}

async fn queue_status(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<QueueStatus>, AppError> {
    metrics::inc_requests("/api/scheduler/queue/status");
    Ok(Json(state.queue.status(user.id()).await?))
}
