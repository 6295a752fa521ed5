use super::{AppError, AppState};
use crate::clock::Clock;
use crate::metrics;
use crate::models::{
    Listing, NewRequirement, Page, Requirement, RequirementStatus, RequirementUpdate,
};
use crate::scraping::{ScrapeOutcome, SkipReason};
use crate::security::CurrentUser;
use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use tracing::info;
use uuid::Uuid;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/requirements", post(create).get(list))
        .route(
            "/requirements/{id}",
            get(fetch).put(update).delete(remove),
        )
        .route("/requirements/{id}/listings", get(listings))
        .route("/requirements/{id}/scrape", post(scrape_now))
}

/// Stores the requirement and kicks off its first scrape in the background.
async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<NewRequirement>,
) -> Result<(StatusCode, Json<Requirement>), AppError> {
    metrics::inc_requests("/api/requirements");
    let requirement = Requirement::create(
        user.id(),
        payload,
        state.clock.now(),
        state.runner.schedule(),
    )?;
    let requirement = state.store.insert_requirement(requirement).await?;
    info!(
        target = "buysmart.api",
        requirement_id = %requirement.id,
        user_id = %user.id(),
        "requirement_created"
    );
    state.runner.trigger_detached(requirement.id);
    Ok((StatusCode::CREATED, Json(requirement)))
}

async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<Requirement>>, AppError> {
    metrics::inc_requests("/api/requirements");
    let rows = state.store.requirements_for_user(user.id()).await?;
    Ok(Json(page.apply(rows)))
}

async fn fetch(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Requirement>, AppError> {
    metrics::inc_requests("/api/requirements/{id}");
    Ok(Json(state.owned_requirement(id, user.id()).await?))
}

/// Applies a partial edit. Search-relevant changes reset the requirement to
/// `pending` and trigger a fresh scrape.
async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RequirementUpdate>,
) -> Result<Json<Requirement>, AppError> {
    metrics::inc_requests("/api/requirements/{id}");
    let mut requirement = state.owned_requirement(id, user.id()).await?;
    let rescrape =
        requirement.apply_update(payload, state.clock.now(), state.runner.schedule())?;
    let saved = state.store.save_requirement(&requirement, rescrape).await?;
    if rescrape {
        info!(target = "buysmart.api", requirement_id = %id, "requirement_reset_for_scrape");
        state.runner.trigger_detached(id);
    }
    Ok(Json(saved))
}

async fn remove(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    metrics::inc_requests("/api/requirements/{id}");
    state.owned_requirement(id, user.id()).await?;
    if !state.store.delete_requirement(id).await? {
        return Err(AppError::NotFound("requirement"));
    }
    info!(target = "buysmart.api", requirement_id = %id, "requirement_deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn listings(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<Listing>>, AppError> {
    metrics::inc_requests("/api/requirements/{id}/listings");
    state.owned_requirement(id, user.id()).await?;
    let rows = state.store.listings_for_requirement(id).await?;
    Ok(Json(page.apply(rows)))
}

/// Runs one scrape inline and reports what it did.
async fn scrape_now(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScrapeOutcome>, AppError> {
    metrics::inc_requests("/api/requirements/{id}/scrape");
    let requirement = state.owned_requirement(id, user.id()).await?;
    if requirement.status != RequirementStatus::Active {
        return Err(AppError::Conflict(format!(
            "requirement is {}",
            requirement.status.as_str()
        )));
    }
    match state.runner.trigger(id).await {
        ScrapeOutcome::Skipped {
            reason: SkipReason::AlreadyRunning,
        } => Err(AppError::Conflict("a scrape is already in progress".into())),
        ScrapeOutcome::Skipped {
            reason: SkipReason::NotFound,
        } => Err(AppError::NotFound("requirement")),
        ScrapeOutcome::Skipped {
            reason: SkipReason::Ineligible,
        } => Err(AppError::Conflict("requirement is no longer active".into())),
        ScrapeOutcome::Skipped {
            reason: SkipReason::StoreUnavailable,
        } => Err(AppError::Internal("store unavailable during scrape".into())),
        outcome => Ok(Json(outcome)),
    }
}
