use super::{AppError, AppState};
use crate::advisor::{ListingAnalysis, ListingComparison, Valuation};
use crate::clock::Clock;
use crate::metrics;
use crate::models::{Listing, ListingStatus, ListingUpdate, NewListing, ValidationError};
use crate::security::CurrentUser;
use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

const MAX_COMPARED: usize = 5;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/listings", post(create))
        .route("/listings/compare", post(compare))
        .route("/listings/{id}", get(fetch).patch(update).delete(remove))
        .route("/listings/{id}/analyze", post(analyze))
        .route("/listings/{id}/valuate", post(valuate))
}

fn require_text(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Blank(field));
    }
    Ok(())
}

/// Records a listing the user found by hand under one of their requirements.
async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<NewListing>,
) -> Result<(StatusCode, Json<Listing>), AppError> {
    metrics::inc_requests("/api/listings");
    require_text(&payload.external_id, "external_id")?;
    require_text(&payload.title, "title")?;
    require_text(&payload.listing_url, "listing_url")?;
    let requirement = state
        .owned_requirement(payload.requirement_id, user.id())
        .await?;

    let now = state.clock.now();
    let listing = Listing {
        id: Uuid::new_v4(),
        requirement_id: requirement.id,
        user_id: requirement.user_id,
        external_id: payload.external_id.trim().to_string(),
        title: payload.title.trim().to_string(),
        description: payload.description,
        price: payload.price,
        currency: payload.currency,
        location: payload.location,
        seller_name: payload.seller_name,
        seller_rating: payload.seller_rating,
        listing_url: payload.listing_url,
        image_urls: payload.image_urls,
        condition: payload.condition,
        status: ListingStatus::New,
        relevance_score: None,
        price_score: None,
        condition_score: None,
        overall_score: None,
        created_at: now,
        updated_at: now,
    };
    if !state.store.insert_listing_if_absent(listing.clone()).await? {
        return Err(AppError::Conflict(format!(
            "listing {} already recorded for this requirement",
            listing.external_id
        )));
    }
    info!(target = "buysmart.api", listing_id = %listing.id, "listing_created");
    Ok((StatusCode::CREATED, Json(listing)))
}

async fn fetch(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Listing>, AppError> {
    metrics::inc_requests("/api/listings/{id}");
    Ok(Json(state.owned_listing(id, user.id()).await?))
}

async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ListingUpdate>,
) -> Result<Json<Listing>, AppError> {
    metrics::inc_requests("/api/listings/{id}");
    if let Some(title) = &payload.title {
        require_text(title, "title")?;
    }
    let mut listing = state.owned_listing(id, user.id()).await?;
    payload.apply(&mut listing, state.clock.now());
    state.store.save_listing(&listing).await?;
    Ok(Json(listing))
}

async fn remove(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    metrics::inc_requests("/api/listings/{id}");
    state.owned_listing(id, user.id()).await?;
    if !state.store.delete_listing(id).await? {
        return Err(AppError::NotFound("listing"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn analyze(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<ListingAnalysis>, AppError> {
    metrics::inc_requests("/api/listings/{id}/analyze");
    Ok(Json(state.advisor.analyze(id, user.id()).await?))
}

async fn valuate(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Valuation>, AppError> {
    metrics::inc_requests("/api/listings/{id}/valuate");
    Ok(Json(state.advisor.valuate(id, user.id()).await?))
}

#[derive(Debug, Deserialize)]
struct CompareRequest {
    listing_ids: Vec<Uuid>,
}

/// Ranks two to five owned listings by asking price against estimated value.
async fn compare(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<CompareRequest>,
) -> Result<Json<ListingComparison>, AppError> {
    metrics::inc_requests("/api/listings/compare");
    let mut seen = HashSet::new();
    let mut ids = payload.listing_ids;
    ids.retain(|id| seen.insert(*id));
    if !(2..=MAX_COMPARED).contains(&ids.len()) {
        return Err(AppError::BadRequest(format!(
            "compare between 2 and {MAX_COMPARED} distinct listings"
        )));
    }
    Ok(Json(state.advisor.compare(&ids, user.id()).await?))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{ALICE_KEY, BOB_KEY, call, scraped_requirement, test_app};
    use axum::http::{Method, StatusCode};
    use serde_json::{Value, json};

    fn manual_listing(requirement_id: &str) -> Value {
        json!({
            "requirement_id": requirement_id,
            "external_id": "manual-1",
            "title": "iPhone 12 128GB boxed",
            "price": 38000.0,
            "listing_url": "https://example.com/manual-1",
        })
    }

    #[tokio::test]
    async fn manual_listing_lifecycle() {
        let fx = test_app().await;
        let requirement = scraped_requirement(&fx.app, ALICE_KEY).await;
        let requirement_id = requirement["id"].as_str().unwrap();

        let (status, created) = call(
            &fx.app,
            Method::POST,
            "/api/listings",
            Some(ALICE_KEY),
            Some(manual_listing(requirement_id)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["currency"], "INR");
        assert_eq!(created["status"], "new");

        let (status, _) = call(
            &fx.app,
            Method::POST,
            "/api/listings",
            Some(ALICE_KEY),
            Some(manual_listing(requirement_id)),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let uri = format!("/api/listings/{}", created["id"].as_str().unwrap());
        let (status, patched) = call(
            &fx.app,
            Method::PATCH,
            &uri,
            Some(ALICE_KEY),
            Some(json!({"status": "contacted", "seller_rating": 4.5})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["status"], "contacted");
        assert_eq!(patched["seller_rating"], 4.5);

        let (status, _) = call(&fx.app, Method::GET, &uri, Some(BOB_KEY), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&fx.app, Method::DELETE, &uri, Some(ALICE_KEY), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&fx.app, Method::GET, &uri, Some(ALICE_KEY), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listing_under_foreign_requirement_is_refused() {
        let fx = test_app().await;
        let requirement = scraped_requirement(&fx.app, ALICE_KEY).await;
        let (status, _) = call(
            &fx.app,
            Method::POST,
            "/api/listings",
            Some(BOB_KEY),
            Some(manual_listing(requirement["id"].as_str().unwrap())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn analyze_persists_scores_and_valuate_reports_verdict() {
        let fx = test_app().await;
        let requirement = scraped_requirement(&fx.app, ALICE_KEY).await;
        let (_, listings) = call(
            &fx.app,
            Method::GET,
            &format!(
                "/api/requirements/{}/listings",
                requirement["id"].as_str().unwrap()
            ),
            Some(ALICE_KEY),
            None,
        )
        .await;
        let listing_uri = format!("/api/listings/{}", listings[0]["id"].as_str().unwrap());

        let (status, analysis) = call(
            &fx.app,
            Method::POST,
            &format!("{listing_uri}/analyze"),
            Some(ALICE_KEY),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(analysis["source"], "heuristic");

        let (_, stored) = call(&fx.app, Method::GET, &listing_uri, Some(ALICE_KEY), None).await;
        assert_eq!(stored["overall_score"], analysis["overall_score"]);

        let (status, valuation) = call(
            &fx.app,
            Method::POST,
            &format!("{listing_uri}/valuate"),
            Some(ALICE_KEY),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(valuation["verdict"].is_string());

        let (status, _) = call(
            &fx.app,
            Method::POST,
            &format!("{listing_uri}/analyze"),
            Some(BOB_KEY),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn compare_ranks_owned_listings() {
        let fx = test_app().await;
        let requirement = scraped_requirement(&fx.app, ALICE_KEY).await;
        let requirement_id = requirement["id"].as_str().unwrap();
        let (_, scraped) = call(
            &fx.app,
            Method::GET,
            &format!("/api/requirements/{requirement_id}/listings"),
            Some(ALICE_KEY),
            None,
        )
        .await;
        let (_, manual) = call(
            &fx.app,
            Method::POST,
            "/api/listings",
            Some(ALICE_KEY),
            Some(manual_listing(requirement_id)),
        )
        .await;
        let ids = json!([scraped[0]["id"], manual["id"]]);

        let (status, comparison) = call(
            &fx.app,
            Method::POST,
            "/api/listings/compare",
            Some(ALICE_KEY),
            Some(json!({"listing_ids": ids})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(comparison["listings"].as_array().unwrap().len(), 2);
        assert!(comparison["best_value"].is_string());
        assert_eq!(comparison["price_range"]["min"], 35000.0);
        assert_eq!(comparison["price_range"]["max"], 38000.0);

        let (status, _) = call(
            &fx.app,
            Method::POST,
            "/api/listings/compare",
            Some(ALICE_KEY),
            Some(json!({"listing_ids": [manual["id"], manual["id"]]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &fx.app,
            Method::POST,
            "/api/listings/compare",
            Some(BOB_KEY),
            Some(json!({"listing_ids": ids})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
