use super::{AppError, AppState};
use crate::clock::Clock;
use crate::metrics;
use crate::models::{ListingStatus, Message, NewMessage, ValidationError};
use crate::security::CurrentUser;
use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/messages", post(send))
        .route("/messages/history", get(history))
        .route("/messages/history/{listing_id}", get(thread))
        .route("/messages/{id}/response", post(record_response))
}

#[derive(Debug, Deserialize)]
struct SellerResponse {
    response_content: String,
}

/// Appends a message to a listing's thread. A `new` listing becomes
/// `contacted`.
async fn send(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<NewMessage>,
) -> Result<(StatusCode, Json<Message>), AppError> {
    metrics::inc_requests("/api/messages");
    if payload.content.trim().is_empty() {
        return Err(ValidationError::Blank("content").into());
    }
    let mut listing = state.owned_listing(payload.listing_id, user.id()).await?;
    let now = state.clock.now();
    let message = state
        .store
        .insert_message(Message {
            id: Uuid::new_v4(),
            listing_id: listing.id,
            message_type: payload.message_type,
            content: payload.content,
            response_content: None,
            response_received_at: None,
            created_at: now,
            updated_at: now,
        })
        .await?;
    if listing.status == ListingStatus::New {
        listing.status = ListingStatus::Contacted;
        listing.updated_at = now;
        state.store.save_listing(&listing).await?;
    }
    info!(target = "buysmart.api", message_id = %message.id, listing_id = %listing.id, "message_sent");
    Ok((StatusCode::CREATED, Json(message)))
}

/// Every message on every listing the caller owns, oldest first.
async fn history(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<Vec<Message>>, AppError> {
    metrics::inc_requests("/api/messages/history");
    let mut listing_ids = Vec::new();
    for requirement in state.store.requirements_for_user(user.id()).await? {
        let listings = state.store.listings_for_requirement(requirement.id).await?;
        listing_ids.extend(listings.into_iter().map(|l| l.id));
    }
    if listing_ids.is_empty() {
        return Ok(Json(Vec::new()));
    }
    Ok(Json(state.store.messages_for_listings(&listing_ids).await?))
}

async fn thread(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(listing_id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, AppError> {
    metrics::inc_requests("/api/messages/history/{listing_id}");
    state.owned_listing(listing_id, user.id()).await?;
    Ok(Json(state.store.messages_for_listings(&[listing_id]).await?))
}

/// Stores the seller's reply on a message and marks the listing `responded`.
async fn record_response(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SellerResponse>,
) -> Result<Json<Message>, AppError> {
    metrics::inc_requests("/api/messages/{id}/response");
    if payload.response_content.trim().is_empty() {
        return Err(ValidationError::Blank("response_content").into());
    }
    let mut message = state
        .store
        .get_message(id)
        .await?
        .ok_or(AppError::NotFound("message"))?;
    // ownership follows the listing
    let mut listing = state
        .owned_listing(message.listing_id, user.id())
        .await
        .map_err(|_| AppError::NotFound("message"))?;
    if message.response_content.is_some() {
        return Err(AppError::Conflict("response already recorded".into()));
    }

    let now = state.clock.now();
    message.response_content = Some(payload.response_content);
    message.response_received_at = Some(now);
    message.updated_at = now;
    state.store.save_message(&message).await?;

    if listing.status != ListingStatus::Eliminated {
        listing.status = ListingStatus::Responded;
        listing.updated_at = now;
        state.store.save_listing(&listing).await?;
    }
    Ok(Json(message))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{ALICE_KEY, BOB_KEY, call, scraped_requirement, test_app};
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn thread_round_trip_updates_listing_status() {
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
        let listing_id = listings[0]["id"].as_str().unwrap().to_string();

        let (status, sent) = call(
            &fx.app,
            Method::POST,
            "/api/messages",
            Some(ALICE_KEY),
            Some(json!({
                "listing_id": listing_id,
                "message_type": "inquiry",
                "content": "Is the battery original?",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, listing) = call(
            &fx.app,
            Method::GET,
            &format!("/api/listings/{listing_id}"),
            Some(ALICE_KEY),
            None,
        )
        .await;
        assert_eq!(listing["status"], "contacted");

        let response_uri = format!("/api/messages/{}/response", sent["id"].as_str().unwrap());
        let reply = json!({"response_content": "Yes, 89% health"});
        let (status, _) =
            call(&fx.app, Method::POST, &response_uri, Some(BOB_KEY), Some(reply.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, answered) =
            call(&fx.app, Method::POST, &response_uri, Some(ALICE_KEY), Some(reply.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(answered["response_content"], "Yes, 89% health");
        assert!(answered["response_received_at"].is_string());

        let (status, _) =
            call(&fx.app, Method::POST, &response_uri, Some(ALICE_KEY), Some(reply)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, thread) = call(
            &fx.app,
            Method::GET,
            &format!("/api/messages/history/{listing_id}"),
            Some(ALICE_KEY),
            None,
        )
        .await;
        assert_eq!(thread.as_array().unwrap().len(), 1);

        let (_, history) = call(
            &fx.app,
            Method::GET,
            "/api/messages/history",
            Some(ALICE_KEY),
            None,
        )
        .await;
        assert_eq!(history.as_array().unwrap().len(), 1);
        let (_, empty) = call(&fx.app, Method::GET, "/api/messages/history", Some(BOB_KEY), None).await;
        assert!(empty.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let fx = test_app().await;
        let (status, _) = call(
            &fx.app,
            Method::POST,
            "/api/messages",
            Some(ALICE_KEY),
            Some(json!({
                "listing_id": uuid::Uuid::new_v4(),
                "message_type": "inquiry",
                "content": "  ",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
