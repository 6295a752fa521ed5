use super::{AppError, AppState};
use crate::metrics;
use crate::models::{Category, validate_query};
use crate::scraper::ScrapedListing;
use axum::{Json, Router, extract::State, routing::post};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const MAX_BATCH_QUERIES: usize = 5;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/scraper/search", post(search))
        .route("/scraper/search/batch", post(search_batch))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    category: Option<Category>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    source: &'static str,
    count: usize,
    listings: Vec<ScrapedListing>,
}

/// Ad hoc marketplace search. Nothing is persisted and no matching is applied.
async fn search(
    State(state): State<AppState>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    metrics::inc_requests("/api/scraper/search");
    validate_query(&payload.query)?;
    let scraper = state.runner.scraper();
    let listings = scraper
        .search(
            payload.query.trim(),
            payload.category.unwrap_or(Category::Other),
        )
        .await?;
    info!(
        target = "buysmart.api",
        source = scraper.source_name(),
        count = listings.len(),
        "adhoc_search"
    );
    Ok(Json(SearchResponse {
        source: scraper.source_name(),
        count: listings.len(),
        listings,
    }))
}

#[derive(Debug, Deserialize)]
struct BatchSearchRequest {
    queries: Vec<String>,
    #[serde(default)]
    category: Option<Category>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum QueryResult {
    Success {
        query: String,
        count: usize,
        listings: Vec<ScrapedListing>,
    },
    Error {
        query: String,
        error: String,
    },
}

#[derive(Debug, Serialize)]
struct BatchSearchResponse {
    source: &'static str,
    total_listings_found: usize,
    results: Vec<QueryResult>,
}

/// Runs up to five ad hoc searches one after another. A failing query is
/// reported in place and does not fail the batch.
async fn search_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchSearchRequest>,
) -> Result<Json<BatchSearchResponse>, AppError> {
    metrics::inc_requests("/api/scraper/search/batch");
    if payload.queries.is_empty() || payload.queries.len() > MAX_BATCH_QUERIES {
        return Err(AppError::BadRequest(format!(
            "send between 1 and {MAX_BATCH_QUERIES} queries"
        )));
    }
    for query in &payload.queries {
        validate_query(query)?;
    }

    let scraper = state.runner.scraper();
    let category = payload.category.unwrap_or(Category::Other);
    let mut total = 0;
    let mut results = Vec::with_capacity(payload.queries.len());
    for query in payload.queries {
        let query = query.trim().to_string();
        match scraper.search(&query, category).await {
            Ok(listings) => {
                total += listings.len();
                results.push(QueryResult::Success {
                    query,
                    count: listings.len(),
                    listings,
                });
            }
            Err(err) => {
                warn!(target = "buysmart.api", %query, error = %err, "batch_query_failed");
                results.push(QueryResult::Error {
                    query,
                    error: err.to_string(),
                });
            }
        }
    }
    info!(
        target = "buysmart.api",
        source = scraper.source_name(),
        queries = results.len(),
        total,
        "adhoc_batch_search"
    );
    Ok(Json(BatchSearchResponse {
        source: scraper.source_name(),
        total_listings_found: total,
        results,
    }))
}
