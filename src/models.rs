use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;
use uuid::Uuid;

const MAX_QUERY_LEN: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Electronics,
    Vehicles,
    Property,
    Fashion,
    HomeGarden,
    Sports,
    Books,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Electronics => "electronics",
            Category::Vehicles => "vehicles",
            Category::Property => "property",
            Category::Fashion => "fashion",
            Category::HomeGarden => "home_garden",
            Category::Sports => "sports",
            Category::Books => "books",
            Category::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Timeline {
    Urgent,
    #[default]
    Flexible,
    LongTerm,
}

/// Lifecycle of a requirement as seen by its owner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    #[default]
    Active,
    Paused,
    #[serde(alias = "completed")]
    Fulfilled,
    Cancelled,
}

impl RequirementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementStatus::Active => "active",
            RequirementStatus::Paused => "paused",
            RequirementStatus::Fulfilled => "fulfilled",
            RequirementStatus::Cancelled => "cancelled",
        }
    }
}

/// Progress of the latest scrape attempt; independent of [`RequirementStatus`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScrapingStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ScrapingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapingStatus::Pending => "pending",
            ScrapingStatus::InProgress => "in_progress",
            ScrapingStatus::Completed => "completed",
            ScrapingStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    New,
    Contacted,
    Responded,
    Eliminated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Inquiry,
    Negotiation,
    Closing,
    FollowUp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public view of a [`User`]; never carries the API key.
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            created_at: user.created_at,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Requirement {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_query: String,
    pub category: Category,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub deal_breakers: Vec<String>,
    #[serde(default)]
    pub condition_preferences: Vec<String>,
    pub location_lat: Option<f64>,
    pub location_lng: Option<f64>,
    pub location_radius_km: Option<f64>,
    pub status: RequirementStatus,
    pub scraping_status: ScrapingStatus,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub next_scrape_at: Option<DateTime<Utc>>,
    pub total_listings_found: u32,
    pub matching_listings_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRequirement {
    pub product_query: String,
    pub category: Category,
    #[serde(default)]
    pub budget_min: Option<f64>,
    #[serde(default)]
    pub budget_max: Option<f64>,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub deal_breakers: Vec<String>,
    #[serde(default)]
    pub condition_preferences: Vec<String>,
    #[serde(default)]
    pub location_lat: Option<f64>,
    #[serde(default)]
    pub location_lng: Option<f64>,
    #[serde(default)]
    pub location_radius_km: Option<f64>,
}

impl NewRequirement {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_query(&self.product_query)?;
        validate_budget(self.budget_min, self.budget_max)
    }
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequirementUpdate {
    #[serde(default)]
    pub product_query: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub budget_min: Option<f64>,
    #[serde(default)]
    pub budget_max: Option<f64>,
    #[serde(default)]
    pub timeline: Option<Timeline>,
    #[serde(default)]
    pub deal_breakers: Option<Vec<String>>,
    #[serde(default)]
    pub condition_preferences: Option<Vec<String>>,
    #[serde(default)]
    pub location_radius_km: Option<f64>,
    #[serde(default)]
    pub status: Option<RequirementStatus>,
}

impl RequirementUpdate {
    /// True when the edit changes what a scrape would search for.
    pub fn touches_search(&self) -> bool {
        self.product_query.is_some()
            || self.category.is_some()
            || self.budget_min.is_some()
            || self.budget_max.is_some()
            || self.deal_breakers.is_some()
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub id: Uuid,
    pub requirement_id: Uuid,
    pub user_id: Uuid,
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: String,
    pub location: Option<String>,
    pub seller_name: Option<String>,
    pub seller_rating: Option<f64>,
    pub listing_url: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub condition: Option<String>,
    pub status: ListingStatus,
    pub relevance_score: Option<f64>,
    pub price_score: Option<f64>,
    pub condition_score: Option<f64>,
    pub overall_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewListing {
    pub requirement_id: Uuid,
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub seller_name: Option<String>,
    #[serde(default)]
    pub seller_rating: Option<f64>,
    pub listing_url: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub seller_name: Option<String>,
    #[serde(default)]
    pub seller_rating: Option<f64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub status: Option<ListingStatus>,
    #[serde(default)]
    pub relevance_score: Option<f64>,
    #[serde(default)]
    pub price_score: Option<f64>,
    #[serde(default)]
    pub condition_score: Option<f64>,
    #[serde(default)]
    pub overall_score: Option<f64>,
}

impl ListingUpdate {
    pub fn apply(self, listing: &mut Listing, now: DateTime<Utc>) {
        if let Some(v) = self.title {
            listing.title = v;
        }
        if let Some(v) = self.description {
            listing.description = Some(v);
        }
        if let Some(v) = self.price {
            listing.price = Some(v);
        }
        if let Some(v) = self.location {
            listing.location = Some(v);
        }
        if let Some(v) = self.seller_name {
            listing.seller_name = Some(v);
        }
        if let Some(v) = self.seller_rating {
            listing.seller_rating = Some(v);
        }
        if let Some(v) = self.condition {
            listing.condition = Some(v);
        }
        if let Some(v) = self.status {
            listing.status = v;
        }
        if let Some(v) = self.relevance_score {
            listing.relevance_score = Some(v);
        }
        if let Some(v) = self.price_score {
            listing.price_score = Some(v);
        }
        if let Some(v) = self.condition_score {
            listing.condition_score = Some(v);
        }
        if let Some(v) = self.overall_score {
            listing.overall_score = Some(v);
        }
        listing.updated_at = now;
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub message_type: MessageType,
    pub content: String,
    pub response_content: Option<String>,
    pub response_received_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub listing_id: Uuid,
    pub message_type: MessageType,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: default_limit(),
        }
    }
}

impl Page {
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.skip)
            .take(self.limit.min(MAX_PAGE))
            .collect()
    }
}

const MAX_PAGE: usize = 500;

fn default_limit() -> usize {
    100
}

fn default_currency() -> String {
    "INR".to_string()
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("product_query must not be empty")]
    EmptyQuery,
    #[error("product_query exceeds {MAX_QUERY_LEN} characters")]
    QueryTooLong,
    #[error("budget bounds must be positive")]
    NonPositiveBudget,
    #[error("budget_min cannot be greater than budget_max")]
    InvertedBudget,
    #[error("{0} must not be empty")]
    Blank(&'static str),
}

pub fn validate_query(query: &str) -> Result<(), ValidationError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyQuery);
    }
    if trimmed.chars().count() > MAX_QUERY_LEN {
        return Err(ValidationError::QueryTooLong);
    }
    Ok(())
}

pub fn validate_budget(min: Option<f64>, max: Option<f64>) -> Result<(), ValidationError> {
    if min.is_some_and(|v| v <= 0.0) || max.is_some_and(|v| v <= 0.0) {
        return Err(ValidationError::NonPositiveBudget);
    }
    if let (Some(lo), Some(hi)) = (min, max)
        && lo > hi
    {
        return Err(ValidationError::InvertedBudget);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_validation_rules() {
        assert_eq!(validate_budget(None, None), Ok(()));
        assert_eq!(validate_budget(Some(10.0), None), Ok(()));
        assert_eq!(
            validate_budget(Some(50.0), Some(10.0)),
            Err(ValidationError::InvertedBudget)
        );
        assert_eq!(
            validate_budget(Some(0.0), Some(10.0)),
            Err(ValidationError::NonPositiveBudget)
        );
    }

    #[test]
    fn query_validation_rejects_blank_and_long() {
        assert_eq!(validate_query("   "), Err(ValidationError::EmptyQuery));
        assert_eq!(
            validate_query(&"x".repeat(501)),
            Err(ValidationError::QueryTooLong)
        );
        assert!(validate_query("iPhone 12").is_ok());
    }

    #[test]
    fn requirement_status_accepts_legacy_completed() {
        let status: RequirementStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(status, RequirementStatus::Fulfilled);
        let scraping: ScrapingStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(scraping, ScrapingStatus::InProgress);
    }

    #[test]
    fn page_caps_limit() {
        let page = Page {
            skip: 1,
            limit: 2,
        };
        assert_eq!(page.apply(vec![1, 2, 3, 4]), vec![2, 3]);
    }

    #[test]
    fn new_requirement_defaults() {
        let input: NewRequirement = serde_json::from_value(serde_json::json!({
            "product_query": "iPhone 12",
            "category": "electronics"
        }))
        .unwrap();
        assert_eq!(input.timeline, Timeline::Flexible);
        assert!(input.deal_breakers.is_empty());
        assert!(input.validate().is_ok());
    }
}
