use super::{Claim, ClaimKind, Store, StoreError};
use crate::http::build_client;
use crate::lifecycle::ScrapeSchedule;
use crate::models::{Listing, Message, Requirement, ScrapingStatus, User};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use uuid::Uuid;

/// [`Store`] backed by Supabase's PostgREST API.
///
/// Expects `users`, `requirements`, `listings` and `messages` tables whose
/// columns mirror the model structs, with a unique index on
/// `listings(requirement_id, external_id)`.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseStore {
    pub fn new(base_url: &str, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            http: build_client(),
        }
    }

    fn table_url(&self, table: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}/rest/v1/{table}", self.base_url)
        } else {
            format!("{}/rest/v1/{table}?{query}", self.base_url)
        }
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(builder: RequestBuilder) -> Result<Response, StoreError> {
        let response = builder
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let status = response.status();
        if status.as_u16() == 409 {
            return Err(StoreError::Conflict(
                response.text().await.unwrap_or_default(),
            ));
        }
        if !status.is_success() {
            return Err(StoreError::Request(format!("HTTP {status}")));
        }
        Ok(response)
    }

    async fn rows<T: DeserializeOwned>(response: Response) -> Result<Vec<T>, StoreError> {
        response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> Result<Vec<T>, StoreError> {
        let request = self.authed(self.http.get(self.table_url(table, query)));
        Self::rows(Self::send(request).await?).await
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        filter: &str,
    ) -> Result<Option<T>, StoreError> {
        let mut rows = self
            .select(table, &format!("{filter}&select=*&limit=1"))
            .await?;
        Ok(rows.pop())
    }

    async fn insert<T: Serialize + DeserializeOwned>(
        &self,
        table: &str,
        row: &T,
        query: &str,
        prefer: &str,
    ) -> Result<Vec<T>, StoreError> {
        let request = self
            .authed(self.http.post(self.table_url(table, query)))
            .header("Prefer", prefer)
            .json(row);
        Self::rows(Self::send(request).await?).await
    }

    /// PATCH returning the rows that matched `filter`.
    async fn patch<T: DeserializeOwned>(
        &self,
        table: &str,
        filter: &str,
        body: &serde_json::Value,
    ) -> Result<Vec<T>, StoreError> {
        let request = self
            .authed(self.http.patch(self.table_url(table, filter)))
            .header("Prefer", "return=representation")
            .json(body);
        Self::rows(Self::send(request).await?).await
    }

    async fn delete(&self, table: &str, filter: &str) -> Result<usize, StoreError> {
        let request = self
            .authed(self.http.delete(self.table_url(table, filter)))
            .header("Prefer", "return=representation");
        let rows: Vec<serde_json::Value> = Self::rows(Self::send(request).await?).await?;
        Ok(rows.len())
    }

    fn to_value<T: Serialize>(row: &T) -> Result<serde_json::Value, StoreError> {
        serde_json::to_value(row).map_err(|err| StoreError::Deserialize(err.to_string()))
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    urlencoding::encode(&at.to_rfc3339_opts(SecondsFormat::Micros, true)).into_owned()
}

/// PATCH body of a user edit; scrape bookkeeping only with `reset_schedule`.
fn user_edit_body(requirement: &Requirement, reset_schedule: bool) -> serde_json::Value {
    let mut body = json!({
        "product_query": requirement.product_query,
        "category": requirement.category,
        "budget_min": requirement.budget_min,
        "budget_max": requirement.budget_max,
        "timeline": requirement.timeline,
        "deal_breakers": requirement.deal_breakers,
        "condition_preferences": requirement.condition_preferences,
        "location_radius_km": requirement.location_radius_km,
        "status": requirement.status,
        "updated_at": requirement.updated_at,
    });
    if reset_schedule {
        body["scraping_status"] = json!(requirement.scraping_status);
        body["next_scrape_at"] = json!(requirement.next_scrape_at);
    }
    body
}

/// Row filter of the claim CAS.
fn claim_filter(id: Uuid, now: DateTime<Utc>, kind: ClaimKind) -> String {
    let filter = format!("id=eq.{id}&scraping_status=neq.in_progress&status=eq.active");
    match kind {
        ClaimKind::Scheduled => format!("{filter}&next_scrape_at=lte.{}", timestamp(now)),
        ClaimKind::OnDemand => filter,
    }
}

fn id_list(ids: &[Uuid]) -> String {
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl Store for SupabaseStore {
    async fn create_user(&self, user: User) -> Result<User, StoreError> {
        let taken: Option<User> = self
            .select_one(
                "users",
                &format!("email=ilike.{}", urlencoding::encode(&user.email)),
            )
            .await?;
        if taken.is_some() {
            return Err(StoreError::Conflict("email already registered".into()));
        }
        let mut rows = self
            .insert("users", &user, "", "return=representation")
            .await?;
        rows.pop()
            .ok_or_else(|| StoreError::Deserialize("insert returned no rows".into()))
    }

    async fn user_by_api_key(&self, api_key: &str) -> Result<Option<User>, StoreError> {
        self.select_one(
            "users",
            &format!("api_key=eq.{}", urlencoding::encode(api_key)),
        )
        .await
    }

    async fn insert_requirement(
        &self,
        requirement: Requirement,
    ) -> Result<Requirement, StoreError> {
        requirement.check_invariants()?;
        let mut rows = self
            .insert("requirements", &requirement, "", "return=representation")
            .await?;
        rows.pop()
            .ok_or_else(|| StoreError::Deserialize("insert returned no rows".into()))
    }

    async fn get_requirement(&self, id: Uuid) -> Result<Option<Requirement>, StoreError> {
        self.select_one("requirements", &format!("id=eq.{id}")).await
    }

    async fn requirements_for_user(&self, user_id: Uuid) -> Result<Vec<Requirement>, StoreError> {
        self.select(
            "requirements",
            &format!("user_id=eq.{user_id}&select=*&order=created_at.desc"),
        )
        .await
    }

    async fn save_requirement(
        &self,
        requirement: &Requirement,
        reset_schedule: bool,
    ) -> Result<Requirement, StoreError> {
        requirement.check_invariants()?;
        let body = user_edit_body(requirement, reset_schedule);
        let mut filter = format!("id=eq.{}", requirement.id);
        if reset_schedule {
            filter.push_str("&scraping_status=neq.in_progress");
        }
        let mut rows: Vec<Requirement> = self.patch("requirements", &filter, &body).await?;
        if let Some(saved) = rows.pop() {
            return Ok(saved);
        }
        match self.get_requirement(requirement.id).await? {
            Some(_) => Err(StoreError::Conflict("a scrape is in progress".into())),
            None => Err(StoreError::NotFound("requirement")),
        }
    }

    async fn delete_requirement(&self, id: Uuid) -> Result<bool, StoreError> {
        let listings: Vec<Listing> = self
            .select("listings", &format!("requirement_id=eq.{id}&select=*"))
            .await?;
        if !listings.is_empty() {
            let ids: Vec<Uuid> = listings.iter().map(|l| l.id).collect();
            self.delete("messages", &format!("listing_id=in.({})", id_list(&ids)))
                .await?;
            self.delete("listings", &format!("requirement_id=eq.{id}"))
                .await?;
        }
        Ok(self.delete("requirements", &format!("id=eq.{id}")).await? > 0)
    }

    async fn due_requirements(&self, now: DateTime<Utc>) -> Result<Vec<Requirement>, StoreError> {
        self.select(
            "requirements",
            &format!(
                "status=eq.active&next_scrape_at=lte.{}&select=*&order=next_scrape_at.asc",
                timestamp(now)
            ),
        )
        .await
    }

    async fn claim_for_scrape(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        kind: ClaimKind,
    ) -> Result<Claim, StoreError> {
        let body = json!({
            "scraping_status": ScrapingStatus::InProgress,
            "updated_at": now,
        });
        let mut rows: Vec<Requirement> = self
            .patch("requirements", &claim_filter(id, now, kind), &body)
            .await?;
        if let Some(claimed) = rows.pop() {
            return Ok(Claim::Claimed(claimed));
        }
        Ok(match self.get_requirement(id).await? {
            Some(current) if current.scraping_status == ScrapingStatus::InProgress => Claim::Busy,
            Some(_) => Claim::Ineligible,
            None => Claim::Missing,
        })
    }

    async fn record_scrape_result(&self, requirement: &Requirement) -> Result<(), StoreError> {
        requirement.check_invariants()?;
        let body = json!({
            "scraping_status": requirement.scraping_status,
            "last_scraped_at": requirement.last_scraped_at,
            "next_scrape_at": requirement.next_scrape_at,
            "total_listings_found": requirement.total_listings_found,
            "matching_listings_count": requirement.matching_listings_count,
            "updated_at": requirement.updated_at,
        });
        let rows: Vec<Requirement> = self
            .patch(
                "requirements",
                &format!("id=eq.{}&scraping_status=eq.in_progress", requirement.id),
                &body,
            )
            .await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound("requirement"));
        }
        Ok(())
    }

    async fn release_claim(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        schedule: &ScrapeSchedule,
    ) -> Result<bool, StoreError> {
        let body = json!({
            "scraping_status": ScrapingStatus::Failed,
            "next_scrape_at": now + schedule.retry_interval,
            "updated_at": now,
        });
        let rows: Vec<Requirement> = self
            .patch(
                "requirements",
                &format!("id=eq.{id}&scraping_status=eq.in_progress"),
                &body,
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let body = json!({
            "scraping_status": ScrapingStatus::Failed,
            "next_scrape_at": now,
            "updated_at": now,
        });
        let rows: Vec<Requirement> = self
            .patch("requirements", "scraping_status=eq.in_progress", &body)
            .await?;
        Ok(rows.len())
    }

    async fn insert_listing_if_absent(&self, listing: Listing) -> Result<bool, StoreError> {
        let rows = self
            .insert(
                "listings",
                &listing,
                "on_conflict=requirement_id,external_id",
                "resolution=ignore-duplicates,return=representation",
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
        self.select_one("listings", &format!("id=eq.{id}")).await
    }

    async fn listings_for_requirement(
        &self,
        requirement_id: Uuid,
    ) -> Result<Vec<Listing>, StoreError> {
        self.select(
            "listings",
            &format!("requirement_id=eq.{requirement_id}&select=*&order=created_at.asc"),
        )
        .await
    }

    async fn save_listing(&self, listing: &Listing) -> Result<(), StoreError> {
        let body = Self::to_value(listing)?;
        let rows: Vec<Listing> = self
            .patch("listings", &format!("id=eq.{}", listing.id), &body)
            .await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound("listing"));
        }
        Ok(())
    }

    async fn delete_listing(&self, id: Uuid) -> Result<bool, StoreError> {
        self.delete("messages", &format!("listing_id=eq.{id}"))
            .await?;
        Ok(self.delete("listings", &format!("id=eq.{id}")).await? > 0)
    }

    async fn insert_message(&self, message: Message) -> Result<Message, StoreError> {
        let mut rows = self
            .insert("messages", &message, "", "return=representation")
            .await?;
        rows.pop()
            .ok_or_else(|| StoreError::Deserialize("insert returned no rows".into()))
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        self.select_one("messages", &format!("id=eq.{id}")).await
    }

    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        let body = Self::to_value(message)?;
        let rows: Vec<Message> = self
            .patch("messages", &format!("id=eq.{}", message.id), &body)
            .await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound("message"));
        }
        Ok(())
    }

    async fn messages_for_listings(
        &self,
        listing_ids: &[Uuid],
    ) -> Result<Vec<Message>, StoreError> {
        if listing_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select(
            "messages",
            &format!(
                "listing_id=in.({})&select=*&order=created_at.asc",
                id_list(listing_ids)
            ),
        )
        .await
    }
}
