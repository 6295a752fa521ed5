use super::{Claim, ClaimKind, Store, StoreError};
use crate::lifecycle::ScrapeSchedule;
use crate::models::{Listing, Message, Requirement, ScrapingStatus, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    requirements: HashMap<Uuid, Requirement>,
    listings: HashMap<Uuid, Listing>,
    messages: HashMap<Uuid, Message>,
}

/// Process-local store. Every method takes the single table lock, so each
/// call is atomic with respect to the others.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, user: User) -> Result<User, StoreError> {
        let mut guard = self.tables.lock().await;
        if guard
            .users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(StoreError::Conflict("email already registered".into()));
        }
        guard.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn user_by_api_key(&self, api_key: &str) -> Result<Option<User>, StoreError> {
        let guard = self.tables.lock().await;
        Ok(guard.users.values().find(|u| u.api_key == api_key).cloned())
    }

    async fn insert_requirement(
        &self,
        requirement: Requirement,
    ) -> Result<Requirement, StoreError> {
        requirement.check_invariants()?;
        let mut guard = self.tables.lock().await;
        guard.requirements.insert(requirement.id, requirement.clone());
        Ok(requirement)
    }

    async fn get_requirement(&self, id: Uuid) -> Result<Option<Requirement>, StoreError> {
        let guard = self.tables.lock().await;
        Ok(guard.requirements.get(&id).cloned())
    }

    async fn requirements_for_user(&self, user_id: Uuid) -> Result<Vec<Requirement>, StoreError> {
        let guard = self.tables.lock().await;
        let mut rows: Vec<Requirement> = guard
            .requirements
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn save_requirement(
        &self,
        requirement: &Requirement,
        reset_schedule: bool,
    ) -> Result<Requirement, StoreError> {
        requirement.check_invariants()?;
        let mut guard = self.tables.lock().await;
        let stored = guard
            .requirements
            .get_mut(&requirement.id)
            .ok_or(StoreError::NotFound("requirement"))?;
        if reset_schedule && stored.scraping_status == ScrapingStatus::InProgress {
            return Err(StoreError::Conflict("a scrape is in progress".into()));
        }
        stored.merge_user_edit(requirement, reset_schedule);
        Ok(stored.clone())
    }

    async fn delete_requirement(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut guard = self.tables.lock().await;
        if guard.requirements.remove(&id).is_none() {
            return Ok(false);
        }
        let listing_ids: Vec<Uuid> = guard
            .listings
            .values()
            .filter(|l| l.requirement_id == id)
            .map(|l| l.id)
            .collect();
        for listing_id in &listing_ids {
            guard.listings.remove(listing_id);
        }
        guard
            .messages
            .retain(|_, m| !listing_ids.contains(&m.listing_id));
        Ok(true)
    }

    async fn due_requirements(&self, now: DateTime<Utc>) -> Result<Vec<Requirement>, StoreError> {
        let guard = self.tables.lock().await;
        let mut rows: Vec<Requirement> = guard
            .requirements
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.next_scrape_at);
        Ok(rows)
    }

    async fn claim_for_scrape(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        kind: ClaimKind,
    ) -> Result<Claim, StoreError> {
        let mut guard = self.tables.lock().await;
        let Some(stored) = guard.requirements.get_mut(&id) else {
            return Ok(Claim::Missing);
        };
        if stored.scraping_status == ScrapingStatus::InProgress {
            return Ok(Claim::Busy);
        }
        if !stored.is_claimable(kind, now) {
            return Ok(Claim::Ineligible);
        }
        stored.mark_in_progress(now)?;
        Ok(Claim::Claimed(stored.clone()))
    }

    async fn record_scrape_result(&self, requirement: &Requirement) -> Result<(), StoreError> {
        requirement.check_invariants()?;
        let mut guard = self.tables.lock().await;
        let stored = guard
            .requirements
            .get_mut(&requirement.id)
            .ok_or(StoreError::NotFound("requirement"))?;
        if stored.scraping_status != ScrapingStatus::InProgress {
            return Err(StoreError::Conflict("requirement is not being scraped".into()));
        }
        stored.scraping_status = requirement.scraping_status;
        stored.last_scraped_at = requirement.last_scraped_at;
        stored.next_scrape_at = requirement.next_scrape_at;
        stored.total_listings_found = requirement.total_listings_found;
        stored.matching_listings_count = requirement.matching_listings_count;
        stored.updated_at = requirement.updated_at;
        Ok(())
    }

    async fn release_claim(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        schedule: &ScrapeSchedule,
    ) -> Result<bool, StoreError> {
        let mut guard = self.tables.lock().await;
        match guard.requirements.get_mut(&id) {
            Some(stored) if stored.scraping_status == ScrapingStatus::InProgress => {
                stored.mark_failed(now, schedule)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut guard = self.tables.lock().await;
        let mut moved = 0;
        for requirement in guard
            .requirements
            .values_mut()
            .filter(|r| r.scraping_status == ScrapingStatus::InProgress)
        {
            match requirement.mark_interrupted(now) {
                Ok(()) => moved += 1,
                Err(err) => {
                    warn!(target = "buysmart.store", requirement_id = %requirement.id, error = %err, "recover_failed")
                }
            }
        }
        Ok(moved)
    }

    async fn insert_listing_if_absent(&self, listing: Listing) -> Result<bool, StoreError> {
        let mut guard = self.tables.lock().await;
        let duplicate = guard.listings.values().any(|l| {
            l.requirement_id == listing.requirement_id && l.external_id == listing.external_id
        });
        if duplicate {
            return Ok(false);
        }
        guard.listings.insert(listing.id, listing);
        Ok(true)
    }

    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
        let guard = self.tables.lock().await;
        Ok(guard.listings.get(&id).cloned())
    }

    async fn listings_for_requirement(
        &self,
        requirement_id: Uuid,
    ) -> Result<Vec<Listing>, StoreError> {
        let guard = self.tables.lock().await;
        let mut rows: Vec<Listing> = guard
            .listings
            .values()
            .filter(|l| l.requirement_id == requirement_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.title.cmp(&b.title)));
        Ok(rows)
    }

    async fn save_listing(&self, listing: &Listing) -> Result<(), StoreError> {
        let mut guard = self.tables.lock().await;
        let stored = guard
            .listings
            .get_mut(&listing.id)
            .ok_or(StoreError::NotFound("listing"))?;
        *stored = listing.clone();
        Ok(())
    }

    async fn delete_listing(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut guard = self.tables.lock().await;
        let removed = guard.listings.remove(&id).is_some();
        if removed {
            guard.messages.retain(|_, m| m.listing_id != id);
        }
        Ok(removed)
    }

    async fn insert_message(&self, message: Message) -> Result<Message, StoreError> {
        let mut guard = self.tables.lock().await;
        if !guard.listings.contains_key(&message.listing_id) {
            return Err(StoreError::NotFound("listing"));
        }
        guard.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let guard = self.tables.lock().await;
        Ok(guard.messages.get(&id).cloned())
    }

    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut guard = self.tables.lock().await;
        let stored = guard
            .messages
            .get_mut(&message.id)
            .ok_or(StoreError::NotFound("message"))?;
        *stored = message.clone();
        Ok(())
    }

    async fn messages_for_listings(
        &self,
        listing_ids: &[Uuid],
    ) -> Result<Vec<Message>, StoreError> {
        let guard = self.tables.lock().await;
        let mut rows: Vec<Message> = guard
            .messages
            .values()
            .filter(|m| listing_ids.contains(&m.listing_id))
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }
}
