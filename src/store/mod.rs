//! Persistence for users, requirements, listings and message threads.
//!
//! The scraping bookkeeping of a requirement is only written through
//! [`Store::claim_for_scrape`], [`Store::record_scrape_result`],
//! [`Store::release_claim`] and [`Store::recover_interrupted`]. User edits go
//! through [`Store::save_requirement`], which writes the user-editable
//! columns only.

pub mod memory;
pub mod supabase;

use crate::lifecycle::{ScrapeSchedule, TransitionError};
use crate::models::{Listing, Message, Requirement, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Invariant(#[from] TransitionError),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Result of the compare-and-swap into `in_progress`.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    Claimed(Requirement),
    /// Another trigger holds the requirement.
    Busy,
    /// Paused or closed, or not yet due for a scheduled claim.
    Ineligible,
    Missing,
}

/// Who is asking for the claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// The periodic loop: the requirement must be active and due.
    Scheduled,
    /// A user or task asked for it: the requirement must be active.
    OnDemand,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the email is taken.
    async fn create_user(&self, user: User) -> Result<User, StoreError>;
    async fn user_by_api_key(&self, api_key: &str) -> Result<Option<User>, StoreError>;

    async fn insert_requirement(&self, requirement: Requirement)
    -> Result<Requirement, StoreError>;
    async fn get_requirement(&self, id: Uuid) -> Result<Option<Requirement>, StoreError>;
    /// Newest first.
    async fn requirements_for_user(&self, user_id: Uuid) -> Result<Vec<Requirement>, StoreError>;
    /// Writes the user-editable columns of `requirement` and returns the
    /// stored row. With `reset_schedule` the scraping status and
    /// `next_scrape_at` are written too, refused while a scrape holds the row.
    async fn save_requirement(
        &self,
        requirement: &Requirement,
        reset_schedule: bool,
    ) -> Result<Requirement, StoreError>;
    /// Removes the requirement with its listings and their messages.
    async fn delete_requirement(&self, id: Uuid) -> Result<bool, StoreError>;
    /// Active requirements with `next_scrape_at <= now`, oldest due first.
    async fn due_requirements(&self, now: DateTime<Utc>) -> Result<Vec<Requirement>, StoreError>;
    async fn claim_for_scrape(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        kind: ClaimKind,
    ) -> Result<Claim, StoreError>;
    /// Persists the terminal state of a claimed scrape in one write.
    async fn record_scrape_result(&self, requirement: &Requirement) -> Result<(), StoreError>;
    /// Gives up a claim whose result could not be written: `in_progress`
    /// becomes `failed`, retried after `schedule.retry_interval`. Returns
    /// whether the row was still claimed.
    async fn release_claim(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        schedule: &ScrapeSchedule,
    ) -> Result<bool, StoreError>;
    /// Moves rows stuck `in_progress` (previous process died) to `failed`,
    /// due immediately. Returns how many were moved.
    async fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Inserts unless (`requirement_id`, `external_id`) already exists.
    async fn insert_listing_if_absent(&self, listing: Listing) -> Result<bool, StoreError>;
    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, StoreError>;
    async fn listings_for_requirement(
        &self,
        requirement_id: Uuid,
    ) -> Result<Vec<Listing>, StoreError>;
    async fn save_listing(&self, listing: &Listing) -> Result<(), StoreError>;
    async fn delete_listing(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn insert_message(&self, message: Message) -> Result<Message, StoreError>;
    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError>;
    async fn save_message(&self, message: &Message) -> Result<(), StoreError>;
    /// Oldest first.
    async fn messages_for_listings(&self, listing_ids: &[Uuid])
    -> Result<Vec<Message>, StoreError>;
}
