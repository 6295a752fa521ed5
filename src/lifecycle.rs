//! Scraping state machine for requirements.
//!
//! ```text
//! pending ──► in_progress ──► completed ─┐
//!    ▲             ▲     └──► failed ────┤
//!    │             └─────────────────────┘  (next eligible pass)
//!    └── user reset (resume / search edit), never while in_progress
//! ```
//!
//! Every transition goes through [`Requirement`] methods so the
//! `pending ⇒ next_scrape_at.is_some()` invariant cannot be bypassed.

use crate::models::{
    NewRequirement, Requirement, RequirementStatus, RequirementUpdate, ScrapingStatus,
    ValidationError, validate_budget, validate_query,
};
use crate::store::ClaimKind;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Delays applied after each terminal scrape state.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeSchedule {
    pub success_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for ScrapeSchedule {
    fn default() -> Self {
        Self {
            success_interval: Duration::hours(24),
            retry_interval: Duration::hours(1),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot move scraping status from {from} to {to}")]
    Invalid {
        from: &'static str,
        to: &'static str,
    },
    #[error("pending requirements must carry next_scrape_at")]
    PendingWithoutSchedule,
    #[error("a scrape is already in progress")]
    InProgress,
}

impl ScrapingStatus {
    pub fn can_transition_to(self, next: ScrapingStatus) -> bool {
        use ScrapingStatus::*;
        matches!(
            (self, next),
            (Pending | Completed | Failed, InProgress)
                | (InProgress, Completed | Failed)
                | (Completed | Failed | Pending, Pending)
        )
    }
}

/// Counters recorded by a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassCounts {
    pub total: u32,
    pub matching: u32,
}

impl Requirement {
    pub fn create(
        user_id: Uuid,
        input: NewRequirement,
        now: DateTime<Utc>,
        schedule: &ScrapeSchedule,
    ) -> Result<Self, ValidationError> {
        input.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            product_query: input.product_query.trim().to_string(),
            category: input.category,
            budget_min: input.budget_min,
            budget_max: input.budget_max,
            timeline: input.timeline,
            deal_breakers: clean_keywords(input.deal_breakers),
            condition_preferences: clean_keywords(input.condition_preferences),
            location_lat: input.location_lat,
            location_lng: input.location_lng,
            location_radius_km: input.location_radius_km,
            status: RequirementStatus::Active,
            scraping_status: ScrapingStatus::Pending,
            last_scraped_at: None,
            next_scrape_at: Some(now + schedule.success_interval),
            total_listings_found: 0,
            matching_listings_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rejects any state that breaks the scheduling invariant.
    pub fn check_invariants(&self) -> Result<(), TransitionError> {
        if self.scraping_status == ScrapingStatus::Pending && self.next_scrape_at.is_none() {
            return Err(TransitionError::PendingWithoutSchedule);
        }
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RequirementStatus::Active
            && self.next_scrape_at.is_some_and(|at| at <= now)
    }

    /// Whether a claim of `kind` may start a scrape now.
    pub fn is_claimable(&self, kind: ClaimKind, now: DateTime<Utc>) -> bool {
        match kind {
            ClaimKind::Scheduled => self.is_due(now),
            ClaimKind::OnDemand => self.status == RequirementStatus::Active,
        }
    }

    /// Copies the columns a user edit may touch. Scrape bookkeeping is left
    /// alone unless the edit reset the schedule.
    pub fn merge_user_edit(&mut self, edit: &Requirement, reset_schedule: bool) {
        self.product_query.clone_from(&edit.product_query);
        self.category = edit.category;
        self.budget_min = edit.budget_min;
        self.budget_max = edit.budget_max;
        self.timeline = edit.timeline;
        self.deal_breakers.clone_from(&edit.deal_breakers);
        self.condition_preferences
            .clone_from(&edit.condition_preferences);
        self.location_radius_km = edit.location_radius_km;
        self.status = edit.status;
        self.updated_at = edit.updated_at;
        if reset_schedule {
            self.scraping_status = edit.scraping_status;
            self.next_scrape_at = edit.next_scrape_at;
        }
    }

    fn transition(&mut self, next: ScrapingStatus) -> Result<(), TransitionError> {
        if !self.scraping_status.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                from: self.scraping_status.as_str(),
                to: next.as_str(),
            });
        }
        self.scraping_status = next;
        Ok(())
    }

    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.scraping_status == ScrapingStatus::InProgress {
            return Err(TransitionError::InProgress);
        }
        self.transition(ScrapingStatus::InProgress)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_completed(
        &mut self,
        now: DateTime<Utc>,
        counts: PassCounts,
        schedule: &ScrapeSchedule,
    ) -> Result<(), TransitionError> {
        self.transition(ScrapingStatus::Completed)?;
        self.last_scraped_at = Some(now);
        self.next_scrape_at = Some(now + schedule.success_interval);
        self.total_listings_found = counts.total;
        self.matching_listings_count = counts.matching;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        now: DateTime<Utc>,
        schedule: &ScrapeSchedule,
    ) -> Result<(), TransitionError> {
        self.transition(ScrapingStatus::Failed)?;
        self.next_scrape_at = Some(now + schedule.retry_interval);
        self.updated_at = now;
        Ok(())
    }

    /// Startup recovery for a claim whose process died mid-scrape.
    pub fn mark_interrupted(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ScrapingStatus::Failed)?;
        self.next_scrape_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn reset_pending(
        &mut self,
        now: DateTime<Utc>,
        schedule: &ScrapeSchedule,
    ) -> Result<(), TransitionError> {
        if self.scraping_status == ScrapingStatus::InProgress {
            return Err(TransitionError::InProgress);
        }
        self.transition(ScrapingStatus::Pending)?;
        self.next_scrape_at = Some(now + schedule.success_interval);
        self.updated_at = now;
        Ok(())
    }

    /// Applies a user edit. Returns `true` when the requirement was reset to
    /// `pending` and should be scraped right away.
    pub fn apply_update(
        &mut self,
        update: RequirementUpdate,
        now: DateTime<Utc>,
        schedule: &ScrapeSchedule,
    ) -> Result<bool, UpdateError> {
        let min = update.budget_min.or(self.budget_min);
        let max = update.budget_max.or(self.budget_max);
        validate_budget(min, max)?;
        if let Some(query) = &update.product_query {
            validate_query(query)?;
        }

        let resumed = update.status == Some(RequirementStatus::Active)
            && self.status != RequirementStatus::Active;
        let rescrape = resumed
            || (update.touches_search()
                && update.status.unwrap_or(self.status) == RequirementStatus::Active);
        if rescrape && self.scraping_status == ScrapingStatus::InProgress {
            return Err(UpdateError::Transition(TransitionError::InProgress));
        }

        if let Some(query) = update.product_query {
            self.product_query = query.trim().to_string();
        }
        if let Some(category) = update.category {
            self.category = category;
        }
        self.budget_min = min;
        self.budget_max = max;
        if let Some(timeline) = update.timeline {
            self.timeline = timeline;
        }
        if let Some(list) = update.deal_breakers {
            self.deal_breakers = clean_keywords(list);
        }
        if let Some(list) = update.condition_preferences {
            self.condition_preferences = clean_keywords(list);
        }
        if let Some(radius) = update.location_radius_km {
            self.location_radius_km = Some(radius);
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        self.updated_at = now;

        if rescrape {
            self.reset_pending(now, schedule)?;
        }
        Ok(rescrape)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

fn clean_keywords(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() || out.iter().any(|v| v.eq_ignore_ascii_case(trimmed)) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}
