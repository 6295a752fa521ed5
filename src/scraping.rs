//! One scrape attempt for one requirement.

use crate::clock::Clock;
use crate::lifecycle::{PassCounts, ScrapeSchedule};
use crate::matching;
use crate::metrics;
use crate::models::{Listing, ListingStatus, Requirement};
use crate::scraper::{MarketplaceScraper, ScrapeError, ScrapedListing};
use crate::store::{Claim, ClaimKind, Store, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Attempts at writing a finished pass before the claim is released.
const RESULT_WRITE_ATTEMPTS: u32 = 3;
const RESULT_WRITE_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct ScrapeConfig {
    /// Upper bound on a single marketplace search.
    pub timeout: Duration,
    pub schedule: ScrapeSchedule,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            schedule: ScrapeSchedule::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    AlreadyRunning,
    /// Not active, or no longer due for a scheduled pass.
    Ineligible,
    StoreUnavailable,
}

/// What a trigger did. Failures are already reflected in the requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScrapeOutcome {
    Completed {
        total: u32,
        matching: u32,
        inserted: u32,
    },
    Failed {
        reason: String,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl ScrapeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ScrapeOutcome::Completed { .. } => "completed",
            ScrapeOutcome::Failed { .. } => "failed",
            ScrapeOutcome::Skipped { .. } => "skipped",
        }
    }
}

#[derive(Debug, Error)]
enum PassError {
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct PassSummary {
    total: u32,
    matching: u32,
    inserted: u32,
}

/// Runs scrape attempts against the injected store, scraper and clock.
#[derive(Clone)]
pub struct ScrapeRunner {
    store: Arc<dyn Store>,
    scraper: Arc<dyn MarketplaceScraper>,
    clock: Arc<dyn Clock>,
    config: ScrapeConfig,
}

impl ScrapeRunner {
    pub fn new(
        store: Arc<dyn Store>,
        scraper: Arc<dyn MarketplaceScraper>,
        clock: Arc<dyn Clock>,
        config: ScrapeConfig,
    ) -> Self {
        Self {
            store,
            scraper,
            clock,
            config,
        }
    }

    pub fn scraper(&self) -> &Arc<dyn MarketplaceScraper> {
        &self.scraper
    }

    pub fn schedule(&self) -> &ScrapeSchedule {
        &self.config.schedule
    }

    /// Fire-and-forget trigger used right after a requirement is created or reset.
    pub fn trigger_detached(&self, requirement_id: Uuid) {
        let runner = self.clone();
        tokio::spawn(async move {
            runner.trigger(requirement_id).await;
        });
    }

    /// Performs exactly one attempt on an active requirement, due or not.
    /// Never returns an error; callers inspect the outcome or the stored
    /// requirement.
    pub async fn trigger(&self, requirement_id: Uuid) -> ScrapeOutcome {
        self.attempt(requirement_id, ClaimKind::OnDemand).await
    }

    /// Like [`ScrapeRunner::trigger`], but skips requirements that stopped
    /// being due since the loop listed them.
    pub async fn trigger_due(&self, requirement_id: Uuid) -> ScrapeOutcome {
        self.attempt(requirement_id, ClaimKind::Scheduled).await
    }

    async fn attempt(&self, requirement_id: Uuid, kind: ClaimKind) -> ScrapeOutcome {
        let started = Instant::now();
        let outcome = self.run(requirement_id, kind).await;
        metrics::scrape_finished(outcome.label(), started.elapsed().as_millis());
        outcome
    }

    async fn run(&self, requirement_id: Uuid, kind: ClaimKind) -> ScrapeOutcome {
        let claim = self
            .store
            .claim_for_scrape(requirement_id, self.clock.now(), kind)
            .await;
        let mut requirement = match claim {
            Ok(Claim::Claimed(requirement)) => requirement,
            Ok(Claim::Missing) => {
                warn!(target = "buysmart.scrape", %requirement_id, "requirement_not_found");
                return ScrapeOutcome::Skipped {
                    reason: SkipReason::NotFound,
                };
            }
            Ok(Claim::Busy) => {
                info!(target = "buysmart.scrape", %requirement_id, "claim_lost");
                return ScrapeOutcome::Skipped {
                    reason: SkipReason::AlreadyRunning,
                };
            }
            Ok(Claim::Ineligible) => {
                info!(target = "buysmart.scrape", %requirement_id, ?kind, "claim_ineligible");
                return ScrapeOutcome::Skipped {
                    reason: SkipReason::Ineligible,
                };
            }
            Err(err) => {
                error!(target = "buysmart.scrape", %requirement_id, error = %err, "claim_failed");
                return ScrapeOutcome::Skipped {
                    reason: SkipReason::StoreUnavailable,
                };
            }
        };

        info!(
            target = "buysmart.scrape",
            %requirement_id,
            query = %requirement.product_query,
            category = requirement.category.as_str(),
            source = self.scraper.source_name(),
            "scrape_started"
        );

        let result = self.scrape(&requirement).await;
        let now = self.clock.now();
        let schedule = &self.config.schedule;
        let (outcome, transition) = match result {
            Ok(pass) => {
                let counts = PassCounts {
                    total: pass.total,
                    matching: pass.matching,
                };
                info!(
                    target = "buysmart.scrape",
                    %requirement_id,
                    total = pass.total,
                    matching = pass.matching,
                    inserted = pass.inserted,
                    "scrape_completed"
                );
                (
                    ScrapeOutcome::Completed {
                        total: pass.total,
                        matching: pass.matching,
                        inserted: pass.inserted,
                    },
                    requirement.mark_completed(now, counts, schedule),
                )
            }
            Err(err) => {
                warn!(target = "buysmart.scrape", %requirement_id, error = %err, "scrape_failed");
                (
                    ScrapeOutcome::Failed {
                        reason: err.to_string(),
                    },
                    requirement.mark_failed(now, schedule),
                )
            }
        };
        let written = match transition {
            Ok(()) => self.write_result(&requirement).await,
            Err(err) => {
                error!(target = "buysmart.scrape", %requirement_id, error = %err, "transition_rejected");
                Err(StoreError::Invariant(err))
            }
        };
        if let Err(err) = written {
            error!(target = "buysmart.scrape", %requirement_id, error = %err, "record_result_failed");
            self.release(requirement_id).await;
            return ScrapeOutcome::Failed {
                reason: err.to_string(),
            };
        }
        outcome
    }

    /// Retries transport errors with a doubling back-off. A conflict means
    /// the claim is gone and is not retried.
    async fn write_result(&self, requirement: &Requirement) -> Result<(), StoreError> {
        let mut delay = RESULT_WRITE_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.store.record_scrape_result(requirement).await {
                Err(err @ StoreError::Request(_)) if attempt < RESULT_WRITE_ATTEMPTS => {
                    warn!(
                        target = "buysmart.scrape",
                        requirement_id = %requirement.id,
                        attempt,
                        error = %err,
                        "record_result_retry"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Moves a claim whose result was lost to `failed` so the next pass
    /// retries it. If even that write fails the row waits for startup
    /// recovery.
    async fn release(&self, requirement_id: Uuid) {
        let now = self.clock.now();
        match self
            .store
            .release_claim(requirement_id, now, &self.config.schedule)
            .await
        {
            Ok(true) => warn!(target = "buysmart.scrape", %requirement_id, "claim_released"),
            Ok(false) => {}
            Err(err) => {
                error!(target = "buysmart.scrape", %requirement_id, error = %err, "claim_release_failed")
            }
        }
    }

    async fn scrape(&self, requirement: &Requirement) -> Result<PassSummary, PassError> {
        let limit = self.config.timeout;
        let search = self
            .scraper
            .search(&requirement.product_query, requirement.category);
        let candidates = tokio::time::timeout(limit, search)
            .await
            .map_err(|_| ScrapeError::Timeout(limit.as_secs()))??;

        let total = candidates.len();
        let now = self.clock.now();
        let mut matching = 0usize;
        let mut inserted = 0usize;
        for candidate in candidates {
            if let Err(rejection) = matching::evaluate(requirement, &candidate) {
                debug!(
                    target = "buysmart.scrape",
                    requirement_id = %requirement.id,
                    external_id = %candidate.external_id,
                    ?rejection,
                    "candidate_rejected"
                );
                continue;
            }
            matching += 1;
            let listing = listing_from_candidate(requirement, candidate, now);
            if self.store.insert_listing_if_absent(listing).await? {
                inserted += 1;
            }
        }
        Ok(PassSummary {
            total: saturating_u32(total),
            matching: saturating_u32(matching),
            inserted: saturating_u32(inserted),
        })
    }
}

fn saturating_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn listing_from_candidate(
    requirement: &Requirement,
    candidate: ScrapedListing,
    now: DateTime<Utc>,
) -> Listing {
    Listing {
        id: Uuid::new_v4(),
        requirement_id: requirement.id,
        user_id: requirement.user_id,
        external_id: candidate.external_id,
        title: candidate.title,
        description: candidate.description,
        price: candidate.price,
        currency: "INR".to_string(),
        location: candidate.location,
        seller_name: candidate.seller_name,
        seller_rating: None,
        listing_url: candidate.url,
        image_urls: candidate.image_urls,
        condition: None,
        status: ListingStatus::New,
        relevance_score: None,
        price_score: None,
        condition_score: None,
        overall_score: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{Category, NewRequirement, ScrapingStatus};
    use crate::store::MemoryStore;
    use crate::store::tests::FaultyStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::Ordering;
    use tokio::sync::Notify;

    pub(crate) struct FixedScraper(pub Vec<ScrapedListing>);

    #[async_trait]
    impl MarketplaceScraper for FixedScraper {
        async fn search(&self, _: &str, _: Category) -> Result<Vec<ScrapedListing>, ScrapeError> {
            Ok(self.0.clone())
        }

        fn source_name(&self) -> &'static str {
            "fixed"
        }
    }

    struct FailingScraper;

    #[async_trait]
    impl MarketplaceScraper for FailingScraper {
        async fn search(&self, _: &str, _: Category) -> Result<Vec<ScrapedListing>, ScrapeError> {
            Err(ScrapeError::Status(503))
        }

        fn source_name(&self) -> &'static str {
            "failing"
        }
    }

    struct SlowScraper;

    #[async_trait]
    impl MarketplaceScraper for SlowScraper {
        async fn search(&self, _: &str, _: Category) -> Result<Vec<ScrapedListing>, ScrapeError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Vec::new())
        }

        fn source_name(&self) -> &'static str {
            "slow"
        }
    }

    /// Blocks inside `search` until released.
    struct GatedScraper {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl MarketplaceScraper for GatedScraper {
        async fn search(&self, _: &str, _: Category) -> Result<Vec<ScrapedListing>, ScrapeError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Vec::new())
        }

        fn source_name(&self) -> &'static str {
            "gated"
        }
    }

    pub(crate) fn candidate(id: &str, title: &str, price: f64) -> ScrapedListing {
        ScrapedListing {
            external_id: id.into(),
            title: title.into(),
            description: None,
            price: Some(price),
            location: Some("Mumbai".into()),
            seller_name: None,
            url: format!("https://example.com/item/{id}"),
            image_urls: vec![],
        }
    }

    pub(crate) fn iphone_candidates() -> Vec<ScrapedListing> {
        vec![
            candidate("a1", "iPhone 12 64GB", 25000.0),
            candidate("a2", "iPhone 12 128GB", 35000.0),
            candidate("a3", "cracked screen iPhone 12", 40000.0),
        ]
    }

    pub(crate) fn iphone_requirement(user_id: Uuid, clock: &dyn Clock) -> Requirement {
        Requirement::create(
            user_id,
            NewRequirement {
                product_query: "iPhone 12".into(),
                category: Category::Electronics,
                budget_min: Some(30000.0),
                budget_max: Some(50000.0),
                timeline: Default::default(),
                deal_breakers: vec!["cracked".into()],
                condition_preferences: vec![],
                location_lat: None,
                location_lng: None,
                location_radius_km: None,
            },
            clock.now(),
            &ScrapeSchedule::default(),
        )
        .unwrap()
    }

    async fn setup(
        scraper: Arc<dyn MarketplaceScraper>,
    ) -> (ScrapeRunner, Arc<MemoryStore>, Arc<ManualClock>, Requirement) {
        setup_with(MemoryStore::new(), scraper).await
    }

    async fn setup_with<S: Store + 'static>(
        store: S,
        scraper: Arc<dyn MarketplaceScraper>,
    ) -> (ScrapeRunner, Arc<S>, Arc<ManualClock>, Requirement) {
        let store = Arc::new(store);
        let clock = Arc::new(ManualClock::fixed());
        let requirement = store
            .insert_requirement(iphone_requirement(Uuid::new_v4(), clock.as_ref()))
            .await
            .unwrap();
        let runner = ScrapeRunner::new(
            store.clone(),
            scraper,
            clock.clone(),
            ScrapeConfig::default(),
        );
        (runner, store, clock, requirement)
    }

    #[tokio::test]
    async fn iphone_scenario_persists_only_the_match() {
        let (runner, store, clock, req) =
            setup(Arc::new(FixedScraper(iphone_candidates()))).await;
        clock.advance(ChronoDuration::minutes(3));

        let outcome = runner.trigger(req.id).await;
        assert_eq!(
            outcome,
            ScrapeOutcome::Completed {
                total: 3,
                matching: 1,
                inserted: 1
            }
        );

        let stored = store.get_requirement(req.id).await.unwrap().unwrap();
        assert_eq!(stored.scraping_status, ScrapingStatus::Completed);
        assert_eq!(stored.total_listings_found, 3);
        assert_eq!(stored.matching_listings_count, 1);
        assert_eq!(stored.last_scraped_at, Some(clock.now()));
        assert_eq!(
            stored.next_scrape_at,
            Some(clock.now() + ChronoDuration::hours(24))
        );

        let listings = store.listings_for_requirement(req.id).await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, "iPhone 12 128GB");
        assert_eq!(listings[0].user_id, req.user_id);
    }

    #[tokio::test]
    async fn missing_requirement_is_a_quiet_noop() {
        let (runner, store, _, req) = setup(Arc::new(FixedScraper(iphone_candidates()))).await;
        let outcome = runner.trigger(Uuid::new_v4()).await;
        assert_eq!(
            outcome,
            ScrapeOutcome::Skipped {
                reason: SkipReason::NotFound
            }
        );
        let untouched = store.get_requirement(req.id).await.unwrap().unwrap();
        assert_eq!(untouched, req);
    }

    #[tokio::test]
    async fn scraper_error_schedules_retry() {
        let (runner, store, clock, req) = setup(Arc::new(FailingScraper)).await;
        let outcome = runner.trigger(req.id).await;
        assert!(matches!(outcome, ScrapeOutcome::Failed { .. }));

        let stored = store.get_requirement(req.id).await.unwrap().unwrap();
        assert_eq!(stored.scraping_status, ScrapingStatus::Failed);
        assert_eq!(
            stored.next_scrape_at,
            Some(clock.now() + ChronoDuration::hours(1))
        );
        assert!(stored.last_scraped_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_scraper_times_out_as_failure() {
        let (runner, store, clock, req) = setup(Arc::new(SlowScraper)).await;
        let outcome = runner.trigger(req.id).await;
        assert_eq!(
            outcome,
            ScrapeOutcome::Failed {
                reason: "scrape timed out after 120s".into()
            }
        );
        let stored = store.get_requirement(req.id).await.unwrap().unwrap();
        assert_eq!(stored.scraping_status, ScrapingStatus::Failed);
        assert_eq!(
            stored.next_scrape_at,
            Some(clock.now() + ChronoDuration::hours(1))
        );
    }

    #[tokio::test]
    async fn repeated_triggers_do_not_duplicate_listings() {
        let (runner, store, _, req) = setup(Arc::new(FixedScraper(iphone_candidates()))).await;
        runner.trigger(req.id).await;
        let second = runner.trigger(req.id).await;
        assert_eq!(
            second,
            ScrapeOutcome::Completed {
                total: 3,
                matching: 1,
                inserted: 0
            }
        );
        assert_eq!(store.listings_for_requirement(req.id).await.unwrap().len(), 1);
        let stored = store.get_requirement(req.id).await.unwrap().unwrap();
        assert_eq!(stored.matching_listings_count, 1);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_skipped() {
        let gate = Arc::new(GatedScraper {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (runner, store, _, req) = setup(gate.clone()).await;

        let first = tokio::spawn({
            let runner = runner.clone();
            async move { runner.trigger(req.id).await }
        });
        gate.entered.notified().await;

        assert_eq!(
            runner.trigger(req.id).await,
            ScrapeOutcome::Skipped {
                reason: SkipReason::AlreadyRunning
            }
        );
        let mid = store.get_requirement(req.id).await.unwrap().unwrap();
        assert_eq!(mid.scraping_status, ScrapingStatus::InProgress);

        gate.release.notify_one();
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, ScrapeOutcome::Completed { total: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_result_write_failure_is_retried() {
        let store = FaultyStore::default();
        store.record_failures.store(1, Ordering::SeqCst);
        let (runner, store, clock, req) =
            setup_with(store, Arc::new(FixedScraper(iphone_candidates()))).await;

        let outcome = runner.trigger(req.id).await;
        assert!(matches!(outcome, ScrapeOutcome::Completed { matching: 1, .. }));
        assert_eq!(store.record_calls.load(Ordering::SeqCst), 2);
        let stored = store.get_requirement(req.id).await.unwrap().unwrap();
        assert_eq!(stored.scraping_status, ScrapingStatus::Completed);
        assert_eq!(stored.last_scraped_at, Some(clock.now()));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_result_write_releases_the_claim() {
        let store = FaultyStore::default();
        store.record_failures.store(usize::MAX, Ordering::SeqCst);
        let (runner, store, clock, req) =
            setup_with(store, Arc::new(FixedScraper(iphone_candidates()))).await;

        let outcome = runner.trigger(req.id).await;
        assert_eq!(
            outcome,
            ScrapeOutcome::Failed {
                reason: "request failed: connection reset".into()
            }
        );
        assert_eq!(store.record_calls.load(Ordering::SeqCst), 3);
        let stored = store.get_requirement(req.id).await.unwrap().unwrap();
        assert_eq!(stored.scraping_status, ScrapingStatus::Failed);
        assert_eq!(
            stored.next_scrape_at,
            Some(clock.now() + ChronoDuration::hours(1))
        );

        // the retry is not blocked by a leftover claim
        store.record_failures.store(0, Ordering::SeqCst);
        clock.advance(ChronoDuration::hours(1));
        let retry = runner.trigger_due(req.id).await;
        assert!(matches!(retry, ScrapeOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn listing_write_failure_fails_the_pass() {
        let store = FaultyStore::default();
        store.insert_failures.store(1, Ordering::SeqCst);
        let (runner, store, clock, req) =
            setup_with(store, Arc::new(FixedScraper(iphone_candidates()))).await;

        let outcome = runner.trigger(req.id).await;
        assert!(matches!(outcome, ScrapeOutcome::Failed { .. }));
        let stored = store.get_requirement(req.id).await.unwrap().unwrap();
        assert_eq!(stored.scraping_status, ScrapingStatus::Failed);
        assert_eq!(
            stored.next_scrape_at,
            Some(clock.now() + ChronoDuration::hours(1))
        );
        assert_eq!(stored.matching_listings_count, 0);
    }

    #[tokio::test]
    async fn scheduled_trigger_skips_requirements_not_due() {
        let (runner, store, _, req) = setup(Arc::new(FixedScraper(iphone_candidates()))).await;
        assert_eq!(
            runner.trigger_due(req.id).await,
            ScrapeOutcome::Skipped {
                reason: SkipReason::Ineligible
            }
        );
        let untouched = store.get_requirement(req.id).await.unwrap().unwrap();
        assert_eq!(untouched, req);
    }
}
