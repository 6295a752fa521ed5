use super::{ListingAnalysis, ListingAnalyzer, ListingComparison, Valuation, Valuator, compare};
use crate::clock::Clock;
use crate::models::{Listing, Requirement};
use crate::store::{Store, StoreError};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Resolves a listing for its owner and runs the advisors over it.
#[derive(Clone)]
pub struct AdvisorService {
    store: Arc<dyn Store>,
    analyzer: Arc<dyn ListingAnalyzer>,
    valuator: Arc<dyn Valuator>,
    clock: Arc<dyn Clock>,
}

impl AdvisorService {
    pub fn new(
        store: Arc<dyn Store>,
        analyzer: Arc<dyn ListingAnalyzer>,
        valuator: Arc<dyn Valuator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            analyzer,
            valuator,
            clock,
        }
    }

    async fn owned(
        &self,
        listing_id: Uuid,
        user_id: Uuid,
    ) -> Result<(Listing, Requirement), StoreError> {
        let listing = self
            .store
            .get_listing(listing_id)
            .await?
            .filter(|l| l.user_id == user_id)
            .ok_or(StoreError::NotFound("listing"))?;
        let requirement = self
            .store
            .get_requirement(listing.requirement_id)
            .await?
            .ok_or(StoreError::NotFound("requirement"))?;
        Ok((listing, requirement))
    }

    /// Analyzes the listing and writes the scores back to it.
    pub async fn analyze(
        &self,
        listing_id: Uuid,
        user_id: Uuid,
    ) -> Result<ListingAnalysis, StoreError> {
        let (mut listing, requirement) = self.owned(listing_id, user_id).await?;
        let analysis = self.analyzer.analyze(&listing, &requirement).await;
        analysis.apply_scores(&mut listing, self.clock.now());
        self.store.save_listing(&listing).await?;
        info!(
            target = "buysmart.advisor",
            %listing_id,
            overall = analysis.overall_score,
            source = ?analysis.source,
            "listing_analyzed"
        );
        Ok(analysis)
    }

    pub async fn valuate(&self, listing_id: Uuid, user_id: Uuid) -> Result<Valuation, StoreError> {
        let (listing, requirement) = self.owned(listing_id, user_id).await?;
        let valuation = self.valuator.estimate_value(&listing, &requirement).await;
        info!(
            target = "buysmart.advisor",
            %listing_id,
            verdict = ?valuation.verdict,
            source = ?valuation.source,
            "listing_valuated"
        );
        Ok(valuation)
    }

    /// Valuates each owned listing without persisting and ranks them by
    /// price against estimated value.
    pub async fn compare(
        &self,
        listing_ids: &[Uuid],
        user_id: Uuid,
    ) -> Result<ListingComparison, StoreError> {
        let mut entries = Vec::with_capacity(listing_ids.len());
        for &listing_id in listing_ids {
            let (listing, requirement) = self.owned(listing_id, user_id).await?;
            let valuation = self.valuator.estimate_value(&listing, &requirement).await;
            entries.push((listing, valuation));
        }
        let comparison = compare::compare(entries);
        info!(
            target = "buysmart.advisor",
            compared = listing_ids.len(),
            best_value = ?comparison.best_value,
            "listings_compared"
        );
        Ok(comparison)
    }
}
