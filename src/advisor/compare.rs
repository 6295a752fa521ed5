//! Side-by-side valuation of a few listings.

use super::{PriceVerdict, Valuation};
use crate::models::Listing;
use serde::Serialize;
use std::cmp::Ordering;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComparedListing {
    pub listing_id: Uuid,
    pub title: String,
    pub price: Option<f64>,
    /// Asking price over estimated value. Below 1.0 is a bargain.
    pub price_to_value: Option<f64>,
    pub valuation: Valuation,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListingComparison {
    /// Best value first; listings without a price or estimate come last.
    pub listings: Vec<ComparedListing>,
    pub best_value: Option<Uuid>,
    pub underpriced: Vec<Uuid>,
    pub fair: Vec<Uuid>,
    pub overpriced: Vec<Uuid>,
    pub price_range: Option<PriceRange>,
}

pub fn compare(entries: Vec<(Listing, Valuation)>) -> ListingComparison {
    let mut listings: Vec<ComparedListing> = entries
        .into_iter()
        .map(|(listing, valuation)| ComparedListing {
            listing_id: listing.id,
            price_to_value: listing
                .price
                .filter(|_| valuation.estimated_value > 0.0)
                .map(|price| round2(price / valuation.estimated_value)),
            title: listing.title,
            price: listing.price,
            valuation,
        })
        .collect();
    listings.sort_by(|a, b| match (a.price_to_value, b.price_to_value) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });

    let with_verdict = |verdict: PriceVerdict| -> Vec<Uuid> {
        listings
            .iter()
            .filter(|l| l.valuation.verdict == verdict)
            .map(|l| l.listing_id)
            .collect()
    };
    let underpriced = with_verdict(PriceVerdict::Underpriced);
    let fair = with_verdict(PriceVerdict::Fair);
    let overpriced = with_verdict(PriceVerdict::Overpriced);

    let prices: Vec<f64> = listings.iter().filter_map(|l| l.price).collect();
    let price_range = (!prices.is_empty()).then(|| PriceRange {
        min: prices.iter().copied().fold(f64::INFINITY, f64::min),
        max: prices.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean: (prices.iter().sum::<f64>() / prices.len() as f64).round(),
    });

    ListingComparison {
        best_value: listings
            .iter()
            .find(|l| l.price_to_value.is_some())
            .map(|l| l.listing_id),
        listings,
        underpriced,
        fair,
        overpriced,
        price_range,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::AdviceSource;
    use crate::advisor::heuristic::tests::listing;

    fn valued(estimated: f64, verdict: PriceVerdict) -> Valuation {
        Valuation {
            estimated_value: estimated,
            fair_min: estimated * 0.85,
            fair_max: estimated * 1.15,
            verdict,
            negotiation_tips: vec![],
            confidence: 4.0,
            source: AdviceSource::Heuristic,
        }
    }

    #[test]
    fn cheapest_relative_to_value_wins() {
        let pricey = listing("iPhone 12 sealed", Some(50000.0));
        let bargain = listing("iPhone 12 used", Some(30000.0));
        let unpriced = listing("iPhone 12 make an offer", None);
        let ids = (pricey.id, bargain.id, unpriced.id);

        let comparison = compare(vec![
            (pricey, valued(40000.0, PriceVerdict::Overpriced)),
            (unpriced, valued(40000.0, PriceVerdict::Fair)),
            (bargain, valued(40000.0, PriceVerdict::Underpriced)),
        ]);

        let order: Vec<Uuid> = comparison.listings.iter().map(|l| l.listing_id).collect();
        assert_eq!(order, vec![ids.1, ids.0, ids.2]);
        assert_eq!(comparison.best_value, Some(ids.1));
        assert_eq!(comparison.listings[0].price_to_value, Some(0.75));
        assert_eq!(comparison.underpriced, vec![ids.1]);
        assert_eq!(comparison.overpriced, vec![ids.0]);
        assert_eq!(comparison.fair, vec![ids.2]);
        assert_eq!(
            comparison.price_range,
            Some(PriceRange {
                min: 30000.0,
                max: 50000.0,
                mean: 40000.0
            })
        );
    }

    #[test]
    fn nothing_priced_has_no_winner() {
        let comparison = compare(vec![
            (listing("desk", None), valued(0.0, PriceVerdict::Fair)),
            (listing("chair", Some(900.0)), valued(0.0, PriceVerdict::Fair)),
        ]);
        assert_eq!(comparison.best_value, None);
        assert!(comparison.listings.iter().all(|l| l.price_to_value.is_none()));
        assert_eq!(comparison.price_range.map(|r| r.max), Some(900.0));
    }
}
