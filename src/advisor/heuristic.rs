use super::{
    AdviceSource, ListingAnalysis, ListingAnalyzer, PriceVerdict, Valuation, Valuator,
    clamp_score, weighted_overall,
};
use crate::models::{Listing, Requirement};
use async_trait::async_trait;

const DAMAGED: [&str; 6] = [
    "broken",
    "cracked",
    "damaged",
    "for parts",
    "not working",
    "faulty",
];
const LIKE_NEW: [&str; 4] = ["like new", "mint", "excellent", "barely used"];
const NEW: [&str; 4] = ["brand new", "sealed", "unused", "unopened"];
const USED: [&str; 3] = ["used", "good condition", "working"];

/// Keyword and budget based scoring, used offline and as the LLM fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicAdvisor;

impl HeuristicAdvisor {
    pub fn analysis(&self, listing: &Listing, requirement: &Requirement) -> ListingAnalysis {
        let text = listing_text(listing);
        let (condition, condition_score) = classify_condition(&text);
        let relevance = relevance_score(&requirement.product_query, &text);
        let price = price_score(listing.price, requirement.budget_min, requirement.budget_max);

        let mut red_flags: Vec<String> = DAMAGED
            .iter()
            .filter(|k| text.contains(*k))
            .map(|k| format!("mentions \"{k}\""))
            .collect();
        red_flags.extend(
            requirement
                .deal_breakers
                .iter()
                .filter(|k| text.contains(&k.to_lowercase()))
                .map(|k| format!("matches deal-breaker \"{k}\"")),
        );
        match (listing.price, requirement.budget_min) {
            (None, _) => red_flags.push("price not listed".into()),
            (Some(p), Some(min)) if p < min * 0.5 => {
                red_flags.push("price far below the expected range".into())
            }
            _ => {}
        }

        let mut recommendations = Vec::new();
        if condition.is_none() {
            recommendations.push("Ask the seller to describe the item's condition".into());
        }
        if listing.image_urls.is_empty() {
            recommendations.push("Request recent photos before visiting".into());
        }
        recommendations.push("Inspect the item in person before paying".into());

        ListingAnalysis {
            product_type: Some(requirement.category.as_str().to_string()),
            brand: None,
            model: None,
            condition: condition.map(str::to_string),
            red_flags,
            recommendations,
            relevance_score: relevance,
            price_score: price,
            condition_score,
            overall_score: weighted_overall(relevance, price, condition_score),
            source: AdviceSource::Heuristic,
        }
    }

    pub fn valuation(&self, listing: &Listing, requirement: &Requirement) -> Valuation {
        let text = listing_text(listing);
        let (_, condition_score) = classify_condition(&text);
        let budget_anchor = match (requirement.budget_min, requirement.budget_max) {
            (Some(lo), Some(hi)) => Some((lo + hi) / 2.0),
            (None, Some(hi)) => Some(hi * 0.85),
            (Some(lo), None) => Some(lo * 1.15),
            (None, None) => None,
        };
        let Some(anchor) = budget_anchor.or(listing.price) else {
            return Valuation {
                estimated_value: 0.0,
                fair_min: 0.0,
                fair_max: 0.0,
                verdict: PriceVerdict::Fair,
                negotiation_tips: vec!["Ask the seller for a price first".into()],
                confidence: 1.0,
                source: AdviceSource::Heuristic,
            };
        };

        // a worn item is worth up to a quarter less than a pristine one
        let estimated = (anchor * (0.7 + 0.03 * condition_score)).round();
        let fair_min = (estimated * 0.85).round();
        let fair_max = (estimated * 1.15).round();
        let verdict = match listing.price {
            Some(p) if p < fair_min => PriceVerdict::Underpriced,
            Some(p) if p > fair_max => PriceVerdict::Overpriced,
            _ => PriceVerdict::Fair,
        };
        let negotiation_tips = match verdict {
            PriceVerdict::Overpriced => vec![
                format!("Open around {fair_min:.0} INR"),
                "Point to cheaper comparable listings".into(),
            ],
            PriceVerdict::Fair => vec!["Ask for a small discount for quick pickup".into()],
            PriceVerdict::Underpriced => vec![
                "Move quickly, good deals go fast".into(),
                "Verify the item is genuine before paying".into(),
            ],
        };
        let confidence = if budget_anchor.is_some() && listing.price.is_some() {
            4.0
        } else {
            2.0
        };

        Valuation {
            estimated_value: estimated,
            fair_min,
            fair_max,
            verdict,
            negotiation_tips,
            confidence,
            source: AdviceSource::Heuristic,
        }
    }
}

#[async_trait]
impl ListingAnalyzer for HeuristicAdvisor {
    async fn analyze(&self, listing: &Listing, requirement: &Requirement) -> ListingAnalysis {
        self.analysis(listing, requirement)
    }
}

#[async_trait]
impl Valuator for HeuristicAdvisor {
    async fn estimate_value(&self, listing: &Listing, requirement: &Requirement) -> Valuation {
        self.valuation(listing, requirement)
    }
}

fn listing_text(listing: &Listing) -> String {
    let mut text = listing.title.to_lowercase();
    if let Some(description) = &listing.description {
        text.push(' ');
        text.push_str(&description.to_lowercase());
    }
    if let Some(condition) = &listing.condition {
        text.push(' ');
        text.push_str(&condition.to_lowercase());
    }
    text
}

fn classify_condition(text: &str) -> (Option<&'static str>, f64) {
    let has = |words: &[&str]| words.iter().any(|w| text.contains(w));
    if has(&DAMAGED) {
        (Some("damaged"), 2.0)
    } else if has(&NEW) {
        (Some("new"), 9.5)
    } else if has(&LIKE_NEW) {
        (Some("like new"), 8.5)
    } else if has(&USED) {
        (Some("used"), 6.5)
    } else {
        (None, 5.0)
    }
}

/// Share of query tokens that appear in the listing text.
fn relevance_score(query: &str, text: &str) -> f64 {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let hits = tokens.iter().filter(|t| text.contains(t.as_str())).count();
    clamp_score(10.0 * hits as f64 / tokens.len() as f64)
}

/// Cheaper within budget scores higher; outside the budget decays.
fn price_score(price: Option<f64>, min: Option<f64>, max: Option<f64>) -> f64 {
    let Some(price) = price.filter(|p| *p > 0.0) else {
        return 5.0;
    };
    let score = match (min, max) {
        (_, Some(hi)) if price > hi => 5.0 * hi / price,
        (Some(lo), Some(_)) if price < lo => 7.0,
        (Some(lo), Some(hi)) => {
            let span = (hi - lo).max(1.0);
            10.0 - 5.0 * (price - lo) / span
        }
        (None, Some(hi)) => 10.0 - 5.0 * price / hi,
        (Some(lo), None) if price < lo => 6.0,
        (Some(_), None) => 7.0,
        (None, None) => 5.0,
    };
    clamp_score(score)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lifecycle::ScrapeSchedule;
    use crate::models::{Category, ListingStatus, NewRequirement};
    use chrono::Utc;
    use uuid::Uuid;

    pub(crate) fn requirement() -> Requirement {
        Requirement::create(
            Uuid::new_v4(),
            NewRequirement {
                product_query: "iPhone 12".into(),
                category: Category::Electronics,
                budget_min: Some(30000.0),
                budget_max: Some(50000.0),
                timeline: Default::default(),
                deal_breakers: vec!["icloud locked".into()],
                condition_preferences: vec![],
                location_lat: None,
                location_lng: None,
                location_radius_km: None,
            },
            Utc::now(),
            &ScrapeSchedule::default(),
        )
        .unwrap()
    }

    pub(crate) fn listing(title: &str, price: Option<f64>) -> Listing {
        let now = Utc::now();
        Listing {
            id: Uuid::new_v4(),
            requirement_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            external_id: "x".into(),
            title: title.into(),
            description: None,
            price,
            currency: "INR".into(),
            location: None,
            seller_name: None,
            seller_rating: None,
            listing_url: "https://example.com".into(),
            image_urls: vec![],
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

    #[test]
    fn good_listing_outscores_damaged_one() {
        let req = requirement();
        let good = HeuristicAdvisor.analysis(&listing("iPhone 12 like new", Some(32000.0)), &req);
        let bad = HeuristicAdvisor.analysis(
            &listing("iPhone 12 cracked back, icloud locked", Some(32000.0)),
            &req,
        );
        assert_eq!(good.source, AdviceSource::Heuristic);
        assert_eq!(good.relevance_score, 10.0);
        assert_eq!(good.condition.as_deref(), Some("like new"));
        assert!(good.overall_score > bad.overall_score);
        assert!(bad.red_flags.iter().any(|f| f.contains("cracked")));
        assert!(bad.red_flags.iter().any(|f| f.contains("icloud locked")));
    }

    #[test]
    fn price_scores_follow_budget_position() {
        assert_eq!(price_score(Some(30000.0), Some(30000.0), Some(50000.0)), 10.0);
        assert_eq!(price_score(Some(50000.0), Some(30000.0), Some(50000.0)), 5.0);
        assert_eq!(price_score(Some(100000.0), None, Some(50000.0)), 2.5);
        assert_eq!(price_score(None, Some(1.0), None), 5.0);
    }

    #[test]
    fn valuation_flags_overpriced() {
        let req = requirement();
        let value = HeuristicAdvisor.valuation(&listing("iPhone 12 used", Some(60000.0)), &req);
        assert_eq!(value.verdict, PriceVerdict::Overpriced);
        assert!(value.fair_min <= value.estimated_value && value.estimated_value <= value.fair_max);
        assert!(!value.negotiation_tips.is_empty());
    }

    #[test]
    fn valuation_without_any_price_is_low_confidence() {
        let mut req = requirement();
        req.budget_min = None;
        req.budget_max = None;
        let value = HeuristicAdvisor.valuation(&listing("iPhone 12", None), &req);
        assert_eq!(value.verdict, PriceVerdict::Fair);
        assert_eq!(value.confidence, 1.0);
    }
}
