use crate::models::Requirement;
use crate::scraper::ScrapedListing;

/// Why a candidate was rejected; only used for debug logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingPrice,
    BelowBudget,
    AboveBudget,
    DealBreaker(String),
}

/// Checks a candidate against the requirement's budget and deal-breakers.
///
/// `location_radius_km` is accepted on requirements but not enforced here.
pub fn evaluate(requirement: &Requirement, candidate: &ScrapedListing) -> Result<(), Rejection> {
    let bounded = requirement.budget_min.is_some() || requirement.budget_max.is_some();
    if bounded {
        let price = candidate.price.ok_or(Rejection::MissingPrice)?;
        if requirement.budget_min.is_some_and(|min| price < min) {
            return Err(Rejection::BelowBudget);
        }
        if requirement.budget_max.is_some_and(|max| price > max) {
            return Err(Rejection::AboveBudget);
        }
    }

    let title = candidate.title.to_lowercase();
    if let Some(keyword) = requirement
        .deal_breakers
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .find(|k| title.contains(&k.to_lowercase()))
    {
        return Err(Rejection::DealBreaker(keyword.to_string()));
    }
    Ok(())
}

pub fn matches(requirement: &Requirement, candidate: &ScrapedListing) -> bool {
    evaluate(requirement, candidate).is_ok()
}
