use super::{MarketplaceScraper, ScrapeError, ScrapedListing};
use crate::models::Category;
use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

const CONDITIONS: [&str; 5] = ["brand new", "like new", "lightly used", "used", "for parts"];
const CITIES: [&str; 5] = ["Mumbai", "Delhi", "Bengaluru", "Pune", "Hyderabad"];

/// Offline stand-in for a marketplace. The same query always yields the same
/// listings, so repeated passes exercise deduplication.
#[derive(Debug, Clone)]
pub struct DemoScraper {
    per_query: usize,
}

impl Default for DemoScraper {
    fn default() -> Self {
        Self { per_query: 6 }
    }
}

impl DemoScraper {
    fn base_price(category: Category) -> f64 {
        match category {
            Category::Electronics => 35_000.0,
            Category::Vehicles => 450_000.0,
            Category::Property => 2_500_000.0,
            Category::Fashion => 2_000.0,
            Category::HomeGarden => 8_000.0,
            Category::Sports => 5_000.0,
            Category::Books => 400.0,
            Category::Other => 3_000.0,
        }
    }
}

#[async_trait]
impl MarketplaceScraper for DemoScraper {
    async fn search(
        &self,
        query: &str,
        category: Category,
    ) -> Result<Vec<ScrapedListing>, ScrapeError> {
        let seed = query_seed(query, category);
        let mut rng = SmallRng::seed_from_u64(seed);
        let base = Self::base_price(category);
        let listings = (0..self.per_query)
            .map(|idx| {
                let condition = CONDITIONS[rng.random_range(0..CONDITIONS.len())];
                let city = CITIES[rng.random_range(0..CITIES.len())];
                let factor: f64 = rng.random_range(0.6..1.4);
                let price = (base * factor / 100.0).round() * 100.0;
                let external_id = format!("demo-{seed:x}-{idx}");
                ScrapedListing {
                    title: format!("{query} ({condition})"),
                    description: Some(format!("{condition} {query}, pickup in {city}")),
                    price: Some(price),
                    location: Some(city.to_string()),
                    seller_name: Some(format!("seller-{}", rng.random_range(100..999))),
                    url: format!("https://demo.buysmart.local/item/{external_id}"),
                    image_urls: vec![format!("https://demo.buysmart.local/img/{external_id}.jpg")],
                    external_id,
                }
            })
            .collect();
        Ok(listings)
    }

    fn source_name(&self) -> &'static str {
        "demo"
    }
}

fn query_seed(query: &str, category: Category) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.trim().to_lowercase().hash(&mut hasher);
    category.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_query_is_stable() {
        let scraper = DemoScraper::default();
        let a = scraper.search("iPhone 12", Category::Electronics).await.unwrap();
        let b = scraper.search("iPhone 12", Category::Electronics).await.unwrap();
        assert_eq!(a.len(), 6);
        assert_eq!(a, b);
        assert!(a.iter().all(|l| l.price.unwrap_or_default() > 0.0));
    }

    #[tokio::test]
    async fn category_changes_results() {
        let scraper = DemoScraper::default();
        let a = scraper.search("bike", Category::Sports).await.unwrap();
        let b = scraper.search("bike", Category::Vehicles).await.unwrap();
        assert_ne!(a[0].external_id, b[0].external_id);
    }
}
