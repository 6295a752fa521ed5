pub mod demo;
pub mod olx;

use crate::models::Category;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;

pub use demo::DemoScraper;
pub use olx::{OlxConfig, OlxScraper};

/// One candidate returned by a marketplace search, before matching.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapedListing {
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub location: Option<String>,
    pub seller_name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("http error: {0}")]
    Http(String),
    #[error("marketplace returned HTTP {0}")]
    Status(u16),
    #[error("invalid markup: {0}")]
    Parse(String),
    #[error("scrape timed out after {0}s")]
    Timeout(u64),
}

/// Marketplace search capability consumed by the scraping trigger.
#[async_trait]
pub trait MarketplaceScraper: Send + Sync {
    async fn search(
        &self,
        query: &str,
        category: Category,
    ) -> Result<Vec<ScrapedListing>, ScrapeError>;

    fn source_name(&self) -> &'static str;
}
