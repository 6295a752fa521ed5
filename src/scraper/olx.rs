use super::{MarketplaceScraper, ScrapeError, ScrapedListing};
use crate::http::build_client;
use crate::models::Category;
use async_trait::async_trait;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct OlxConfig {
    pub base_url: String,
    pub max_pages: u32,
}

impl Default for OlxConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.olx.in".into(),
            max_pages: 3,
        }
    }
}

struct Selectors {
    card: Selector,
    title: Selector,
    price: Selector,
    location: Selector,
    link: Selector,
    image: Selector,
}

impl Selectors {
    fn compile() -> Result<Self, ScrapeError> {
        let parse = |raw: &str| {
            Selector::parse(raw).map_err(|err| ScrapeError::Parse(format!("{raw}: {err}")))
        };
        Ok(Self {
            card: parse(r#"[data-testid="listing-card"]"#)?,
            title: parse(r#"[data-testid="ad-title"]"#)?,
            price: parse(r#"[data-testid="ad-price"]"#)?,
            location: parse(r#"[data-testid="location-text"]"#)?,
            link: parse(r#"a[href*="/item/"]"#)?,
            image: parse("img")?,
        })
    }
}

/// Scrapes OLX search result pages over plain HTTP.
pub struct OlxScraper {
    http: Client,
    config: OlxConfig,
    selectors: Selectors,
}

impl OlxScraper {
    pub fn new(config: OlxConfig) -> Result<Self, ScrapeError> {
        Ok(Self {
            http: build_client(),
            config,
            selectors: Selectors::compile()?,
        })
    }

    fn search_url(&self, query: &str, page: u32) -> String {
        let slug = query
            .split_whitespace()
            .map(|word| urlencoding::encode(&word.to_lowercase()).into_owned())
            .collect::<Vec<_>>()
            .join("-");
        let base = self.config.base_url.trim_end_matches('/');
        if page <= 1 {
            format!("{base}/items/q-{slug}")
        } else {
            format!("{base}/items/q-{slug}?page={page}")
        }
    }

    async fn fetch_page(&self, url: &str) -> Result<String, ScrapeError> {
        let response = self
            .http
            .get(url)
            .header("Accept", "text/html")
            .send()
            .await
            .map_err(|err| ScrapeError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ScrapeError::Status(response.status().as_u16()));
        }
        response
            .text()
            .await
            .map_err(|err| ScrapeError::Http(err.to_string()))
    }

    fn parse_page(&self, html: &str) -> Vec<ScrapedListing> {
        let document = Html::parse_document(html);
        document
            .select(&self.selectors.card)
            .filter_map(|card| self.parse_card(card))
            .collect()
    }

    fn parse_card(&self, card: ElementRef<'_>) -> Option<ScrapedListing> {
        let title = first_text(card, &self.selectors.title)?;
        let href = card
            .select(&self.selectors.link)
            .next()
            .and_then(|link| link.value().attr("href"))?;
        let url = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{}{}", self.config.base_url.trim_end_matches('/'), href)
        };
        let image_urls = card
            .select(&self.selectors.image)
            .filter_map(|img| img.value().attr("src"))
            .map(str::to_string)
            .collect();

        Some(ScrapedListing {
            external_id: external_id_from_url(&url),
            title,
            description: None,
            price: first_text(card, &self.selectors.price).and_then(|text| parse_price(&text)),
            location: first_text(card, &self.selectors.location),
            seller_name: None,
            url,
            image_urls,
        })
    }
}

#[async_trait]
impl MarketplaceScraper for OlxScraper {
    async fn search(
        &self,
        query: &str,
        category: Category,
    ) -> Result<Vec<ScrapedListing>, ScrapeError> {
        let mut listings: Vec<ScrapedListing> = Vec::new();
        for page in 1..=self.config.max_pages.max(1) {
            let url = self.search_url(query, page);
            debug!(target = "buysmart.scraper", %url, category = category.as_str(), "olx_fetch");
            let html = match self.fetch_page(&url).await {
                Ok(html) => html,
                // later pages are best effort; the first page decides success
                Err(err) if page > 1 => {
                    warn!(target = "buysmart.scraper", %url, error = %err, "olx_page_skipped");
                    break;
                }
                Err(err) => return Err(err),
            };
            let found = self.parse_page(&html);
            if found.is_empty() {
                break;
            }
            for item in found {
                if !listings.iter().any(|l| l.external_id == item.external_id) {
                    listings.push(item);
                }
            }
        }
        info!(
            target = "buysmart.scraper",
            query,
            found = listings.len(),
            "olx_search_done"
        );
        Ok(listings)
    }

    fn source_name(&self) -> &'static str {
        "olx"
    }
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
}

/// `"₹ 35,000"` → `35000.0`; first digit run wins.
pub(crate) fn parse_price(text: &str) -> Option<f64> {
    let digits: String = text
        .chars()
        .filter(|c| *c != ',')
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<f64>().ok()
}

/// OLX item URLs end in `-iid-<number>`; fall back to the path itself.
pub(crate) fn external_id_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if let Some((_, tail)) = path.rsplit_once("iid-") {
        let id: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !id.is_empty() {
            return id;
        }
    }
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
    <html><body><ul>
      <li data-testid="listing-card">
        <a href="/item/iphone-12-64gb-iid-1700123456"><img src="https://img.olx/a.jpg"/>
          <span data-testid="ad-price">₹ 35,000</span>
          <span data-testid="ad-title">iPhone 12 64GB</span>
          <span data-testid="location-text">Andheri, Mumbai</span>
        </a>
      </li>
      <li data-testid="listing-card">
        <a href="https://www.olx.in/item/iphone-12-cracked-iid-1700999">
          <span data-testid="ad-price">₹ 40,000</span>
          <span data-testid="ad-title">cracked screen iPhone 12</span>
        </a>
      </li>
      <li data-testid="listing-card"><span>no title, skipped</span></li>
    </ul></body></html>
    "#;

    #[test]
    fn parses_cards() {
        let scraper = OlxScraper::new(OlxConfig::default()).expect("selectors");
        let items = scraper.parse_page(PAGE);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].external_id, "1700123456");
        assert_eq!(items[0].price, Some(35000.0));
        assert_eq!(items[0].location.as_deref(), Some("Andheri, Mumbai"));
        assert_eq!(
            items[0].url,
            "https://www.olx.in/item/iphone-12-64gb-iid-1700123456"
        );
        assert_eq!(items[0].image_urls, vec!["https://img.olx/a.jpg".to_string()]);
        assert_eq!(items[1].title, "cracked screen iPhone 12");
        assert!(items[1].location.is_none());
    }

    #[test]
    fn builds_search_urls() {
        let scraper = OlxScraper::new(OlxConfig::default()).expect("selectors");
        assert_eq!(
            scraper.search_url("iPhone 12", 1),
            "https://www.olx.in/items/q-iphone-12"
        );
        assert_eq!(
            scraper.search_url("iPhone 12", 2),
            "https://www.olx.in/items/q-iphone-12?page=2"
        );
    }

    #[test]
    fn price_and_id_helpers() {
        assert_eq!(parse_price("₹ 1,25,000"), Some(125000.0));
        assert_eq!(parse_price("Free"), None);
        assert_eq!(external_id_from_url("https://x/item/foo-iid-42?x=1"), "42");
        assert_eq!(external_id_from_url("https://x/item/foo-bar/"), "foo-bar");
    }
}
