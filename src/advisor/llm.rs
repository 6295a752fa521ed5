use super::{
    AdviceSource, AnalysisError, HeuristicAdvisor, ListingAnalysis, ListingAnalyzer,
    PriceVerdict, Valuation, Valuator, clamp_score, weighted_overall,
};
use crate::llm::{LlmClient, LlmMessage, strip_markdown_fence};
use crate::models::{Listing, Requirement};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

const ANALYSIS_FUNCTION: &str = "listing_analysis";
const VALUATION_FUNCTION: &str = "listing_valuation";

const ANALYSIS_PROMPT: &str = r#"
You analyze second-hand marketplace listings in India for a buyer. Given the listing and the buyer's
requirement, respond with a JSON object containing: product_type, brand, model, condition
(new/like new/used/damaged), red_flags (array of strings), recommendations (array of strings),
relevance_score, price_score, condition_score and overall_score (numbers from 0 to 10).
Output JSON only.
"#;

const VALUATION_PROMPT: &str = r#"
You value used products in the Indian market. Given the listing and the buyer's requirement, respond
with a JSON object containing: estimated_value (INR number), fair_min, fair_max, verdict
(underpriced/fair/overpriced relative to the listed price), negotiation_tips (array of strings) and
confidence (0 to 10). Output JSON only.
"#;

/// LLM-backed analyzer and valuator with a heuristic safety net.
pub struct LlmAdvisor {
    llm: Arc<LlmClient>,
    fallback: HeuristicAdvisor,
}

impl LlmAdvisor {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self {
            llm,
            fallback: HeuristicAdvisor,
        }
    }

    async fn ask(
        &self,
        function_name: &str,
        prompt: &str,
        listing: &Listing,
        requirement: &Requirement,
    ) -> Result<String, AnalysisError> {
        let messages = [
            LlmMessage::system(prompt),
            LlmMessage::user(context(listing, requirement).to_string()),
        ];
        let response = self.llm.chat(function_name, &messages).await?;
        Ok(strip_markdown_fence(&response.text))
    }
}

#[async_trait]
impl ListingAnalyzer for LlmAdvisor {
    async fn analyze(&self, listing: &Listing, requirement: &Requirement) -> ListingAnalysis {
        let answer = self
            .ask(ANALYSIS_FUNCTION, ANALYSIS_PROMPT, listing, requirement)
            .await
            .and_then(|text| parse_analysis(&text));
        match answer {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(target = "buysmart.advisor", listing_id = %listing.id, error = %err, "analysis_fallback");
                self.fallback.analysis(listing, requirement)
            }
        }
    }
}

#[async_trait]
impl Valuator for LlmAdvisor {
    async fn estimate_value(&self, listing: &Listing, requirement: &Requirement) -> Valuation {
        let answer = self
            .ask(VALUATION_FUNCTION, VALUATION_PROMPT, listing, requirement)
            .await
            .and_then(|text| parse_valuation(&text, listing.price));
        match answer {
            Ok(valuation) => valuation,
            Err(err) => {
                warn!(target = "buysmart.advisor", listing_id = %listing.id, error = %err, "valuation_fallback");
                self.fallback.valuation(listing, requirement)
            }
        }
    }
}

fn context(listing: &Listing, requirement: &Requirement) -> Value {
    json!({
        "listing": {
            "title": listing.title,
            "description": listing.description,
            "price": listing.price,
            "currency": listing.currency,
            "location": listing.location,
            "condition": listing.condition,
            "seller_rating": listing.seller_rating,
            "photos": listing.image_urls.len(),
        },
        "requirement": {
            "product_query": requirement.product_query,
            "category": requirement.category,
            "budget_min": requirement.budget_min,
            "budget_max": requirement.budget_max,
            "deal_breakers": requirement.deal_breakers,
            "condition_preferences": requirement.condition_preferences,
        }
    })
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    product_type: Option<String>,
    brand: Option<String>,
    model: Option<String>,
    condition: Option<String>,
    #[serde(default)]
    red_flags: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    relevance_score: Option<f64>,
    price_score: Option<f64>,
    condition_score: Option<f64>,
    overall_score: Option<f64>,
}

fn parse_analysis(text: &str) -> Result<ListingAnalysis, AnalysisError> {
    let raw: RawAnalysis =
        serde_json::from_str(text).map_err(|err| AnalysisError::Parse(err.to_string()))?;
    let (Some(relevance), Some(price), Some(condition)) =
        (raw.relevance_score, raw.price_score, raw.condition_score)
    else {
        return Err(AnalysisError::Parse("missing scores".into()));
    };
    let (relevance, price, condition) = (
        clamp_score(relevance),
        clamp_score(price),
        clamp_score(condition),
    );
    Ok(ListingAnalysis {
        product_type: raw.product_type,
        brand: raw.brand,
        model: raw.model,
        condition: raw.condition,
        red_flags: raw.red_flags,
        recommendations: raw.recommendations,
        relevance_score: relevance,
        price_score: price,
        condition_score: condition,
        overall_score: raw
            .overall_score
            .map(clamp_score)
            .unwrap_or_else(|| weighted_overall(relevance, price, condition)),
        source: AdviceSource::Llm,
    })
}

#[derive(Debug, Deserialize)]
struct RawValuation {
    estimated_value: f64,
    fair_min: Option<f64>,
    fair_max: Option<f64>,
    verdict: Option<PriceVerdict>,
    #[serde(default)]
    negotiation_tips: Vec<String>,
    confidence: Option<f64>,
}

fn parse_valuation(text: &str, listed: Option<f64>) -> Result<Valuation, AnalysisError> {
    let raw: RawValuation =
        serde_json::from_str(text).map_err(|err| AnalysisError::Parse(err.to_string()))?;
    if !raw.estimated_value.is_finite() || raw.estimated_value <= 0.0 {
        return Err(AnalysisError::Parse("estimated_value must be positive".into()));
    }
    let estimated = raw.estimated_value;
    let mut fair_min = raw.fair_min.unwrap_or(estimated * 0.85);
    let mut fair_max = raw.fair_max.unwrap_or(estimated * 1.15);
    if fair_min > fair_max {
        std::mem::swap(&mut fair_min, &mut fair_max);
    }
    let verdict = raw.verdict.unwrap_or(match listed {
        Some(p) if p < fair_min => PriceVerdict::Underpriced,
        Some(p) if p > fair_max => PriceVerdict::Overpriced,
        _ => PriceVerdict::Fair,
    });
    Ok(Valuation {
        estimated_value: estimated,
        fair_min,
        fair_max,
        verdict,
        negotiation_tips: raw.negotiation_tips,
        confidence: clamp_score(raw.confidence.unwrap_or(5.0)),
        source: AdviceSource::Llm,
    })
}
