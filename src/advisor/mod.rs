//! Per-listing analysis and valuation.
//!
//! Both capabilities are infallible from the caller's side: the LLM-backed
//! implementation degrades to the keyword heuristics and marks the result
//! with [`AdviceSource::Heuristic`].

pub mod compare;
pub mod heuristic;
pub mod llm;
pub mod service;

use crate::llm::LlmError;
use crate::models::{Listing, Requirement};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use compare::ListingComparison;
pub use heuristic::HeuristicAdvisor;
pub use llm::LlmAdvisor;
pub use service::AdvisorService;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdviceSource {
    #[default]
    Llm,
    Heuristic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingAnalysis {
    pub product_type: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub condition: Option<String>,
    #[serde(default)]
    pub red_flags: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Scores are on a 0-10 scale.
    pub relevance_score: f64,
    pub price_score: f64,
    pub condition_score: f64,
    pub overall_score: f64,
    #[serde(default)]
    pub source: AdviceSource,
}

impl ListingAnalysis {
    pub fn apply_scores(&self, listing: &mut Listing, now: DateTime<Utc>) {
        listing.relevance_score = Some(self.relevance_score);
        listing.price_score = Some(self.price_score);
        listing.condition_score = Some(self.condition_score);
        listing.overall_score = Some(self.overall_score);
        if listing.condition.is_none() {
            listing.condition = self.condition.clone();
        }
        listing.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriceVerdict {
    Underpriced,
    Fair,
    Overpriced,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Valuation {
    pub estimated_value: f64,
    pub fair_min: f64,
    pub fair_max: f64,
    pub verdict: PriceVerdict,
    #[serde(default)]
    pub negotiation_tips: Vec<String>,
    /// 0-10.
    pub confidence: f64,
    #[serde(default)]
    pub source: AdviceSource,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("unable to parse model output: {0}")]
    Parse(String),
}

#[async_trait]
pub trait ListingAnalyzer: Send + Sync {
    async fn analyze(&self, listing: &Listing, requirement: &Requirement) -> ListingAnalysis;
}

#[async_trait]
pub trait Valuator: Send + Sync {
    async fn estimate_value(&self, listing: &Listing, requirement: &Requirement) -> Valuation;
}

pub(crate) fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    (value.clamp(0.0, 10.0) * 10.0).round() / 10.0
}

pub(crate) fn weighted_overall(relevance: f64, price: f64, condition: f64) -> f64 {
    clamp_score(relevance * 0.4 + price * 0.35 + condition * 0.25)
}
