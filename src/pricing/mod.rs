//! Market pricing engine.
//!
//! `stats` holds the pure order-book and history math; `realistic` composes
//! it into the hybrid pricer with confidence and warnings.

pub mod realistic;
pub mod stats;

use serde::{Deserialize, Serialize};

/// Confidence ladder: `High > Medium > Low > None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::None => "none",
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceMethod {
    Immediate,
    Vwap,
    Percentile,
    Historical,
    Hybrid,
}

impl Default for PriceMethod {
    fn default() -> Self {
        PriceMethod::Hybrid
    }
}

/// Which side of the book a price is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSide {
    Buy,
    Sell,
}

impl PriceSide {
    pub fn is_buy(&self) -> bool {
        matches!(self, PriceSide::Buy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSide::Buy => "buy",
            PriceSide::Sell => "sell",
        }
    }
}

/// Caller-supplied pricing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingSettings {
    pub price_method: PriceMethod,
    /// Multiplied into every result except overrides.
    pub price_modifier: f64,
    /// Cumulative-volume percentile used by the percentile method.
    pub percentile: f64,
    /// Minimum order volume for the min-volume best-price candidate.
    pub min_volume: i64,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            price_method: PriceMethod::Hybrid,
            price_modifier: 1.0,
            percentile: 0.2,
            min_volume: 1,
        }
    }
}

/// A priced answer with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceResult {
    pub type_id: i64,
    pub price: f64,
    /// "override", "immediate", "vwap", "percentile", "historical", "hybrid".
    pub method: String,
    pub confidence: Confidence,
    pub warnings: Vec<String>,
}

impl PriceResult {
    pub fn zero(type_id: i64) -> Self {
        Self {
            type_id,
            price: 0.0,
            method: "none".to_string(),
            confidence: Confidence::None,
            warnings: vec!["no price data available".to_string()],
        }
    }
}
