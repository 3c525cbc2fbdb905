//! The hybrid pricer: one defensible unit price per (type, region, side).
//!
//! Decision ladder: override wins outright; otherwise candidates are computed
//! from the stored book and history (fetching through ESI only when the store
//! has nothing), dispatched on the configured method, and the result is
//! memoized for five minutes. The modifier multiplies every result except
//! overrides.

use crate::error::CoreResult;
use crate::esi::{CallOptions, EsiClient};
use crate::models::{now_ms, CachedPrice, HistoryDay, MarketOrder};
use crate::pricing::stats::{
    best_price_with_min_volume, historical_average, median, percentile_price, remove_outliers,
    vwap, HistoryField,
};
use crate::pricing::{Confidence, PriceMethod, PriceResult, PriceSide, PricingSettings};
use crate::store::market::{MarketStore, PRICE_CACHE_TTL_MS};
use std::sync::Arc;

pub struct Pricer {
    market: MarketStore,
    esi: Option<Arc<EsiClient>>,
}

struct Candidates {
    immediate: Option<f64>,
    vwap: Option<f64>,
    vwap_incomplete: bool,
    percentile: Option<f64>,
    min_volume_best: Option<f64>,
    outlier_free_best: Option<f64>,
    avg_7d: Option<f64>,
    avg_30d: Option<f64>,
}

impl Pricer {
    pub fn new(market: MarketStore, esi: Option<Arc<EsiClient>>) -> Self {
        Self { market, esi }
    }

    pub async fn realistic_price(
        &self,
        type_id: i64,
        region_id: i64,
        location_id: Option<i64>,
        side: PriceSide,
        quantity: i64,
        settings: &PricingSettings,
    ) -> CoreResult<PriceResult> {
        // A user override beats everything, unmodified.
        if let Some(override_row) = self.market.get_override(type_id).await? {
            return Ok(PriceResult {
                type_id,
                price: override_row.price,
                method: "override".to_string(),
                confidence: Confidence::High,
                warnings: Vec::new(),
            });
        }

        if let Some(cached) = self
            .market
            .get_cached_price(type_id, region_id, location_id, side.as_str())
            .await?
        {
            return Ok(PriceResult {
                type_id,
                price: cached.price,
                method: cached.method,
                confidence: parse_confidence(&cached.confidence),
                warnings: Vec::new(),
            });
        }

        let (orders, history) = self.load_market_data(type_id, region_id).await?;
        let orders: Vec<MarketOrder> = match location_id {
            Some(location) => orders
                .into_iter()
                .filter(|o| o.location_id == location)
                .collect(),
            None => orders,
        };

        let candidates = compute_candidates(&orders, &history, side, quantity, settings);
        let mut result = dispatch(type_id, settings.price_method, &candidates);

        if settings.price_modifier != 1.0 {
            result.price *= settings.price_modifier;
        }

        let now = now_ms();
        self.market
            .put_cached_price(&CachedPrice {
                type_id,
                location_id,
                region_id,
                price_type: side.as_str().to_string(),
                price: result.price,
                method: result.method.clone(),
                confidence: result.confidence.as_str().to_string(),
                calculated_at: now,
                expires_at: now + PRICE_CACHE_TTL_MS,
            })
            .await?;
        Ok(result)
    }

    async fn load_market_data(
        &self,
        type_id: i64,
        region_id: i64,
    ) -> CoreResult<(Vec<MarketOrder>, Vec<HistoryDay>)> {
        let mut orders = self.market.get_orders(region_id, type_id).await?;
        let mut history = self.market.get_history(region_id, type_id).await?;

        if let Some(esi) = &self.esi {
            let opts = CallOptions::default();
            if orders.is_empty() && self.market.orders_fetched_at(region_id, type_id).await?.is_none()
            {
                let (fetched, _meta) = esi.market_orders(region_id, type_id, &opts).await?;
                self.market.replace_orders(region_id, type_id, &fetched).await?;
                orders = fetched;
            }
            if history.is_empty() {
                let (fetched, _meta) = esi.market_history(region_id, type_id, &opts).await?;
                self.market.upsert_history(region_id, type_id, &fetched).await?;
                history = fetched;
            }
        }
        Ok((orders, history))
    }
}

fn parse_confidence(s: &str) -> Confidence {
    match s {
        "high" => Confidence::High,
        "medium" => Confidence::Medium,
        "low" => Confidence::Low,
        _ => Confidence::None,
    }
}

fn best_immediate(orders: &[MarketOrder], side: PriceSide) -> Option<f64> {
    let prices = orders
        .iter()
        .filter(|o| o.is_buy_order == side.is_buy() && o.volume_remain > 0)
        .map(|o| o.price);
    if side.is_buy() {
        prices.fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))))
    } else {
        prices.fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))))
    }
}

fn compute_candidates(
    orders: &[MarketOrder],
    history: &[HistoryDay],
    side: PriceSide,
    quantity: i64,
    settings: &PricingSettings,
) -> Candidates {
    let is_buy = side.is_buy();
    let vwap_result = vwap(orders, quantity.max(1), is_buy);
    let filtered = remove_outliers(orders, is_buy);
    Candidates {
        immediate: best_immediate(orders, side),
        vwap: (vwap_result.filled > 0).then_some(vwap_result.price),
        vwap_incomplete: vwap_result.incomplete,
        percentile: percentile_price(orders, is_buy, settings.percentile),
        min_volume_best: best_price_with_min_volume(orders, is_buy, settings.min_volume),
        outlier_free_best: best_immediate(&filtered, side),
        avg_7d: historical_average(history, HistoryField::Average, Some(7)),
        avg_30d: historical_average(history, HistoryField::Average, Some(30)),
    }
}

fn dispatch(type_id: i64, method: PriceMethod, c: &Candidates) -> PriceResult {
    match method {
        PriceMethod::Immediate => match c.immediate {
            Some(price) => PriceResult {
                type_id,
                price,
                method: "immediate".to_string(),
                confidence: Confidence::High,
                warnings: Vec::new(),
            },
            None => historical_fallback(type_id, c, "no orders"),
        },
        PriceMethod::Vwap => match c.vwap {
            Some(price) if !c.vwap_incomplete => PriceResult {
                type_id,
                price,
                method: "vwap".to_string(),
                confidence: Confidence::High,
                warnings: Vec::new(),
            },
            Some(price) => PriceResult {
                type_id,
                price,
                method: "vwap".to_string(),
                confidence: Confidence::Medium,
                warnings: vec!["order book too shallow for requested quantity".to_string()],
            },
            None => historical_fallback(type_id, c, "no orders"),
        },
        PriceMethod::Percentile => match c.percentile {
            Some(price) => PriceResult {
                type_id,
                price,
                method: "percentile".to_string(),
                confidence: Confidence::High,
                warnings: Vec::new(),
            },
            None => historical_fallback(type_id, c, "no orders"),
        },
        PriceMethod::Historical => match c.avg_30d.or(c.avg_7d) {
            Some(price) => PriceResult {
                type_id,
                price,
                method: "historical".to_string(),
                confidence: Confidence::Medium,
                warnings: Vec::new(),
            },
            None => PriceResult::zero(type_id),
        },
        PriceMethod::Hybrid => hybrid(type_id, c),
    }
}

/// Order-book methods fall back to the 7-day window only; the wider 30-day
/// window belongs to the explicit historical method.
fn historical_fallback(type_id: i64, c: &Candidates, reason: &str) -> PriceResult {
    match c.avg_7d {
        Some(price) => PriceResult {
            type_id,
            price,
            method: "historical".to_string(),
            confidence: Confidence::Low,
            warnings: vec![reason.to_string()],
        },
        None => PriceResult::zero(type_id),
    }
}

/// Median over candidates near the 7-day average, widening when the book
/// disagrees with history, bottoming out at history alone, then zero.
fn hybrid(type_id: i64, c: &Candidates) -> PriceResult {
    let raw: Vec<f64> = [
        c.vwap,
        c.percentile,
        c.min_volume_best,
        c.outlier_free_best,
    ]
    .into_iter()
    .flatten()
    .collect();

    if let Some(avg_7d) = c.avg_7d {
        let near: Vec<f64> = raw
            .iter()
            .copied()
            .filter(|p| *p >= avg_7d * 0.5 && *p <= avg_7d * 1.5)
            .collect();
        if let Some(price) = median(&near) {
            return PriceResult {
                type_id,
                price,
                method: "hybrid".to_string(),
                confidence: Confidence::High,
                warnings: Vec::new(),
            };
        }
    }

    if let Some(price) = median(&raw) {
        return PriceResult {
            type_id,
            price,
            method: "hybrid".to_string(),
            confidence: Confidence::Medium,
            warnings: vec!["order book deviates from historical average".to_string()],
        };
    }

    match c.avg_7d {
        Some(price) => PriceResult {
            type_id,
            price,
            method: "historical".to_string(),
            confidence: Confidence::Low,
            warnings: vec!["no usable orders".to_string()],
        },
        None => PriceResult::zero(type_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::migrations::market_migrations;
    use crate::store::Db;

    fn pricer() -> Pricer {
        let market = MarketStore::new(Db::open_in_memory(&market_migrations()).unwrap());
        Pricer::new(market, None)
    }

    fn sell(order_id: i64, price: f64, volume: i64) -> MarketOrder {
        MarketOrder {
            order_id,
            region_id: 10000002,
            type_id: 34,
            price,
            volume_remain: volume,
            is_buy_order: false,
            location_id: 60003760,
        }
    }

    fn day(date: &str, average: f64) -> HistoryDay {
        HistoryDay {
            region_id: 10000002,
            type_id: 34,
            date: date.to_string(),
            average,
            highest: average,
            lowest: average,
            volume: 100_000,
            order_count: 50,
        }
    }

    #[tokio::test]
    async fn override_wins_and_ignores_modifier() {
        let pricer = pricer();
        pricer.market.set_override(34, 10.0, None).await.unwrap();

        let settings = PricingSettings {
            price_modifier: 1.5,
            ..Default::default()
        };
        let result = pricer
            .realistic_price(34, 10000002, Some(60003760), PriceSide::Sell, 1_000_000, &settings)
            .await
            .unwrap();
        assert_eq!(result.price, 10.0);
        assert_eq!(result.method, "override");
        assert_eq!(result.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn hybrid_prefers_candidates_near_history() {
        let pricer = pricer();
        pricer
            .market
            .replace_orders(
                10000002,
                34,
                &[sell(1, 5.0, 10_000), sell(2, 5.2, 10_000), sell(3, 5.4, 10_000), sell(4, 5.6, 10_000)],
            )
            .await
            .unwrap();
        pricer
            .market
            .upsert_history(
                10000002,
                34,
                &(0..7).map(|i| day(&format!("2026-07-2{i}"), 5.1)).collect::<Vec<_>>(),
            )
            .await
            .unwrap();

        let result = pricer
            .realistic_price(34, 10000002, None, PriceSide::Sell, 1000, &PricingSettings::default())
            .await
            .unwrap();
        assert_eq!(result.method, "hybrid");
        assert_eq!(result.confidence, Confidence::High);
        assert!(result.price >= 5.0 && result.price <= 5.6);
    }

    #[tokio::test]
    async fn empty_book_falls_back_to_history_then_zero() {
        let pricer = pricer();
        pricer
            .market
            .upsert_history(10000002, 34, &[day("2026-07-30", 4.8)])
            .await
            .unwrap();
        let result = pricer
            .realistic_price(34, 10000002, None, PriceSide::Sell, 100, &PricingSettings::default())
            .await
            .unwrap();
        assert_eq!(result.method, "historical");
        assert_eq!(result.confidence, Confidence::Low);
        assert_eq!(result.price, 4.8);

        let nothing = pricer
            .realistic_price(35, 10000002, None, PriceSide::Sell, 100, &PricingSettings::default())
            .await
            .unwrap();
        assert_eq!(nothing.price, 0.0);
        assert_eq!(nothing.confidence, Confidence::None);
    }

    #[test]
    fn only_historical_method_reaches_the_30_day_window() {
        let c = Candidates {
            immediate: None,
            vwap: None,
            vwap_incomplete: false,
            percentile: None,
            min_volume_best: None,
            outlier_free_best: None,
            avg_7d: None,
            avg_30d: Some(4.2),
        };
        for method in [
            PriceMethod::Immediate,
            PriceMethod::Vwap,
            PriceMethod::Percentile,
            PriceMethod::Hybrid,
        ] {
            let result = dispatch(34, method, &c);
            assert_eq!(result.price, 0.0, "{method:?} must not widen to 30d history");
            assert_eq!(result.confidence, Confidence::None);
        }

        let historical = dispatch(34, PriceMethod::Historical, &c);
        assert_eq!(historical.price, 4.2);
        assert_eq!(historical.method, "historical");

        // With a 7-day average present, the book methods use it and nothing
        // else.
        let c = Candidates { avg_7d: Some(5.0), ..c };
        let fallback = dispatch(34, PriceMethod::Immediate, &c);
        assert_eq!(fallback.price, 5.0);
        assert_eq!(fallback.confidence, Confidence::Low);
    }

    #[tokio::test]
    async fn vwap_depth_warning_demotes_confidence() {
        let pricer = pricer();
        pricer
            .market
            .replace_orders(10000002, 34, &[sell(1, 5.0, 100)])
            .await
            .unwrap();
        let settings = PricingSettings {
            price_method: PriceMethod::Vwap,
            ..Default::default()
        };
        let result = pricer
            .realistic_price(34, 10000002, None, PriceSide::Sell, 1000, &settings)
            .await
            .unwrap();
        assert_eq!(result.method, "vwap");
        assert_eq!(result.confidence, Confidence::Medium);
        assert!(!result.warnings.is_empty());
    }

    #[tokio::test]
    async fn result_is_memoized_in_price_cache() {
        let pricer = pricer();
        pricer
            .market
            .replace_orders(10000002, 34, &[sell(1, 5.0, 10_000)])
            .await
            .unwrap();
        let settings = PricingSettings {
            price_method: PriceMethod::Immediate,
            ..Default::default()
        };
        let first = pricer
            .realistic_price(34, 10000002, None, PriceSide::Sell, 100, &settings)
            .await
            .unwrap();
        assert_eq!(first.method, "immediate");

        // Wipe the book; the cached price still answers.
        pricer.market.replace_orders(10000002, 34, &[]).await.unwrap();
        let second = pricer
            .realistic_price(34, 10000002, None, PriceSide::Sell, 100, &settings)
            .await
            .unwrap();
        assert_eq!(second.price, first.price);
        assert_eq!(second.method, "immediate");
    }

    #[tokio::test]
    async fn location_filter_narrows_the_book() {
        let pricer = pricer();
        let mut far = sell(2, 3.0, 10_000);
        far.location_id = 60008494; // different station
        pricer
            .market
            .replace_orders(10000002, 34, &[sell(1, 5.0, 10_000), far])
            .await
            .unwrap();
        let settings = PricingSettings {
            price_method: PriceMethod::Immediate,
            ..Default::default()
        };
        let result = pricer
            .realistic_price(34, 10000002, Some(60003760), PriceSide::Sell, 100, &settings)
            .await
            .unwrap();
        assert_eq!(result.price, 5.0);
    }
}
