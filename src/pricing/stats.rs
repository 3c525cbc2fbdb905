//! Pure computations over order books and daily history. No I/O.

use crate::models::{HistoryDay, MarketOrder};
use statrs::statistics::Statistics;

/// Result of filling a demand greedily against one side of the book.
#[derive(Debug, Clone, PartialEq)]
pub struct VwapResult {
    /// Volume-weighted average over the filled portion; zero if nothing filled.
    pub price: f64,
    pub incomplete: bool,
    pub filled: i64,
    pub requested: i64,
    pub orders_used: usize,
}

/// Volume-weighted average price to fill `qty` units on the requested side.
/// Sell orders are consumed cheapest-first, buy orders highest-first.
pub fn vwap(orders: &[MarketOrder], qty: i64, is_buy: bool) -> VwapResult {
    let mut side: Vec<&MarketOrder> = orders
        .iter()
        .filter(|o| o.is_buy_order == is_buy && o.volume_remain > 0)
        .collect();
    if is_buy {
        side.sort_by(|a, b| b.price.total_cmp(&a.price));
    } else {
        side.sort_by(|a, b| a.price.total_cmp(&b.price));
    }

    let mut remaining = qty;
    let mut cost = 0.0;
    let mut orders_used = 0;
    for order in side {
        if remaining <= 0 {
            break;
        }
        let take = remaining.min(order.volume_remain);
        cost += order.price * take as f64;
        remaining -= take;
        orders_used += 1;
    }

    let filled = qty - remaining;
    VwapResult {
        price: if filled > 0 { cost / filled as f64 } else { 0.0 },
        incomplete: filled < qty,
        filled,
        requested: qty,
        orders_used,
    }
}

/// Price of the first order (ascending by price) whose cumulative volume
/// reaches `p` of the side's total volume. `p` is clamped to [0, 1].
pub fn percentile_price(orders: &[MarketOrder], is_buy: bool, p: f64) -> Option<f64> {
    let mut side: Vec<&MarketOrder> = orders
        .iter()
        .filter(|o| o.is_buy_order == is_buy && o.volume_remain > 0)
        .collect();
    if side.is_empty() {
        return None;
    }
    side.sort_by(|a, b| a.price.total_cmp(&b.price));

    let total: i64 = side.iter().map(|o| o.volume_remain).sum();
    let threshold = p.clamp(0.0, 1.0) * total as f64;
    let mut cumulative = 0i64;
    for order in &side {
        cumulative += order.volume_remain;
        if cumulative as f64 >= threshold {
            return Some(order.price);
        }
    }
    side.last().map(|o| o.price)
}

/// Best price among orders with at least `min_vol` units remaining. When no
/// order qualifies, falls back to the arithmetic mean of the top 5 on the
/// correct side.
pub fn best_price_with_min_volume(
    orders: &[MarketOrder],
    is_buy: bool,
    min_vol: i64,
) -> Option<f64> {
    let side: Vec<&MarketOrder> = orders
        .iter()
        .filter(|o| o.is_buy_order == is_buy && o.volume_remain > 0)
        .collect();
    if side.is_empty() {
        return None;
    }

    let qualified = side.iter().filter(|o| o.volume_remain >= min_vol);
    let best = if is_buy {
        qualified.map(|o| o.price).fold(None, |acc: Option<f64>, p| {
            Some(acc.map_or(p, |a| a.max(p)))
        })
    } else {
        qualified.map(|o| o.price).fold(None, |acc: Option<f64>, p| {
            Some(acc.map_or(p, |a| a.min(p)))
        })
    };
    if best.is_some() {
        return best;
    }

    let mut prices: Vec<f64> = side.iter().map(|o| o.price).collect();
    if is_buy {
        prices.sort_by(|a, b| b.total_cmp(a));
    } else {
        prices.sort_by(|a, b| a.total_cmp(b));
    }
    prices.truncate(5);
    Some(prices.iter().sum::<f64>() / prices.len() as f64)
}

/// IQR outlier filter over one side of the book: keep prices inside
/// `[Q1 − 1.5·IQR, Q3 + 1.5·IQR]`. Fewer than 4 orders pass through intact.
pub fn remove_outliers(orders: &[MarketOrder], is_buy: bool) -> Vec<MarketOrder> {
    let side: Vec<MarketOrder> = orders
        .iter()
        .filter(|o| o.is_buy_order == is_buy)
        .cloned()
        .collect();
    if side.len() < 4 {
        return side;
    }

    let mut prices: Vec<f64> = side.iter().map(|o| o.price).collect();
    prices.sort_by(|a, b| a.total_cmp(b));
    let (q1, q3) = quartiles(&prices);
    let iqr = q3 - q1;
    let low = q1 - 1.5 * iqr;
    let high = q3 + 1.5 * iqr;

    side.into_iter()
        .filter(|o| o.price >= low && o.price <= high)
        .collect()
}

/// Q1/Q3 by the median-of-halves method over an ascending-sorted slice.
fn quartiles(sorted: &[f64]) -> (f64, f64) {
    let n = sorted.len();
    let half = n / 2;
    let lower = &sorted[..half];
    let upper = if n % 2 == 0 {
        &sorted[half..]
    } else {
        &sorted[half + 1..]
    };
    (median_sorted(lower), median_sorted(upper))
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Middle value of the inputs, order-invariant. Even lengths average the two
/// middles.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(median_sorted(&sorted))
}

/// Sample standard deviation; zero for fewer than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().copied().std_dev()
}

/// Which daily field a historical average reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryField {
    Average,
    Highest,
    Lowest,
}

/// Mean of a history field over the most recent `days` entries (all entries
/// when `days` is None). History is expected sorted by date ascending.
pub fn historical_average(
    history: &[HistoryDay],
    field: HistoryField,
    days: Option<usize>,
) -> Option<f64> {
    if history.is_empty() {
        return None;
    }
    let window = match days {
        Some(d) if d < history.len() => &history[history.len() - d..],
        _ => history,
    };
    let values: Vec<f64> = window
        .iter()
        .map(|h| match field {
            HistoryField::Average => h.average,
            HistoryField::Highest => h.highest,
            HistoryField::Lowest => h.lowest,
        })
        .collect();
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn buy(order_id: i64, price: f64, volume: i64) -> MarketOrder {
        MarketOrder {
            is_buy_order: true,
            ..sell(order_id, price, volume)
        }
    }

    #[test]
    fn vwap_exact_fill_averages_both_levels() {
        // Two 1000-unit sell levels at 100 and 200; demand 2000.
        let orders = vec![sell(1, 100.0, 1000), sell(2, 200.0, 1000)];
        let result = vwap(&orders, 2000, false);
        assert_eq!(result.price, 150.0);
        assert!(!result.incomplete);
        assert_eq!(result.filled, 2000);
        assert_eq!(result.requested, 2000);
        assert_eq!(result.orders_used, 2);
    }

    #[test]
    fn vwap_incomplete_iff_depth_short() {
        let orders = vec![sell(1, 100.0, 500)];
        let result = vwap(&orders, 2000, false);
        assert!(result.incomplete);
        assert_eq!(result.filled, 500);
        assert_eq!(result.price, 100.0);

        let empty = vwap(&[], 10, false);
        assert!(empty.incomplete);
        assert_eq!(empty.price, 0.0);
        assert_eq!(empty.filled, 0);
    }

    #[test]
    fn vwap_buy_side_fills_highest_first() {
        let orders = vec![buy(1, 90.0, 100), buy(2, 110.0, 100)];
        let result = vwap(&orders, 100, true);
        assert_eq!(result.price, 110.0);
    }

    #[test]
    fn percentile_picks_first_cumulative_crossing() {
        // Cumulative volumes 1000/3000/6000/10000 at these prices; the 20%
        // threshold of 10000 is 2000, first crossed by the second order.
        let orders = vec![
            sell(1, 6.52, 1000),
            sell(2, 6.53, 2000),
            sell(3, 6.55, 3000),
            sell(4, 6.60, 4000),
        ];
        assert_eq!(percentile_price(&orders, false, 0.2), Some(6.53));
    }

    #[test]
    fn percentile_empty_book_is_none() {
        assert_eq!(percentile_price(&[], false, 0.5), None);
    }

    #[test]
    fn best_with_min_volume_falls_back_to_top5_mean() {
        let orders = vec![sell(1, 10.0, 5), sell(2, 12.0, 5), sell(3, 14.0, 5)];
        assert_eq!(best_price_with_min_volume(&orders, false, 100), Some(12.0));
        // A qualifying order wins outright.
        assert_eq!(best_price_with_min_volume(&orders, false, 5), Some(10.0));
    }

    #[test]
    fn outlier_filter_passthrough_below_four() {
        let orders = vec![sell(1, 1.0, 10), sell(2, 1000.0, 10), sell(3, 2.0, 10)];
        assert_eq!(remove_outliers(&orders, false).len(), 3);

        // Exactly four orders is the first size the filter applies to. A
        // lone extreme still dominates its own quartile at this size, so the
        // bounds widen around it instead of dropping it.
        let four = vec![
            sell(1, 10.0, 10),
            sell(2, 10.1, 10),
            sell(3, 10.2, 10),
            sell(4, 900.0, 10),
        ];
        assert_eq!(remove_outliers(&four, false).len(), 4);
    }

    #[test]
    fn outlier_filter_drops_far_prices() {
        let mut orders: Vec<MarketOrder> =
            (0..8).map(|i| sell(i, 10.0 + i as f64 * 0.1, 10)).collect();
        orders.push(sell(100, 500.0, 10));
        let kept = remove_outliers(&orders, false);
        assert_eq!(kept.len(), 8);
        assert!(kept.iter().all(|o| o.price < 100.0));
    }

    #[test]
    fn median_is_order_invariant() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn std_dev_degenerate_inputs() {
        assert_eq!(std_dev(&[]), 0.0);
        assert_eq!(std_dev(&[5.0]), 0.0);
        assert!(std_dev(&[1.0, 1.0, 1.0]).abs() < 1e-12);
    }

    fn day(date: &str, average: f64) -> HistoryDay {
        HistoryDay {
            region_id: 10000002,
            type_id: 34,
            date: date.to_string(),
            average,
            highest: average * 1.1,
            lowest: average * 0.9,
            volume: 1000,
            order_count: 10,
        }
    }

    #[test]
    fn historical_average_windows_from_the_tail() {
        let history = vec![day("2026-07-01", 10.0), day("2026-07-02", 20.0), day("2026-07-03", 30.0)];
        assert_eq!(
            historical_average(&history, HistoryField::Average, Some(2)),
            Some(25.0)
        );
        assert_eq!(
            historical_average(&history, HistoryField::Average, None),
            Some(20.0)
        );
        assert_eq!(historical_average(&[], HistoryField::Average, None), None);
    }
}
