//! Derived plan views: acquisition/build progress and planned-vs-actual
//! economics. Actuals come from confirmed transaction matches; plan figures
//! from frozen or current material/product prices.

use crate::error::CoreResult;
use crate::models::{MatchStatus, TransactionMatchType};
use crate::store::character::CharacterStore;
use crate::store::plan::PlanStore;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct PlanProgress {
    pub plan_id: i64,
    /// Fraction of total material demand already covered, 0..=1.
    pub material_progress: f64,
    /// Fraction of planned runs marked or matched as built, 0..=1.
    pub build_progress: f64,
    pub materials_covered: i64,
    pub materials_required: i64,
    pub runs_built: i64,
    pub runs_planned: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanPerformance {
    pub plan_id: i64,
    pub planned_cost: f64,
    pub actual_cost: f64,
    pub planned_value: f64,
    pub actual_revenue: f64,
    pub planned_profit: f64,
    pub actual_profit: f64,
    pub planned_roi: f64,
    pub actual_roi: f64,
}

pub async fn plan_progress(plans: &PlanStore, plan_id: i64) -> CoreResult<PlanProgress> {
    let materials = plans.get_materials(plan_id, false).await?;
    let blueprints = plans.list_blueprints(plan_id).await?;

    let materials_required: i64 = materials.iter().map(|m| m.material.quantity).sum();
    let materials_covered: i64 = materials
        .iter()
        .map(|m| (m.material.quantity - m.still_needed).max(0))
        .sum();

    let runs_planned: i64 = blueprints.iter().map(|b| b.runs).sum();
    let runs_built: i64 = blueprints.iter().map(|b| b.built_runs).sum();

    Ok(PlanProgress {
        plan_id,
        material_progress: ratio(materials_covered, materials_required),
        build_progress: ratio(runs_built, runs_planned),
        materials_covered,
        materials_required,
        runs_built,
        runs_planned,
    })
}

/// Planned figures from the stored summary; actuals from confirmed wallet
/// matches priced at their real transaction prices.
pub async fn plan_performance(
    plans: &PlanStore,
    characters: &CharacterStore,
    plan_id: i64,
) -> CoreResult<PlanPerformance> {
    let summary = plans.get_summary(plan_id).await?;
    let plan = plans.get_plan(plan_id).await?;
    let matches = plans.list_transaction_matches(plan_id).await?;
    let transactions = characters.list_wallet_transactions(plan.character_id).await?;
    let by_id: HashMap<i64, &crate::models::WalletTransaction> =
        transactions.iter().map(|t| (t.transaction_id, t)).collect();

    let mut actual_cost = 0.0;
    let mut actual_revenue = 0.0;
    for m in matches.iter().filter(|m| m.status == MatchStatus::Confirmed) {
        let Some(transaction) = by_id.get(&m.transaction_id) else {
            continue;
        };
        let quantity = m.quantity.unwrap_or(transaction.quantity) as f64;
        let value = quantity * transaction.unit_price;
        match m.match_type {
            TransactionMatchType::MaterialBuy => actual_cost += value,
            TransactionMatchType::ProductSell => actual_revenue += value,
        }
    }

    let planned_profit = summary.estimated_profit;
    let actual_profit = actual_revenue - actual_cost;
    Ok(PlanPerformance {
        plan_id,
        planned_cost: summary.material_cost,
        actual_cost,
        planned_value: summary.product_value,
        actual_revenue,
        planned_profit,
        actual_profit,
        planned_roi: if summary.material_cost > 0.0 {
            planned_profit / summary.material_cost
        } else {
            0.0
        },
        actual_roi: if actual_cost > 0.0 {
            actual_profit / actual_cost
        } else {
            0.0
        },
    })
}

fn ratio(covered: i64, total: i64) -> f64 {
    if total > 0 {
        (covered as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_clamps_and_handles_zero() {
        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(ratio(5, 10), 0.5);
        assert_eq!(ratio(15, 10), 1.0);
    }
}
