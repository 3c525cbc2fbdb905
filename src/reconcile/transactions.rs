//! Wallet-transaction matcher.
//!
//! Buys are candidates against plan materials (`material_buy`), sells against
//! plan products (`product_sell`). Type equality is required; locality and
//! magnitude-vs-outstanding-demand shape the score. A transaction's quantity
//! may split across several plans, so the proposed quantity is capped at the
//! outstanding amount.

use crate::error::CoreResult;
use crate::models::{
    MatchStatus, PlanTransactionMatch, TransactionMatchType, WalletTransaction,
};
use crate::store::character::CharacterStore;
use crate::store::plan::PlanStore;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TransactionMatcherConfig {
    pub min_confidence: f64,
    /// The plan's trade hub; transactions there get the locality bonus.
    pub preferred_location: Option<i64>,
}

impl Default for TransactionMatcherConfig {
    fn default() -> Self {
        Self {
            min_confidence: super::DEFAULT_MIN_CONFIDENCE,
            preferred_location: None,
        }
    }
}

/// Score a transaction against one outstanding demand line. The type match
/// is the entry requirement and carries half the score; locality and
/// magnitude proximity split the rest.
pub fn score_transaction(
    transaction: &WalletTransaction,
    type_id: i64,
    outstanding: i64,
    config: &TransactionMatcherConfig,
) -> Option<(f64, i64, String)> {
    if transaction.type_id != type_id || outstanding <= 0 {
        return None;
    }

    let locality = match config.preferred_location {
        Some(location) if location == transaction.location_id => 1.0,
        Some(_) => 0.0,
        // No preferred hub configured: neutral credit.
        None => 0.5,
    };
    let proximity = 1.0
        - ((transaction.quantity - outstanding).abs() as f64 / outstanding.max(1) as f64)
            .min(1.0);

    let confidence = 0.5 + 0.2 * locality + 0.3 * proximity;
    let quantity = transaction.quantity.min(outstanding);
    let reason = format!(
        "type match, locality {:.0}%, {} of {} outstanding",
        locality * 100.0,
        quantity,
        outstanding
    );
    Some((confidence, quantity, reason))
}

/// Run the matcher for one plan and persist proposals. Buys are compared to
/// material demand net of acquisitions; sells to final products.
pub async fn propose_transaction_matches(
    plans: &PlanStore,
    characters: &CharacterStore,
    plan_id: i64,
    config: &TransactionMatcherConfig,
) -> CoreResult<usize> {
    let plan = plans.get_plan(plan_id).await?;
    let transactions = characters.list_wallet_transactions(plan.character_id).await?;
    let materials = plans.get_materials(plan_id, false).await?;
    let products = plans.list_products(plan_id).await?;

    let mut candidates = Vec::new();
    for transaction in &transactions {
        if transaction.is_buy {
            for material in &materials {
                let outstanding = material.still_needed;
                if let Some((confidence, quantity, reason)) =
                    score_transaction(transaction, material.material.type_id, outstanding, config)
                {
                    if confidence >= config.min_confidence {
                        candidates.push(candidate(
                            plan_id,
                            transaction,
                            material.material.type_id,
                            TransactionMatchType::MaterialBuy,
                            confidence,
                            quantity,
                            reason,
                        ));
                    }
                }
            }
        } else {
            for product in products.iter().filter(|p| p.intermediate_depth == 0) {
                if let Some((confidence, quantity, reason)) =
                    score_transaction(transaction, product.type_id, product.quantity, config)
                {
                    if confidence >= config.min_confidence {
                        candidates.push(candidate(
                            plan_id,
                            transaction,
                            product.type_id,
                            TransactionMatchType::ProductSell,
                            confidence,
                            quantity,
                            reason,
                        ));
                    }
                }
            }
        }
    }

    let inserted = plans.propose_transaction_matches(&candidates).await?;
    tracing::debug!(plan_id, candidates = candidates.len(), inserted, "transaction match pass");
    Ok(inserted)
}

#[allow(clippy::too_many_arguments)]
fn candidate(
    plan_id: i64,
    transaction: &WalletTransaction,
    type_id: i64,
    match_type: TransactionMatchType,
    confidence: f64,
    quantity: i64,
    reason: String,
) -> PlanTransactionMatch {
    PlanTransactionMatch {
        match_id: Uuid::new_v4().to_string(),
        plan_id,
        transaction_id: transaction.transaction_id,
        type_id,
        match_type,
        quantity: Some(quantity),
        confidence,
        reason: Some(reason),
        status: MatchStatus::Pending,
        confirmed_at: None,
        confirmed_by_user: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buy(type_id: i64, quantity: i64, location_id: i64) -> WalletTransaction {
        WalletTransaction {
            transaction_id: 1,
            character_id: 1,
            date: 0,
            type_id,
            quantity,
            unit_price: 4.5,
            location_id,
            is_buy: true,
            is_personal: true,
        }
    }

    #[test]
    fn type_mismatch_is_ineligible() {
        let config = TransactionMatcherConfig::default();
        assert!(score_transaction(&buy(34, 100, 60003760), 35, 100, &config).is_none());
        assert!(score_transaction(&buy(34, 100, 60003760), 34, 0, &config).is_none());
    }

    #[test]
    fn exact_quantity_at_hub_scores_full() {
        let config = TransactionMatcherConfig {
            min_confidence: 0.3,
            preferred_location: Some(60003760),
        };
        let (confidence, quantity, _) =
            score_transaction(&buy(34, 1000, 60003760), 34, 1000, &config).unwrap();
        assert!((confidence - 1.0).abs() < 1e-9);
        assert_eq!(quantity, 1000);
    }

    #[test]
    fn oversized_transaction_splits_to_outstanding() {
        let config = TransactionMatcherConfig::default();
        let (_, quantity, _) =
            score_transaction(&buy(34, 5000, 60003760), 34, 1200, &config).unwrap();
        assert_eq!(quantity, 1200);
    }

    #[test]
    fn wrong_hub_loses_the_locality_bonus() {
        let config = TransactionMatcherConfig {
            min_confidence: 0.3,
            preferred_location: Some(60003760),
        };
        let (confidence, _, _) =
            score_transaction(&buy(34, 1000, 60008494), 34, 1000, &config).unwrap();
        assert!((confidence - 0.8).abs() < 1e-9);
    }
}
