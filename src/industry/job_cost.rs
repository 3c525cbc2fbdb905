//! Job-install cost and trading taxes.
//!
//! EIV comes from the server's adjusted-price table, never market prices.
//! Rig cost bonuses are summed with the structure bonus on this path (the
//! material-quantity path multiplies them instead).

use crate::industry::cost::MaterialTree;
use crate::pricing::PriceResult;
use serde::Serialize;
use std::collections::HashMap;

/// SCC surcharge on every manufacturing job.
const SCC_RATE: f64 = 0.04;
/// Invention jobs pay 2% of EIV as their base.
const INVENTION_EIV_FACTOR: f64 = 0.02;

/// Broker fee: `max(0, 3% − 0.3% · brokerRelations)`.
pub fn broker_fee_rate(broker_relations_level: i64) -> f64 {
    (0.03 - 0.003 * broker_relations_level as f64).max(0.0)
}

/// Sales tax: `7.5% · (1 − 0.11 · accounting)`.
pub fn sales_tax_rate(accounting_level: i64) -> f64 {
    0.075 * (1.0 - 0.11 * accounting_level as f64)
}

/// Estimated Item Value: Σ adjusted price × base quantity × runs over the
/// blueprint's own (unmodified) material rows.
pub fn eiv(
    base_materials: &[(i64, i64)],
    adjusted_prices: &HashMap<i64, f64>,
    runs: i64,
) -> (f64, usize) {
    let mut value = 0.0;
    let mut missing = 0;
    for (type_id, quantity) in base_materials {
        match adjusted_prices.get(type_id) {
            Some(price) => value += price * *quantity as f64 * runs as f64,
            None => missing += 1,
        }
    }
    (value, missing)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobActivity {
    Manufacturing,
    Invention,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobCostResult {
    pub eiv: f64,
    pub gross: f64,
    pub scc_surcharge: f64,
    pub facility_tax: f64,
    pub total: f64,
    pub warnings: Vec<String>,
}

/// Install cost for a job: `JobBase · index · (1 − structure − Σ rigs)` plus
/// SCC and facility tax, both off the unbonused base. A missing cost index
/// prices the job at zero with a warning instead of failing.
pub fn job_install_cost(
    eiv: f64,
    activity: JobActivity,
    system_cost_index: Option<f64>,
    structure_cost_bonus_pct: f64,
    rig_cost_bonus_pct: f64,
    facility_tax_rate: f64,
) -> JobCostResult {
    let job_base = match activity {
        JobActivity::Manufacturing => eiv,
        JobActivity::Invention => eiv * INVENTION_EIV_FACTOR,
    };

    let mut warnings = Vec::new();
    let index = match system_cost_index {
        Some(i) => i,
        None => {
            warnings.push("no system cost index; job install cost set to 0".to_string());
            0.0
        }
    };

    let reduction = (structure_cost_bonus_pct + rig_cost_bonus_pct) / 100.0;
    let gross = job_base * index * (1.0 - reduction);
    let scc_surcharge = job_base * SCC_RATE;
    let facility_tax = job_base * facility_tax_rate;

    JobCostResult {
        eiv,
        gross,
        scc_surcharge,
        facility_tax,
        total: gross + scc_surcharge + facility_tax,
        warnings,
    }
}

/// Fully priced breakdown for a depth-0 evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct PricedBreakdown {
    pub materials_cost: f64,
    pub items_priced: usize,
    pub items_without_prices: usize,
    pub output_value: f64,
    pub job: JobCostResult,
    pub material_broker_fee: f64,
    pub sales_tax: f64,
    pub product_broker_fee: f64,
    pub total_cost: f64,
    pub profit: f64,
    /// `profit / outputValue`; zero when there is no output value.
    pub profit_margin: f64,
    pub warnings: Vec<String>,
}

/// Compose material prices, output price, and job cost into totals. Inputs
/// are already-resolved prices so the composition stays pure.
#[allow(clippy::too_many_arguments)]
pub fn price_breakdown(
    tree: &MaterialTree,
    material_prices: &HashMap<i64, PriceResult>,
    output_unit_price: Option<&PriceResult>,
    job: JobCostResult,
    accounting_level: i64,
    broker_relations_level: i64,
) -> PricedBreakdown {
    let mut warnings = job.warnings.clone();
    let mut materials_cost = 0.0;
    let mut items_priced = 0;
    let mut items_without_prices = 0;

    for (type_id, quantity) in &tree.materials {
        match material_prices.get(type_id) {
            Some(p) if p.price > 0.0 => {
                materials_cost += p.price * *quantity as f64;
                items_priced += 1;
            }
            _ => {
                items_without_prices += 1;
            }
        }
    }
    if items_without_prices > 0 {
        warnings.push(format!("{items_without_prices} materials have no price"));
    }

    let output_value = match (&tree.product, output_unit_price) {
        (Some(product), Some(p)) if p.price > 0.0 => p.price * product.quantity as f64,
        (Some(_), _) => {
            warnings.push("product has no price".to_string());
            0.0
        }
        (None, _) => 0.0,
    };

    let broker_rate = broker_fee_rate(broker_relations_level);
    let sales_rate = sales_tax_rate(accounting_level);
    let material_broker_fee = materials_cost * broker_rate;
    let sales_tax = output_value * sales_rate;
    let product_broker_fee = output_value * broker_rate;

    let total_cost =
        materials_cost + job.total + material_broker_fee + sales_tax + product_broker_fee;
    let profit = output_value - total_cost;
    let profit_margin = if output_value > 0.0 {
        profit / output_value
    } else {
        0.0
    };

    PricedBreakdown {
        materials_cost,
        items_priced,
        items_without_prices,
        output_value,
        job,
        material_broker_fee,
        sales_tax,
        product_broker_fee,
        total_cost,
        profit,
        profit_margin,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::industry::cost::{BlueprintNode, ProductOutput};
    use crate::pricing::Confidence;
    use std::collections::BTreeMap;

    #[test]
    fn tax_rates_at_skill_extremes() {
        assert!((broker_fee_rate(0) - 0.03).abs() < 1e-12);
        assert!((broker_fee_rate(5) - 0.015).abs() < 1e-12);
        assert_eq!(broker_fee_rate(100), 0.0);
        assert!((sales_tax_rate(0) - 0.075).abs() < 1e-12);
        assert!((sales_tax_rate(5) - 0.033_75).abs() < 1e-12);
    }

    #[test]
    fn eiv_counts_missing_adjusted_prices() {
        let base = vec![(34i64, 100i64), (35, 50)];
        let mut adjusted = HashMap::new();
        adjusted.insert(34i64, 4.0);
        let (value, missing) = eiv(&base, &adjusted, 10);
        assert_eq!(value, 4000.0);
        assert_eq!(missing, 1);
    }

    #[test]
    fn job_cost_composition() {
        let job = job_install_cost(1000.0, JobActivity::Manufacturing, Some(0.05), 3.0, 2.0, 0.01);
        // gross = 1000 * 0.05 * 0.95 = 47.5; scc = 40; tax = 10.
        assert!((job.gross - 47.5).abs() < 1e-9);
        assert!((job.scc_surcharge - 40.0).abs() < 1e-9);
        assert!((job.facility_tax - 10.0).abs() < 1e-9);
        assert!((job.total - 97.5).abs() < 1e-9);
        assert!(job.warnings.is_empty());
    }

    #[test]
    fn missing_cost_index_warns_and_zeroes() {
        let job = job_install_cost(1000.0, JobActivity::Manufacturing, None, 0.0, 0.0, 0.0);
        assert_eq!(job.gross, 0.0);
        assert!((job.total - 40.0).abs() < 1e-9);
        assert_eq!(job.warnings.len(), 1);
    }

    #[test]
    fn invention_base_is_two_percent_of_eiv() {
        let job = job_install_cost(1000.0, JobActivity::Invention, Some(0.05), 0.0, 0.0, 0.0);
        assert!((job.gross - 1.0).abs() < 1e-9);
        assert!((job.scc_surcharge - 0.8).abs() < 1e-9);
    }

    fn priced(type_id: i64, price: f64) -> PriceResult {
        PriceResult {
            type_id,
            price,
            method: "immediate".to_string(),
            confidence: Confidence::High,
            warnings: vec![],
        }
    }

    #[test]
    fn max_skill_taxes_scenario() {
        // materials 10 000, output 20 000, accounting 5, broker relations 5.
        let mut materials = BTreeMap::new();
        materials.insert(34i64, 1000i64);
        let tree = MaterialTree {
            materials,
            product: Some(ProductOutput {
                type_id: 900,
                base_quantity: 1,
                quantity: 2,
            }),
            root: BlueprintNode {
                blueprint_type_id: 1000,
                product_type_id: Some(900),
                product_per_run: 1,
                runs: 2,
                lines: 1,
                me_level: 0,
                te_level: 0,
                depth: 0,
                seconds_per_run: None,
                materials: vec![],
                children: vec![],
            },
            warnings: vec![],
        };
        let mut prices = HashMap::new();
        prices.insert(34i64, priced(34, 10.0));
        let output = priced(900, 10_000.0);
        let job = job_install_cost(0.0, JobActivity::Manufacturing, Some(0.0), 0.0, 0.0, 0.0);

        let breakdown = price_breakdown(&tree, &prices, Some(&output), job, 5, 5);
        assert!((breakdown.materials_cost - 10_000.0).abs() < 1e-9);
        assert!((breakdown.output_value - 20_000.0).abs() < 1e-9);
        assert!((breakdown.material_broker_fee - 150.0).abs() < 1e-9);
        assert!((breakdown.sales_tax - 675.0).abs() < 1e-9);
        assert!((breakdown.product_broker_fee - 300.0).abs() < 1e-9);
        let taxes = breakdown.material_broker_fee + breakdown.sales_tax + breakdown.product_broker_fee;
        assert!((taxes - 1125.0).abs() < 1e-9);
        assert!((breakdown.profit - (20_000.0 - 10_000.0 - 1125.0)).abs() < 1e-9);
    }

    #[test]
    fn unpriced_materials_still_produce_totals() {
        let mut materials = BTreeMap::new();
        materials.insert(34i64, 100i64);
        materials.insert(35i64, 100i64);
        let tree = MaterialTree {
            materials,
            product: None,
            root: BlueprintNode {
                blueprint_type_id: 1000,
                product_type_id: None,
                product_per_run: 0,
                runs: 1,
                lines: 1,
                me_level: 0,
                te_level: 0,
                depth: 0,
                seconds_per_run: None,
                materials: vec![],
                children: vec![],
            },
            warnings: vec![],
        };
        let mut prices = HashMap::new();
        prices.insert(34i64, priced(34, 5.0));
        let job = job_install_cost(0.0, JobActivity::Manufacturing, Some(0.0), 0.0, 0.0, 0.0);
        let breakdown = price_breakdown(&tree, &prices, None, job, 0, 0);
        assert_eq!(breakdown.items_priced, 1);
        assert_eq!(breakdown.items_without_prices, 1);
        assert!((breakdown.materials_cost - 500.0).abs() < 1e-9);
        assert!(breakdown.warnings.iter().any(|w| w.contains("no price")));
    }
}
