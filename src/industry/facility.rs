//! Facility records and rig applicability.
//!
//! A facility snapshot is a closed record serialized to a JSON column at the
//! store boundary; the engines only ever see the typed form.

use serde::{Deserialize, Serialize};

/// Security band of the system a facility sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityBand {
    High,
    Low,
    Null,
}

impl SecurityBand {
    /// Band boundaries: `<= 0.0` null, `(0.0, 0.5)` low, `>= 0.5` high.
    pub fn from_security(security: f64) -> Self {
        if security <= 0.0 {
            SecurityBand::Null
        } else if security < 0.5 {
            SecurityBand::Low
        } else {
            SecurityBand::High
        }
    }
}

/// A rig fitted to a manufacturing structure. Bonuses are percentages; a
/// material bonus of -2.0 means 2% fewer materials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacilityRig {
    pub type_id: i64,
    pub name: String,
    /// Material-quantity bonus percent (negative reduces).
    pub material_bonus: f64,
    /// Job-cost bonus percent (positive reduces, summed on the cost path).
    pub cost_bonus: f64,
    /// Product groups the rig's effect set covers; empty covers everything.
    pub applicable_groups: Vec<i64>,
    /// Security bands the rig is active in.
    pub applicable_bands: Vec<SecurityBand>,
}

impl FacilityRig {
    pub fn applies_to(&self, product_group_id: Option<i64>, band: SecurityBand) -> bool {
        if !self.applicable_bands.is_empty() && !self.applicable_bands.contains(&band) {
            return false;
        }
        match (self.applicable_groups.is_empty(), product_group_id) {
            (true, _) => true,
            (false, Some(group)) => self.applicable_groups.contains(&group),
            (false, None) => false,
        }
    }
}

/// Closed facility record. `structure_type_id` present marks a player-owned
/// Upwell structure, which carries the flat 1% material bonus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Facility {
    pub facility_id: i64,
    pub name: String,
    pub system_id: i64,
    pub security: f64,
    pub structure_type_id: Option<i64>,
    /// Absolute job-cost reduction percent from the structure hull.
    pub structure_cost_bonus: f64,
    /// Owner-set tax on job install, fraction (0.0 for most player structures).
    pub tax_rate: f64,
    pub rigs: Vec<FacilityRig>,
}

impl Facility {
    pub fn band(&self) -> SecurityBand {
        SecurityBand::from_security(self.security)
    }

    /// Combined multiplicative rig factor on material quantities for a
    /// product group: `Π (1 + bonus/100)` over applicable rigs.
    pub fn rig_material_factor(&self, product_group_id: Option<i64>) -> f64 {
        let band = self.band();
        self.rigs
            .iter()
            .filter(|r| r.applies_to(product_group_id, band))
            .fold(1.0, |acc, r| acc * (1.0 + r.material_bonus / 100.0))
    }

    /// Summed rig job-cost bonus percent for a product group (additive with
    /// the structure bonus on the cost path).
    pub fn rig_cost_bonus(&self, product_group_id: Option<i64>) -> f64 {
        let band = self.band();
        self.rigs
            .iter()
            .filter(|r| r.applies_to(product_group_id, band))
            .map(|r| r.cost_bonus)
            .sum()
    }

    /// Stable key component for memoizing cost results.
    pub fn fingerprint(&self) -> String {
        let rigs: Vec<i64> = self.rigs.iter().map(|r| r.type_id).collect();
        format!(
            "{}:{}:{:?}:{:?}",
            self.facility_id, self.system_id, self.structure_type_id, rigs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_boundaries() {
        assert_eq!(SecurityBand::from_security(-1.0), SecurityBand::Null);
        assert_eq!(SecurityBand::from_security(0.0), SecurityBand::Null);
        assert_eq!(SecurityBand::from_security(0.1), SecurityBand::Low);
        assert_eq!(SecurityBand::from_security(0.4999), SecurityBand::Low);
        assert_eq!(SecurityBand::from_security(0.5), SecurityBand::High);
        assert_eq!(SecurityBand::from_security(1.0), SecurityBand::High);
    }

    fn rig(groups: Vec<i64>, bands: Vec<SecurityBand>) -> FacilityRig {
        FacilityRig {
            type_id: 43867,
            name: "Standup M-Set".to_string(),
            material_bonus: -2.0,
            cost_bonus: 0.0,
            applicable_groups: groups,
            applicable_bands: bands,
        }
    }

    #[test]
    fn rig_applicability_gates_on_group_and_band() {
        let r = rig(vec![18], vec![SecurityBand::High]);
        assert!(r.applies_to(Some(18), SecurityBand::High));
        assert!(!r.applies_to(Some(19), SecurityBand::High));
        assert!(!r.applies_to(Some(18), SecurityBand::Null));
        assert!(!r.applies_to(None, SecurityBand::High));

        let open = rig(vec![], vec![]);
        assert!(open.applies_to(None, SecurityBand::Low));
    }

    #[test]
    fn material_factor_multiplies_applicable_rigs() {
        let facility = Facility {
            facility_id: 1,
            name: "Azbel".to_string(),
            system_id: 30000142,
            security: 0.9,
            structure_type_id: Some(35826),
            structure_cost_bonus: 3.0,
            tax_rate: 0.0,
            rigs: vec![
                rig(vec![18], vec![SecurityBand::High]),
                rig(vec![19], vec![SecurityBand::High]),
            ],
        };
        let factor = facility.rig_material_factor(Some(18));
        assert!((factor - 0.98).abs() < 1e-12);
        assert_eq!(facility.rig_material_factor(Some(25)), 1.0);
    }
}
