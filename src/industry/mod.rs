//! Blueprint cost engine: recursive material trees, facility bonuses, job
//! install cost, and trading taxes.

pub mod cache;
pub mod cost;
pub mod facility;
pub mod job_cost;

pub use cache::{CalcCache, LruCache, NullCache};
pub use cost::{
    BlueprintNode, CostEngine, CostRequest, MaterialTree, OwnedBlueprintLevels, ProductOutput,
    MAX_RECURSION_DEPTH,
};
pub use facility::{Facility, FacilityRig, SecurityBand};
pub use job_cost::{
    broker_fee_rate, eiv, job_install_cost, price_breakdown, sales_tax_rate, JobActivity,
    JobCostResult, PricedBreakdown,
};
