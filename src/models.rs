//! Domain records shared across stores, engines, and the control-plane API.
//!
//! All quantities are non-negative integers, all ISK values are f64, all
//! timestamps are milliseconds since epoch. Item ids from the game server can
//! exceed 53-bit safe integers and are carried as opaque strings end to end.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current wall-clock time in milliseconds since epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// An authenticated game character. Tokens are mutated by refresh; removal
/// cascades to every owned inventory row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub character_id: i64,
    pub name: String,
    pub corporation_id: Option<i64>,
    pub alliance_id: Option<i64>,
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token expiry, ms since epoch.
    pub expires_at: i64,
    pub scopes: Vec<String>,
    pub is_default: bool,
    pub added_at: i64,
    pub updated_at: i64,
}

// ---------------------------------------------------------------------------
// Inventory facts (per character, from ESI)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRecord {
    pub character_id: i64,
    pub skill_id: i64,
    pub active_level: i64,
    pub trained_level: i64,
    pub skillpoints: i64,
}

/// A blueprint in a character's hangar. `runs == -1` marks an original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnedBlueprint {
    /// Opaque string: game item ids exceed 53-bit integers.
    pub item_id: String,
    pub type_id: i64,
    pub character_id: i64,
    pub corporation_id: Option<i64>,
    pub location_id: Option<i64>,
    pub location_flag: Option<String>,
    pub quantity: i64,
    pub time_efficiency: i64,
    pub material_efficiency: i64,
    pub runs: i64,
    pub is_copy: bool,
    pub is_corporation: bool,
    /// Where the row came from: "esi" or "manual".
    pub source: String,
    pub manually_added: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub item_id: String,
    pub character_id: i64,
    pub type_id: i64,
    pub location_id: i64,
    pub location_flag: Option<String>,
    pub quantity: i64,
    pub is_singleton: bool,
    pub is_blueprint_copy: Option<bool>,
    pub is_corporation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndustryJob {
    pub job_id: i64,
    pub character_id: i64,
    pub installer_id: i64,
    pub facility_id: i64,
    pub activity_id: i64,
    pub blueprint_type_id: i64,
    pub runs: i64,
    pub status: String,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub completed_date: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub transaction_id: i64,
    pub character_id: i64,
    pub date: i64,
    pub type_id: i64,
    pub quantity: i64,
    pub unit_price: f64,
    pub location_id: i64,
    pub is_buy: bool,
    pub is_personal: bool,
}

// ---------------------------------------------------------------------------
// Market data (per region, per type)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketOrder {
    pub order_id: i64,
    pub region_id: i64,
    pub type_id: i64,
    pub price: f64,
    pub volume_remain: i64,
    pub is_buy_order: bool,
    pub location_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryDay {
    pub region_id: i64,
    pub type_id: i64,
    /// ISO date string "YYYY-MM-DD" as published by the server.
    pub date: String,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub volume: i64,
    pub order_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceOverride {
    pub type_id: i64,
    pub price: f64,
    pub notes: Option<String>,
    pub updated_at: i64,
}

/// A memoized price calculation, valid until `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPrice {
    pub type_id: i64,
    pub location_id: Option<i64>,
    pub region_id: i64,
    /// "buy" or "sell".
    pub price_type: String,
    pub price: f64,
    pub method: String,
    pub confidence: String,
    pub calculated_at: i64,
    pub expires_at: i64,
}

// ---------------------------------------------------------------------------
// Manufacturing plans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Completed,
    Archived,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Active => "active",
            PlanStatus::Completed => "completed",
            PlanStatus::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PlanStatus::Active),
            "completed" => Some(PlanStatus::Completed),
            "archived" => Some(PlanStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: i64,
    pub character_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: PlanStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// How a manufacturable material is treated at a node of the build tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseIntermediates {
    /// Recurse to leaves; ancestors see this node's raw materials.
    RawMaterials,
    /// Stop recursing; the component itself is purchased.
    Components,
    /// Purchase the finished intermediate product.
    Buy,
    /// Reserved for a future optimizer; treated as `RawMaterials`.
    BuildBuy,
}

impl UseIntermediates {
    pub fn as_str(&self) -> &'static str {
        match self {
            UseIntermediates::RawMaterials => "raw_materials",
            UseIntermediates::Components => "components",
            UseIntermediates::Buy => "buy",
            UseIntermediates::BuildBuy => "build_buy",
        }
    }

    /// Unknown strings decode to `RawMaterials`; the raw value stays in the
    /// column so nothing is lost on round-trip.
    pub fn parse(s: &str) -> Self {
        match s {
            "raw_materials" => UseIntermediates::RawMaterials,
            "components" => UseIntermediates::Components,
            "buy" => UseIntermediates::Buy,
            "build_buy" => UseIntermediates::BuildBuy,
            other => {
                tracing::warn!("unknown use_intermediates value '{other}', using raw_materials");
                UseIntermediates::RawMaterials
            }
        }
    }

    /// Whether the cost engine recurses past a manufacturable material here.
    pub fn recurses(&self) -> bool {
        matches!(self, UseIntermediates::RawMaterials | UseIntermediates::BuildBuy)
    }
}

/// One blueprint row of a plan. Top-level rows are user-authored; rows with
/// `is_intermediate` are created by the cost engine and always have a parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanBlueprint {
    pub plan_blueprint_id: i64,
    pub plan_id: i64,
    pub blueprint_type_id: i64,
    pub runs: i64,
    pub lines: i64,
    pub me_level: i64,
    pub te_level: i64,
    pub facility_id: Option<i64>,
    /// Closed `Facility` record serialized to JSON at the store boundary.
    pub facility_snapshot: Option<String>,
    pub use_intermediates: UseIntermediates,
    pub is_intermediate: bool,
    pub parent_blueprint_id: Option<i64>,
    pub intermediate_product_type_id: Option<i64>,
    /// Runs already completed, `0..=runs`. Demand scales by the remainder.
    pub built_runs: i64,
    pub added_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMaterial {
    pub plan_id: i64,
    pub type_id: i64,
    pub quantity: i64,
    pub base_price: Option<f64>,
    pub custom_price: Option<f64>,
    pub price_frozen_at: Option<i64>,
    pub manually_acquired_qty: i64,
    pub acquisition_method: Option<String>,
    pub acquisition_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanProduct {
    pub plan_id: i64,
    pub type_id: i64,
    pub quantity: i64,
    pub base_price: Option<f64>,
    pub price_frozen_at: Option<i64>,
    pub is_intermediate: bool,
    /// 0 = final product; intermediates carry their tree depth.
    pub intermediate_depth: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::Confirmed => "confirmed",
            MatchStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MatchStatus::Pending),
            "confirmed" => Some(MatchStatus::Confirmed),
            "rejected" => Some(MatchStatus::Rejected),
            _ => None,
        }
    }
}

/// A proposed or confirmed link between an observed industry job and a plan
/// blueprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanJobMatch {
    pub match_id: String,
    pub plan_id: i64,
    pub plan_blueprint_id: i64,
    pub job_id: i64,
    pub confidence: f64,
    pub reason: Option<String>,
    pub status: MatchStatus,
    pub confirmed_at: Option<i64>,
    pub confirmed_by_user: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMatchType {
    MaterialBuy,
    ProductSell,
}

impl TransactionMatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionMatchType::MaterialBuy => "material_buy",
            TransactionMatchType::ProductSell => "product_sell",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "material_buy" => Some(TransactionMatchType::MaterialBuy),
            "product_sell" => Some(TransactionMatchType::ProductSell),
            _ => None,
        }
    }
}

/// A proposed or confirmed link between a wallet transaction and a plan
/// material or product. Quantity may be a split of the transaction's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTransactionMatch {
    pub match_id: String,
    pub plan_id: i64,
    pub transaction_id: i64,
    pub type_id: i64,
    pub match_type: TransactionMatchType,
    pub quantity: Option<i64>,
    pub confidence: f64,
    pub reason: Option<String>,
    pub status: MatchStatus,
    pub confirmed_at: Option<i64>,
    pub confirmed_by_user: bool,
}

/// Assets the user has earmarked for a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAssetAllocation {
    pub allocation_id: String,
    pub plan_id: i64,
    pub type_id: i64,
    pub quantity: i64,
    pub is_corporation: bool,
    pub allocated_at: i64,
}
