//! Route handlers: request/response DTOs and the glue between HTTP and the
//! library operations.

use crate::analytics;
use crate::api::{ApiError, AppState};
use crate::error::CoreError;
use crate::esi::CallOptions;
use crate::industry::{
    eiv, job_install_cost, price_breakdown, CostRequest, Facility, JobActivity, MaterialTree,
    PricedBreakdown,
};
use crate::models::{now_ms, PlanStatus, UseIntermediates};
use crate::pricing::{PriceResult, PriceSide, PricingSettings};
use crate::reconcile::{
    propose_job_matches, propose_transaction_matches, JobMatcherConfig, TransactionMatcherConfig,
};
use crate::store::plan::{BlueprintConfig, BlueprintPatch, MatchTable};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Accounting skill: reduces sales tax.
const SKILL_ACCOUNTING: i64 = 16622;
/// Broker Relations skill: reduces broker fees.
const SKILL_BROKER_RELATIONS: i64 = 3446;

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// plan.*
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    pub character_id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatePlanResponse {
    pub plan_id: i64,
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(request): Json<CreatePlanRequest>,
) -> ApiResult<CreatePlanResponse> {
    let plan_id = state
        .plans()?
        .create_plan(request.character_id, request.name, request.description)
        .await?;
    Ok(Json(CreatePlanResponse { plan_id }))
}

#[derive(Debug, Deserialize)]
pub struct ListPlansQuery {
    pub character_id: Option<i64>,
}

pub async fn list_plans(
    State(state): State<AppState>,
    Query(query): Query<ListPlansQuery>,
) -> ApiResult<Vec<crate::models::Plan>> {
    Ok(Json(state.plans()?.list_plans(query.character_id).await?))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<crate::models::Plan> {
    Ok(Json(state.plans()?.get_plan(plan_id).await?))
}

pub async fn delete_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.plans()?.delete_plan(plan_id).await?;
    Ok(Json(serde_json::json!({ "deleted": plan_id })))
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: PlanStatus,
}

pub async fn set_plan_status(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
    Json(request): Json<SetStatusRequest>,
) -> ApiResult<serde_json::Value> {
    state.plans()?.set_plan_status(plan_id, request.status).await?;
    Ok(Json(serde_json::json!({ "plan_id": plan_id, "status": request.status.as_str() })))
}

pub async fn plan_summary(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<crate::store::plan::PlanSummary> {
    Ok(Json(state.plans()?.get_summary(plan_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct MaterialsQuery {
    #[serde(default)]
    pub include_assets: bool,
}

pub async fn plan_materials(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
    Query(query): Query<MaterialsQuery>,
) -> ApiResult<Vec<crate::store::plan::MaterialProgress>> {
    Ok(Json(
        state
            .plans()?
            .get_materials(plan_id, query.include_assets)
            .await?,
    ))
}

pub async fn plan_progress(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<analytics::PlanProgress> {
    Ok(Json(analytics::plan_progress(state.plans()?, plan_id).await?))
}

pub async fn plan_performance(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<analytics::PlanPerformance> {
    Ok(Json(
        analytics::plan_performance(state.plans()?, &state.characters, plan_id).await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct RecalculateRequest {
    #[serde(default)]
    pub force_refresh_prices: bool,
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub warnings: Vec<String>,
}

pub async fn recalculate(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
    Json(request): Json<RecalculateRequest>,
) -> ApiResult<MutationResponse> {
    let plans = state.plans()?;
    let warnings = plans.recalculate_materials(plan_id).await?;
    if request.force_refresh_prices {
        refresh_plan_prices(&state, plan_id).await?;
    }
    Ok(Json(MutationResponse { warnings }))
}

/// Price every material and final product of a plan through the hybrid
/// pricer and persist the refreshed unit prices.
async fn refresh_plan_prices(state: &AppState, plan_id: i64) -> Result<(), ApiError> {
    let plans = state.plans()?;
    let (region_id, location_id, input_settings, output_settings) = pricing_context(state);

    let mut material_prices = HashMap::new();
    for material in plans.list_materials(plan_id).await? {
        let result = state
            .pricer
            .realistic_price(
                material.type_id,
                region_id,
                location_id,
                PriceSide::Sell,
                material.quantity.max(1),
                &input_settings,
            )
            .await?;
        if result.price > 0.0 {
            material_prices.insert(material.type_id, result.price);
        }
    }

    let mut product_prices = HashMap::new();
    for product in plans.list_products(plan_id).await? {
        let result = state
            .pricer
            .realistic_price(
                product.type_id,
                region_id,
                location_id,
                PriceSide::Sell,
                product.quantity.max(1),
                &output_settings,
            )
            .await?;
        if result.price > 0.0 {
            product_prices.insert(product.type_id, result.price);
        }
    }

    plans
        .update_prices(plan_id, &material_prices, &product_prices)
        .await?;
    Ok(())
}

fn pricing_context(state: &AppState) -> (i64, Option<i64>, PricingSettings, PricingSettings) {
    let market = state.config.read().market.clone();
    let base = PricingSettings {
        price_method: market.price_method,
        price_modifier: 1.0,
        percentile: market.percentile,
        min_volume: market.min_volume,
    };
    let input = PricingSettings {
        price_modifier: market.input_modifier,
        ..base.clone()
    };
    let output = PricingSettings {
        price_modifier: market.output_modifier,
        ..base
    };
    (market.region_id, market.location_id, input, output)
}

// ---------------------------------------------------------------------------
// blueprint.*
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AddBlueprintRequest {
    pub blueprint_type_id: i64,
    pub runs: i64,
    #[serde(default)]
    pub lines: Option<i64>,
    #[serde(default)]
    pub me_level: Option<i64>,
    #[serde(default)]
    pub te_level: Option<i64>,
    #[serde(default)]
    pub facility_id: Option<i64>,
    #[serde(default)]
    pub use_intermediates: Option<UseIntermediates>,
}

#[derive(Debug, Serialize)]
pub struct AddBlueprintResponse {
    pub plan_blueprint_id: i64,
    pub warnings: Vec<String>,
}

pub async fn add_blueprint(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
    Json(request): Json<AddBlueprintRequest>,
) -> ApiResult<AddBlueprintResponse> {
    let facility = request
        .facility_id
        .and_then(|id| state.config.read().facility(id).cloned());
    let config = BlueprintConfig {
        blueprint_type_id: request.blueprint_type_id,
        runs: request.runs,
        lines: request.lines.unwrap_or(1),
        me_level: request.me_level.unwrap_or(0),
        te_level: request.te_level.unwrap_or(0),
        facility,
        use_intermediates: request.use_intermediates.unwrap_or(UseIntermediates::RawMaterials),
    };
    let (plan_blueprint_id, warnings) = state.plans()?.add_blueprint(plan_id, &config).await?;
    Ok(Json(AddBlueprintResponse {
        plan_blueprint_id,
        warnings,
    }))
}

pub async fn list_blueprints(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<Vec<crate::models::PlanBlueprint>> {
    Ok(Json(state.plans()?.list_blueprints(plan_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBlueprintRequest {
    #[serde(flatten)]
    pub patch: BlueprintPatch,
    #[serde(default)]
    pub skip_recalc: bool,
}

pub async fn update_blueprint(
    State(state): State<AppState>,
    Path(plan_blueprint_id): Path<i64>,
    Json(request): Json<UpdateBlueprintRequest>,
) -> ApiResult<MutationResponse> {
    let warnings = state
        .plans()?
        .update_blueprint(plan_blueprint_id, &request.patch, request.skip_recalc)
        .await?;
    Ok(Json(MutationResponse { warnings }))
}

#[derive(Debug, Deserialize)]
pub struct BulkUpdateRequest {
    pub edits: Vec<(i64, BlueprintPatch)>,
}

pub async fn bulk_update_blueprints(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
    Json(request): Json<BulkUpdateRequest>,
) -> ApiResult<MutationResponse> {
    let warnings = state
        .plans()?
        .bulk_update_blueprints(plan_id, &request.edits)
        .await?;
    Ok(Json(MutationResponse { warnings }))
}

pub async fn remove_blueprint(
    State(state): State<AppState>,
    Path(plan_blueprint_id): Path<i64>,
) -> ApiResult<MutationResponse> {
    let warnings = state.plans()?.remove_blueprint(plan_blueprint_id).await?;
    Ok(Json(MutationResponse { warnings }))
}

#[derive(Debug, Deserialize)]
pub struct MarkBuiltRequest {
    pub built_runs: i64,
}

pub async fn mark_built(
    State(state): State<AppState>,
    Path(plan_blueprint_id): Path<i64>,
    Json(request): Json<MarkBuiltRequest>,
) -> ApiResult<MutationResponse> {
    let warnings = state
        .plans()?
        .mark_intermediate_built(plan_blueprint_id, request.built_runs)
        .await?;
    Ok(Json(MutationResponse { warnings }))
}

// ---------------------------------------------------------------------------
// materials
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MarkAcquiredRequest {
    pub quantity: i64,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub custom_price: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn mark_acquired(
    State(state): State<AppState>,
    Path((plan_id, type_id)): Path<(i64, i64)>,
    Json(request): Json<MarkAcquiredRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .plans()?
        .mark_material_acquired(
            plan_id,
            type_id,
            request.quantity,
            request.method.as_deref(),
            request.custom_price,
            request.note.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::json!({ "plan_id": plan_id, "type_id": type_id })))
}

pub async fn unmark_acquired(
    State(state): State<AppState>,
    Path((plan_id, type_id)): Path<(i64, i64)>,
) -> ApiResult<serde_json::Value> {
    state.plans()?.unmark_material_acquired(plan_id, type_id).await?;
    Ok(Json(serde_json::json!({ "plan_id": plan_id, "type_id": type_id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub type_id: Option<i64>,
}

pub async fn cleanup_acquisitions(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
    Json(request): Json<CleanupRequest>,
) -> ApiResult<serde_json::Value> {
    let cleaned = state
        .plans()?
        .cleanup_excess_acquisitions(plan_id, request.type_id)
        .await?;
    Ok(Json(serde_json::json!({ "cleaned": cleaned })))
}

// ---------------------------------------------------------------------------
// matches
// ---------------------------------------------------------------------------

pub async fn match_jobs(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    let config = JobMatcherConfig {
        min_confidence: state.config.read().market.min_match_confidence,
    };
    let proposed =
        propose_job_matches(state.plans()?, &state.characters, plan_id, &config).await?;
    Ok(Json(serde_json::json!({ "proposed": proposed })))
}

pub async fn match_transactions(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    let market = state.config.read().market.clone();
    let config = TransactionMatcherConfig {
        min_confidence: market.min_match_confidence,
        preferred_location: market.location_id,
    };
    let proposed =
        propose_transaction_matches(state.plans()?, &state.characters, plan_id, &config).await?;
    Ok(Json(serde_json::json!({ "proposed": proposed })))
}

pub async fn list_job_matches(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<Vec<crate::models::PlanJobMatch>> {
    Ok(Json(state.plans()?.list_job_matches(plan_id).await?))
}

pub async fn list_transaction_matches(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<Vec<crate::models::PlanTransactionMatch>> {
    Ok(Json(state.plans()?.list_transaction_matches(plan_id).await?))
}

fn parse_table(table: &str) -> Result<MatchTable, ApiError> {
    match table {
        "jobs" => Ok(MatchTable::Jobs),
        "transactions" => Ok(MatchTable::Transactions),
        other => Err(ApiError(CoreError::NotFound(format!("match table {other}")))),
    }
}

pub async fn confirm_match(
    State(state): State<AppState>,
    Path((table, match_id)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    state
        .plans()?
        .confirm_match(parse_table(&table)?, &match_id)
        .await?;
    Ok(Json(serde_json::json!({ "match_id": match_id, "status": "confirmed" })))
}

pub async fn reject_match(
    State(state): State<AppState>,
    Path((table, match_id)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    state
        .plans()?
        .reject_match(parse_table(&table)?, &match_id)
        .await?;
    Ok(Json(serde_json::json!({ "match_id": match_id, "status": "rejected" })))
}

pub async fn unlink_match(
    State(state): State<AppState>,
    Path((table, match_id)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    state
        .plans()?
        .unlink_match(parse_table(&table)?, &match_id)
        .await?;
    Ok(Json(serde_json::json!({ "match_id": match_id, "status": "pending" })))
}

// ---------------------------------------------------------------------------
// calculator.*
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CalculateRequest {
    pub blueprint_type_id: i64,
    pub runs: i64,
    #[serde(default)]
    pub lines: Option<i64>,
    #[serde(default)]
    pub me_level: Option<i64>,
    #[serde(default)]
    pub te_level: Option<i64>,
    #[serde(default)]
    pub character_id: Option<i64>,
    #[serde(default)]
    pub facility_id: Option<i64>,
    #[serde(default)]
    pub use_intermediates: Option<UseIntermediates>,
    /// Skip pricing for a fast materials-only preview.
    #[serde(default = "default_true")]
    pub with_pricing: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct CalculateResponse {
    pub tree: MaterialTree,
    pub pricing: Option<PricedBreakdown>,
}

/// Cost preview without touching any plan: evaluate the tree, and at depth 0
/// with a system-indexed facility, the full priced breakdown.
pub async fn calculate(
    State(state): State<AppState>,
    Json(request): Json<CalculateRequest>,
) -> ApiResult<CalculateResponse> {
    let engine = state.engine()?.clone();
    let facility = request
        .facility_id
        .and_then(|id| state.config.read().facility(id).cloned());

    let owned = match request.character_id {
        Some(character_id) => state.characters.owned_blueprint_levels(character_id).await?,
        None => Default::default(),
    };
    let cost_request = CostRequest {
        blueprint_type_id: request.blueprint_type_id,
        runs: request.runs,
        lines: request.lines.unwrap_or(1),
        me_level: request.me_level.unwrap_or(0),
        te_level: request.te_level.unwrap_or(0),
        character_id: request.character_id,
        facility: facility.clone(),
        use_intermediates: request.use_intermediates.unwrap_or(UseIntermediates::RawMaterials),
        deadline: None,
    };
    let tree = engine.evaluate(&cost_request, &owned)?;

    let pricing = if request.with_pricing {
        Some(priced_breakdown(&state, &tree, &cost_request, facility.as_ref()).await?)
    } else {
        None
    };
    Ok(Json(CalculateResponse { tree, pricing }))
}

/// Resolve prices, EIV, cost index, and skills, then compose the pure
/// breakdown.
async fn priced_breakdown(
    state: &AppState,
    tree: &MaterialTree,
    request: &CostRequest,
    facility: Option<&Facility>,
) -> Result<PricedBreakdown, ApiError> {
    let sde = state.sde()?;
    let (region_id, location_id, input_settings, output_settings) = pricing_context(state);

    let mut material_prices: HashMap<i64, PriceResult> = HashMap::new();
    for (type_id, quantity) in &tree.materials {
        let result = state
            .pricer
            .realistic_price(
                *type_id,
                region_id,
                location_id,
                PriceSide::Sell,
                (*quantity).max(1),
                &input_settings,
            )
            .await?;
        material_prices.insert(*type_id, result);
    }

    let output_price = match &tree.product {
        Some(product) => Some(
            state
                .pricer
                .realistic_price(
                    product.type_id,
                    region_id,
                    location_id,
                    PriceSide::Sell,
                    product.quantity.max(1),
                    &output_settings,
                )
                .await?,
        ),
        None => None,
    };

    let base_materials = sde.blueprint_materials(
        request.blueprint_type_id,
        crate::sde::ACTIVITY_MANUFACTURING,
    )?;
    let adjusted = state.market.adjusted_prices().await?;
    let (eiv_value, eiv_missing) = eiv(&base_materials, &adjusted, request.runs);

    let (cost_index, structure_bonus, rig_bonus, tax_rate) = match facility {
        Some(f) => (
            state.market.cost_index(f.system_id, "manufacturing").await?,
            f.structure_cost_bonus,
            f.rig_cost_bonus(
                tree.product
                    .as_ref()
                    .and_then(|p| sde.group_id(p.type_id).ok().flatten()),
            ),
            f.tax_rate,
        ),
        None => (None, 0.0, 0.0, 0.0),
    };
    let job = job_install_cost(
        eiv_value,
        JobActivity::Manufacturing,
        cost_index,
        structure_bonus,
        rig_bonus,
        tax_rate,
    );

    let (accounting, broker_relations) = match request.character_id {
        Some(character_id) => (
            state
                .characters
                .effective_skill_level(character_id, SKILL_ACCOUNTING)
                .await?,
            state
                .characters
                .effective_skill_level(character_id, SKILL_BROKER_RELATIONS)
                .await?,
        ),
        None => (0, 0),
    };

    let mut breakdown = price_breakdown(
        tree,
        &material_prices,
        output_price.as_ref(),
        job,
        accounting,
        broker_relations,
    );
    if eiv_missing > 0 {
        breakdown
            .warnings
            .push(format!("{eiv_missing} materials missing adjusted prices"));
    }
    Ok(breakdown)
}

// ---------------------------------------------------------------------------
// market.*
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PriceQuery {
    pub type_id: i64,
    pub region_id: Option<i64>,
    pub location_id: Option<i64>,
    pub side: Option<PriceSide>,
    pub quantity: Option<i64>,
}

pub async fn market_price(
    State(state): State<AppState>,
    Query(query): Query<PriceQuery>,
) -> ApiResult<PriceResult> {
    let (region_id, location_id, input_settings, _) = pricing_context(&state);
    let result = state
        .pricer
        .realistic_price(
            query.type_id,
            query.region_id.unwrap_or(region_id),
            query.location_id.or(location_id),
            query.side.unwrap_or(PriceSide::Sell),
            query.quantity.unwrap_or(1),
            &input_settings,
        )
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub type_id: i64,
    pub price: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn set_override(
    State(state): State<AppState>,
    Json(request): Json<OverrideRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .market
        .set_override(request.type_id, request.price, request.notes.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "type_id": request.type_id })))
}

pub async fn list_overrides(
    State(state): State<AppState>,
) -> ApiResult<Vec<crate::models::PriceOverride>> {
    Ok(Json(state.market.list_overrides().await?))
}

pub async fn remove_override(
    State(state): State<AppState>,
    Path(type_id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    let removed = state.market.remove_override(type_id).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

#[derive(Debug, Deserialize)]
pub struct RefreshMarketRequest {
    pub type_id: i64,
    #[serde(default)]
    pub region_id: Option<i64>,
}

pub async fn refresh_market(
    State(state): State<AppState>,
    Json(request): Json<RefreshMarketRequest>,
) -> ApiResult<serde_json::Value> {
    let esi = state.esi()?.clone();
    let region_id = request
        .region_id
        .unwrap_or_else(|| state.config.read().market.region_id);
    let opts = CallOptions::default();

    let (orders, _) = esi.market_orders(region_id, request.type_id, &opts).await?;
    state
        .market
        .replace_orders(region_id, request.type_id, &orders)
        .await?;
    let (history, _) = esi.market_history(region_id, request.type_id, &opts).await?;
    state
        .market
        .upsert_history(region_id, request.type_id, &history)
        .await?;

    Ok(Json(serde_json::json!({
        "orders": orders.len(),
        "history_days": history.len(),
    })))
}

// ---------------------------------------------------------------------------
// esi.*
// ---------------------------------------------------------------------------

pub async fn esi_status(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let snapshot = state.esi()?.status().snapshot();
    Ok(Json(serde_json::to_value(snapshot).map_err(CoreError::from)?))
}

/// Fetch one endpoint for a character and persist it. The save happens only
/// after the full (paginated) fetch succeeds.
pub async fn esi_refresh(
    State(state): State<AppState>,
    Path((character_id, endpoint)): Path<(i64, String)>,
) -> ApiResult<serde_json::Value> {
    let esi = state.esi()?.clone();
    let opts = CallOptions::default();
    let count = match endpoint.as_str() {
        "info" => {
            let info = esi.character_info(character_id, &opts).await?;
            let mut character = state.characters.get_character(character_id).await?;
            character.name = info.name;
            character.corporation_id = Some(info.corporation_id);
            character.alliance_id = info.alliance_id;
            character.updated_at = now_ms();
            state.characters.upsert_character(&character).await?;
            1
        }
        "skills" => {
            let (skills, meta) = esi.skills(character_id, &opts).await?;
            state
                .characters
                .save_skills(character_id, &skills, meta.expires_at)
                .await?;
            skills.len()
        }
        "blueprints" => {
            let (blueprints, meta) = esi.blueprints(character_id, &opts).await?;
            state
                .characters
                .save_blueprints(character_id, &blueprints, meta.expires_at)
                .await?;
            blueprints.len()
        }
        "assets" => {
            let (assets, meta) = esi.assets(character_id, &opts).await?;
            state
                .characters
                .save_assets(character_id, false, &assets, meta.expires_at)
                .await?;
            assets.len()
        }
        "corporation_assets" => {
            let character = state.characters.get_character(character_id).await?;
            let corporation_id = character.corporation_id.ok_or_else(|| {
                CoreError::Constraint(format!("character {character_id} has no corporation"))
            })?;
            let (assets, meta) = esi
                .corporation_assets(character_id, corporation_id, &opts)
                .await?;
            state
                .characters
                .save_assets(character_id, true, &assets, meta.expires_at)
                .await?;
            assets.len()
        }
        "industry_jobs" => {
            let (jobs, meta) = esi.industry_jobs(character_id, &opts).await?;
            state
                .characters
                .save_industry_jobs(character_id, &jobs, meta.expires_at)
                .await?;
            jobs.len()
        }
        "wallet_transactions" => {
            let (transactions, meta) = esi.wallet_transactions(character_id, &opts).await?;
            state
                .characters
                .save_wallet_transactions(character_id, &transactions, meta.expires_at)
                .await?;
            transactions.len()
        }
        "adjusted_prices" => {
            let (prices, _) = esi.adjusted_prices(&opts).await?;
            state.market.replace_adjusted_prices(&prices).await?;
            prices.len()
        }
        "cost_indices" => {
            let (indices, _) = esi.cost_indices(&opts).await?;
            state.market.replace_cost_indices(&indices).await?;
            indices.len()
        }
        other => {
            return Err(ApiError(CoreError::NotFound(format!("endpoint {other}"))));
        }
    };
    Ok(Json(serde_json::json!({ "endpoint": endpoint, "records": count })))
}

// ---------------------------------------------------------------------------
// allocations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    pub type_id: i64,
    pub quantity: i64,
    #[serde(default)]
    pub is_corporation: bool,
}

pub async fn allocate_assets(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
    Json(request): Json<AllocateRequest>,
) -> ApiResult<serde_json::Value> {
    let allocation_id = state
        .plans()?
        .allocate_assets(plan_id, request.type_id, request.quantity, request.is_corporation)
        .await?;
    Ok(Json(serde_json::json!({ "allocation_id": allocation_id })))
}

pub async fn list_allocations(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<Vec<crate::models::PlanAssetAllocation>> {
    Ok(Json(state.plans()?.list_allocations(plan_id).await?))
}

pub async fn remove_allocation(
    State(state): State<AppState>,
    Path(allocation_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.plans()?.remove_allocation(&allocation_id).await?;
    Ok(Json(serde_json::json!({ "removed": allocation_id })))
}

// ---------------------------------------------------------------------------
// characters
// ---------------------------------------------------------------------------

/// Characters with tokens redacted for the UI.
#[derive(Debug, Serialize)]
pub struct CharacterSummary {
    pub character_id: i64,
    pub name: String,
    pub corporation_id: Option<i64>,
    pub alliance_id: Option<i64>,
    pub is_default: bool,
    pub token_expires_at: i64,
}

pub async fn list_characters(
    State(state): State<AppState>,
) -> ApiResult<Vec<CharacterSummary>> {
    let characters = state.characters.list_characters().await?;
    Ok(Json(
        characters
            .into_iter()
            .map(|c| CharacterSummary {
                character_id: c.character_id,
                name: c.name,
                corporation_id: c.corporation_id,
                alliance_id: c.alliance_id,
                is_default: c.is_default,
                token_expires_at: c.expires_at,
            })
            .collect(),
    ))
}

pub async fn set_default_character(
    State(state): State<AppState>,
    Path(character_id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.characters.set_default(character_id).await?;
    Ok(Json(serde_json::json!({ "default": character_id })))
}

pub async fn character_cache_state(
    State(state): State<AppState>,
    Path(character_id): Path<i64>,
) -> ApiResult<Vec<crate::store::character::EndpointCacheState>> {
    Ok(Json(state.characters.cache_state(character_id).await?))
}

// ---------------------------------------------------------------------------
// facility.*
// ---------------------------------------------------------------------------

pub async fn list_facilities(State(state): State<AppState>) -> ApiResult<Vec<Facility>> {
    Ok(Json(state.config.read().facilities.clone()))
}

pub async fn save_facility(
    State(state): State<AppState>,
    Json(facility): Json<Facility>,
) -> ApiResult<serde_json::Value> {
    let facility_id = facility.facility_id;
    {
        let mut config = state.config.write();
        config.facilities.retain(|f| f.facility_id != facility_id);
        config.facilities.push(facility);
        config
            .save(&state.config_dir)
            .map_err(|e| CoreError::Database(e.to_string()))?;
    }
    Ok(Json(serde_json::json!({ "facility_id": facility_id, "saved_at": now_ms() })))
}

pub async fn remove_facility(
    State(state): State<AppState>,
    Path(facility_id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    let mut config = state.config.write();
    let before = config.facilities.len();
    config.facilities.retain(|f| f.facility_id != facility_id);
    if config.facilities.len() == before {
        return Err(ApiError(CoreError::NotFound(format!("facility {facility_id}"))));
    }
    config
        .save(&state.config_dir)
        .map_err(|e| CoreError::Database(e.to_string()))?;
    Ok(Json(serde_json::json!({ "removed": facility_id })))
}

// ---------------------------------------------------------------------------
// sde.*
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SdeSearchQuery {
    pub q: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TypeHit {
    pub type_id: i64,
    pub name: String,
    pub manufacturable: bool,
}

pub async fn sde_search(
    State(state): State<AppState>,
    Query(query): Query<SdeSearchQuery>,
) -> ApiResult<Vec<TypeHit>> {
    let sde = state.sde()?;
    let hits = sde.search_types(&query.q, query.limit.unwrap_or(25).clamp(1, 100))?;
    let mut out = Vec::with_capacity(hits.len());
    for (type_id, name) in hits {
        out.push(TypeHit {
            type_id,
            name,
            manufacturable: sde.blueprint_for_product(type_id)?.is_some(),
        });
    }
    Ok(Json(out))
}
