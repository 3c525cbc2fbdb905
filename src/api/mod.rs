//! Control-plane HTTP API.
//!
//! Thin axum handlers over the library operations. Typed error kinds map to
//! status codes; engine warnings ride along in response bodies instead of
//! failing requests.

pub mod routes;

use crate::config::AppConfig;
use crate::error::CoreError;
use crate::esi::EsiClient;
use crate::industry::CostEngine;
use crate::pricing::realistic::Pricer;
use crate::sde::SdeReader;
use crate::store::character::CharacterStore;
use crate::store::market::MarketStore;
use crate::store::plan::PlanStore;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub characters: CharacterStore,
    pub market: MarketStore,
    pub pricer: Arc<Pricer>,
    pub esi: Option<Arc<EsiClient>>,
    /// Absent when no SDE snapshot is installed; cost workflows then return
    /// `MissingSde` instead of blocking startup.
    pub sde: Option<Arc<SdeReader>>,
    pub engine: Option<Arc<CostEngine>>,
    pub plans: Option<Arc<PlanStore>>,
    pub config: Arc<RwLock<AppConfig>>,
    pub config_dir: PathBuf,
}

impl AppState {
    pub fn plans(&self) -> Result<&Arc<PlanStore>, ApiError> {
        self.plans
            .as_ref()
            .ok_or_else(|| ApiError(CoreError::MissingSde("no snapshot installed".to_string())))
    }

    pub fn engine(&self) -> Result<&Arc<CostEngine>, ApiError> {
        self.engine
            .as_ref()
            .ok_or_else(|| ApiError(CoreError::MissingSde("no snapshot installed".to_string())))
    }

    pub fn sde(&self) -> Result<&Arc<SdeReader>, ApiError> {
        self.sde
            .as_ref()
            .ok_or_else(|| ApiError(CoreError::MissingSde("no snapshot installed".to_string())))
    }

    pub fn esi(&self) -> Result<&Arc<EsiClient>, ApiError> {
        self.esi.as_ref().ok_or_else(|| {
            ApiError(CoreError::Network("no ESI client configured".to_string()))
        })
    }
}

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match &self.0 {
            CoreError::MissingSde(_) => "missing_sde",
            CoreError::MissingCharacter(_) => "missing_character",
            CoreError::TokenRefreshFailed { .. } => "token_refresh_failed",
            CoreError::HttpStatus { .. } => "http_status",
            CoreError::Network(_) => "network",
            CoreError::Deserialize(_) => "deserialize",
            CoreError::BlueprintNotFound(_) => "blueprint_not_found",
            CoreError::RecursionLimit(_) => "recursion_limit",
            CoreError::MissingCostIndex(_) => "missing_cost_index",
            CoreError::MissingPrice(_) => "missing_price",
            CoreError::Constraint(_) => "constraint",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::Cancelled => "cancelled",
            CoreError::Deadline => "deadline",
            CoreError::Database(_) => "database",
        }
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::NotFound(_)
            | CoreError::MissingCharacter(_)
            | CoreError::BlueprintNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Constraint(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::MissingSde(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::TokenRefreshFailed { .. }
            | CoreError::HttpStatus { .. }
            | CoreError::Network(_) => StatusCode::BAD_GATEWAY,
            CoreError::Cancelled | CoreError::Deadline => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.kind(),
        });
        (self.status(), Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // plan.*
        .route("/plans", post(routes::create_plan).get(routes::list_plans))
        .route("/plans/:plan_id", get(routes::get_plan).delete(routes::delete_plan))
        .route("/plans/:plan_id/status", post(routes::set_plan_status))
        .route("/plans/:plan_id/summary", get(routes::plan_summary))
        .route("/plans/:plan_id/materials", get(routes::plan_materials))
        .route("/plans/:plan_id/recalculate", post(routes::recalculate))
        .route("/plans/:plan_id/progress", get(routes::plan_progress))
        .route("/plans/:plan_id/performance", get(routes::plan_performance))
        // blueprint.*
        .route(
            "/plans/:plan_id/blueprints",
            post(routes::add_blueprint).get(routes::list_blueprints),
        )
        .route("/plans/:plan_id/blueprints/bulk", post(routes::bulk_update_blueprints))
        .route(
            "/blueprints/:plan_blueprint_id",
            patch(routes::update_blueprint).delete(routes::remove_blueprint),
        )
        .route("/blueprints/:plan_blueprint_id/built", post(routes::mark_built))
        // materials
        .route(
            "/plans/:plan_id/materials/:type_id/acquired",
            post(routes::mark_acquired).delete(routes::unmark_acquired),
        )
        .route("/plans/:plan_id/materials/cleanup", post(routes::cleanup_acquisitions))
        // matches
        .route(
            "/plans/:plan_id/matches/jobs",
            post(routes::match_jobs).get(routes::list_job_matches),
        )
        .route(
            "/plans/:plan_id/matches/transactions",
            post(routes::match_transactions).get(routes::list_transaction_matches),
        )
        .route("/matches/:table/:match_id/confirm", post(routes::confirm_match))
        .route("/matches/:table/:match_id/reject", post(routes::reject_match))
        .route("/matches/:table/:match_id/unlink", post(routes::unlink_match))
        // calculator.*
        .route("/calculator", post(routes::calculate))
        // market.*
        .route("/market/price", get(routes::market_price))
        .route("/market/overrides", get(routes::list_overrides).post(routes::set_override))
        .route("/market/overrides/:type_id", delete(routes::remove_override))
        .route("/market/refresh", post(routes::refresh_market))
        // esi.*
        .route("/esi/status", get(routes::esi_status))
        .route("/esi/refresh/:character_id/:endpoint", post(routes::esi_refresh))
        // allocations
        .route(
            "/plans/:plan_id/allocations",
            post(routes::allocate_assets).get(routes::list_allocations),
        )
        .route("/allocations/:allocation_id", delete(routes::remove_allocation))
        // characters
        .route("/characters", get(routes::list_characters))
        .route("/characters/:character_id/default", post(routes::set_default_character))
        .route("/characters/:character_id/cache", get(routes::character_cache_state))
        // facility.*
        .route("/facilities", get(routes::list_facilities).post(routes::save_facility))
        .route("/facilities/:facility_id", delete(routes::remove_facility))
        // sde.*
        .route("/sde/search", get(routes::sde_search))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
