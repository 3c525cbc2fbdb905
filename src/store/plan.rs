//! Plan store: manufacturing plans, their blueprint forest, aggregated
//! materials/products, matches, and allocations.
//!
//! Every mutation runs in one transaction and leaves the aggregates
//! consistent: plan-wide material quantities always equal the summed raw-leaf
//! demand of the blueprint forest, scaled by unbuilt runs. Reconciler passes
//! read through the same connection, so they can never observe a half-updated
//! plan.

use crate::error::{CoreError, CoreResult};
use crate::industry::{CostEngine, CostRequest, Facility, MaterialTree, OwnedBlueprintLevels};
use crate::models::{
    now_ms, MatchStatus, Plan, PlanAssetAllocation, PlanBlueprint, PlanJobMatch, PlanMaterial,
    PlanProduct, PlanStatus, PlanTransactionMatch, TransactionMatchType, UseIntermediates,
};
use crate::store::character::CharacterStore;
use crate::store::Db;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Configuration for a new top-level plan blueprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintConfig {
    pub blueprint_type_id: i64,
    pub runs: i64,
    pub lines: i64,
    pub me_level: i64,
    pub te_level: i64,
    pub facility: Option<Facility>,
    pub use_intermediates: UseIntermediates,
}

/// Partial edit of an existing plan blueprint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlueprintPatch {
    pub runs: Option<i64>,
    pub lines: Option<i64>,
    pub me_level: Option<i64>,
    pub te_level: Option<i64>,
    pub facility: Option<Option<Facility>>,
    pub use_intermediates: Option<UseIntermediates>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub plan_id: i64,
    pub material_cost: f64,
    pub product_value: f64,
    pub estimated_profit: f64,
    /// `profit / materialCost`; zero when the plan has no priced materials.
    pub roi: f64,
    pub materials_with_price: usize,
    pub materials_total: usize,
    pub products_with_price: usize,
    pub products_total: usize,
}

/// One material row with acquisition progress folded in.
#[derive(Debug, Clone, Serialize)]
pub struct MaterialProgress {
    #[serde(flatten)]
    pub material: PlanMaterial,
    pub purchased_quantity: i64,
    pub manufactured_quantity: i64,
    pub still_needed: i64,
    /// (character_id, is_corporation, quantity) holdings, when requested.
    pub assets: Vec<(i64, bool, i64)>,
}

pub struct PlanStore {
    db: Db,
    characters: CharacterStore,
    engine: Arc<CostEngine>,
}

impl PlanStore {
    pub fn new(db: Db, characters: CharacterStore, engine: Arc<CostEngine>) -> Self {
        Self {
            db,
            characters,
            engine,
        }
    }

    // -- plans --------------------------------------------------------------

    pub async fn create_plan(
        &self,
        character_id: i64,
        name: Option<String>,
        description: Option<String>,
    ) -> CoreResult<i64> {
        let name =
            name.unwrap_or_else(|| format!("Plan {}", Utc::now().format("%Y-%m-%d %H:%M")));
        let conn = self.db.conn().await;
        let now = now_ms();
        conn.execute(
            "INSERT INTO plans (character_id, name, description, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?4)",
            params![character_id, name, description, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_plan(&self, plan_id: i64) -> CoreResult<Plan> {
        let conn = self.db.conn().await;
        conn.query_row(
            "SELECT plan_id, character_id, name, description, status, created_at,
                updated_at, completed_at
             FROM plans WHERE plan_id = ?1",
            params![plan_id],
            plan_from_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("plan {plan_id}")))
    }

    pub async fn list_plans(&self, character_id: Option<i64>) -> CoreResult<Vec<Plan>> {
        let conn = self.db.conn().await;
        let mut out = Vec::new();
        match character_id {
            Some(id) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT plan_id, character_id, name, description, status, created_at,
                        updated_at, completed_at
                     FROM plans WHERE character_id = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![id], plan_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT plan_id, character_id, name, description, status, created_at,
                        updated_at, completed_at
                     FROM plans ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map([], plan_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub async fn set_plan_status(&self, plan_id: i64, status: PlanStatus) -> CoreResult<()> {
        let conn = self.db.conn().await;
        let completed_at = match status {
            PlanStatus::Completed => Some(now_ms()),
            _ => None,
        };
        let updated = conn.execute(
            "UPDATE plans SET status = ?2, completed_at = COALESCE(?3, completed_at),
                updated_at = ?4
             WHERE plan_id = ?1",
            params![plan_id, status.as_str(), completed_at, now_ms()],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound(format!("plan {plan_id}")));
        }
        Ok(())
    }

    pub async fn delete_plan(&self, plan_id: i64) -> CoreResult<()> {
        let conn = self.db.conn().await;
        let deleted = conn.execute("DELETE FROM plans WHERE plan_id = ?1", params![plan_id])?;
        if deleted == 0 {
            return Err(CoreError::NotFound(format!("plan {plan_id}")));
        }
        Ok(())
    }

    // -- blueprints ---------------------------------------------------------

    /// Insert a top-level blueprint, expand its intermediate tree, and
    /// re-aggregate the plan, all in one transaction. Returns the new row id
    /// and any aggregation warnings.
    pub async fn add_blueprint(
        &self,
        plan_id: i64,
        config: &BlueprintConfig,
    ) -> CoreResult<(i64, Vec<String>)> {
        let plan = self.get_plan(plan_id).await?;
        let owned = self
            .characters
            .owned_blueprint_levels(plan.character_id)
            .await?;

        let request = CostRequest {
            blueprint_type_id: config.blueprint_type_id,
            runs: config.runs,
            lines: config.lines.max(1),
            me_level: config.me_level,
            te_level: config.te_level,
            character_id: Some(plan.character_id),
            facility: config.facility.clone(),
            use_intermediates: config.use_intermediates,
            deadline: None,
        };
        let tree = self.engine.evaluate(&request, &owned)?;

        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        let facility_json = config
            .facility
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tx.execute(
            "INSERT INTO plan_blueprints (plan_id, blueprint_type_id, runs, lines, me_level,
                te_level, facility_id, facility_snapshot, use_intermediates, is_intermediate,
                parent_blueprint_id, intermediate_product_type_id, built_runs, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL, NULL, 0, ?10)",
            params![
                plan_id,
                config.blueprint_type_id,
                config.runs,
                config.lines.max(1),
                config.me_level,
                config.te_level,
                config.facility.as_ref().map(|f| f.facility_id),
                facility_json,
                config.use_intermediates.as_str(),
                now_ms(),
            ],
        )?;
        let root_id = tx.last_insert_rowid();
        insert_intermediates(&tx, plan_id, root_id, &tree)?;

        let warnings = aggregate_plan(&tx, plan_id, plan.character_id, &self.engine, &owned)?;
        touch_plan(&tx, plan_id)?;
        tx.commit()?;
        Ok((root_id, warnings))
    }

    /// Edit a blueprint row. Unless `skip_recalc`, its intermediate subtree
    /// is rebuilt and the plan re-aggregated.
    pub async fn update_blueprint(
        &self,
        plan_blueprint_id: i64,
        patch: &BlueprintPatch,
        skip_recalc: bool,
    ) -> CoreResult<Vec<String>> {
        let row = self.get_blueprint(plan_blueprint_id).await?;
        let plan = self.get_plan(row.plan_id).await?;
        let owned = self
            .characters
            .owned_blueprint_levels(plan.character_id)
            .await?;

        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        apply_patch(&tx, &row, patch)?;
        let warnings = if skip_recalc {
            Vec::new()
        } else {
            rebuild_subtree(&tx, &self.engine, &owned, plan.character_id, plan_blueprint_id)?;
            aggregate_plan(&tx, row.plan_id, plan.character_id, &self.engine, &owned)?
        };
        touch_plan(&tx, row.plan_id)?;
        tx.commit()?;
        Ok(warnings)
    }

    /// Apply many edits with a single recompute at the end; the performance
    /// lever behind the bulk-edit surface.
    pub async fn bulk_update_blueprints(
        &self,
        plan_id: i64,
        edits: &[(i64, BlueprintPatch)],
    ) -> CoreResult<Vec<String>> {
        let plan = self.get_plan(plan_id).await?;
        let owned = self
            .characters
            .owned_blueprint_levels(plan.character_id)
            .await?;

        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        let mut touched = Vec::new();
        for (plan_blueprint_id, patch) in edits {
            let row = load_blueprint(&tx, *plan_blueprint_id)?
                .ok_or_else(|| CoreError::NotFound(format!("plan blueprint {plan_blueprint_id}")))?;
            if row.plan_id != plan_id {
                return Err(CoreError::Constraint(format!(
                    "blueprint {plan_blueprint_id} does not belong to plan {plan_id}"
                )));
            }
            apply_patch(&tx, &row, patch)?;
            touched.push(*plan_blueprint_id);
        }
        for id in touched {
            rebuild_subtree(&tx, &self.engine, &owned, plan.character_id, id)?;
        }
        let warnings = aggregate_plan(&tx, plan_id, plan.character_id, &self.engine, &owned)?;
        touch_plan(&tx, plan_id)?;
        tx.commit()?;
        Ok(warnings)
    }

    /// Remove a blueprint and its whole subtree, then re-aggregate. Orphaned
    /// manual acquisitions are deleted with a warning per material.
    pub async fn remove_blueprint(&self, plan_blueprint_id: i64) -> CoreResult<Vec<String>> {
        let row = self.get_blueprint(plan_blueprint_id).await?;
        let plan = self.get_plan(row.plan_id).await?;
        let owned = self
            .characters
            .owned_blueprint_levels(plan.character_id)
            .await?;

        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        // Parent FK cascades through the forest.
        tx.execute(
            "DELETE FROM plan_blueprints WHERE plan_blueprint_id = ?1",
            params![plan_blueprint_id],
        )?;
        let warnings = aggregate_plan(&tx, row.plan_id, plan.character_id, &self.engine, &owned)?;
        touch_plan(&tx, row.plan_id)?;
        tx.commit()?;
        Ok(warnings)
    }

    /// Recompute quantities (and aggregation-derived rows) without schema
    /// changes. Price refreshing is composed by the caller.
    pub async fn recalculate_materials(&self, plan_id: i64) -> CoreResult<Vec<String>> {
        let plan = self.get_plan(plan_id).await?;
        let owned = self
            .characters
            .owned_blueprint_levels(plan.character_id)
            .await?;
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        let warnings = aggregate_plan(&tx, plan_id, plan.character_id, &self.engine, &owned)?;
        touch_plan(&tx, plan_id)?;
        tx.commit()?;
        Ok(warnings)
    }

    /// Record progress on an intermediate. Input is clamped to `[0, runs]`;
    /// downstream demand rescales and over-acquired materials warn.
    pub async fn mark_intermediate_built(
        &self,
        plan_blueprint_id: i64,
        built_runs: i64,
    ) -> CoreResult<Vec<String>> {
        let row = self.get_blueprint(plan_blueprint_id).await?;
        let plan = self.get_plan(row.plan_id).await?;
        let owned = self
            .characters
            .owned_blueprint_levels(plan.character_id)
            .await?;
        let clamped = built_runs.clamp(0, row.runs);

        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE plan_blueprints SET built_runs = ?2 WHERE plan_blueprint_id = ?1",
            params![plan_blueprint_id, clamped],
        )?;
        let mut warnings = aggregate_plan(&tx, row.plan_id, plan.character_id, &self.engine, &owned)?;
        warnings.extend(over_acquisition_warnings(&tx, row.plan_id)?);
        touch_plan(&tx, row.plan_id)?;
        tx.commit()?;
        Ok(warnings)
    }

    pub async fn get_blueprint(&self, plan_blueprint_id: i64) -> CoreResult<PlanBlueprint> {
        let conn = self.db.conn().await;
        load_blueprint(&conn, plan_blueprint_id)?
            .ok_or_else(|| CoreError::NotFound(format!("plan blueprint {plan_blueprint_id}")))
    }

    pub async fn list_blueprints(&self, plan_id: i64) -> CoreResult<Vec<PlanBlueprint>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {BLUEPRINT_COLS} FROM plan_blueprints WHERE plan_id = ?1
             ORDER BY plan_blueprint_id"
        ))?;
        let rows = stmt
            .query_map(params![plan_id], blueprint_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- materials ----------------------------------------------------------

    /// Record a manual acquisition for a material. Quantity accumulates.
    pub async fn mark_material_acquired(
        &self,
        plan_id: i64,
        type_id: i64,
        quantity: i64,
        method: Option<&str>,
        custom_price: Option<f64>,
        note: Option<&str>,
    ) -> CoreResult<()> {
        if quantity < 0 {
            return Err(CoreError::Constraint("acquired quantity must be >= 0".into()));
        }
        let conn = self.db.conn().await;
        let updated = conn.execute(
            "UPDATE plan_materials SET
                manually_acquired_qty = manually_acquired_qty + ?3,
                acquisition_method = COALESCE(?4, acquisition_method),
                custom_price = COALESCE(?5, custom_price),
                acquisition_note = COALESCE(?6, acquisition_note)
             WHERE plan_id = ?1 AND type_id = ?2",
            params![plan_id, type_id, quantity, method, custom_price, note],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound(format!(
                "material {type_id} in plan {plan_id}"
            )));
        }
        Ok(())
    }

    pub async fn unmark_material_acquired(&self, plan_id: i64, type_id: i64) -> CoreResult<()> {
        let conn = self.db.conn().await;
        let updated = conn.execute(
            "UPDATE plan_materials SET manually_acquired_qty = 0,
                acquisition_method = NULL, acquisition_note = NULL
             WHERE plan_id = ?1 AND type_id = ?2",
            params![plan_id, type_id],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound(format!(
                "material {type_id} in plan {plan_id}"
            )));
        }
        Ok(())
    }

    /// Clamp manual acquisitions back down to the demanded quantity, for one
    /// material or the whole plan.
    pub async fn cleanup_excess_acquisitions(
        &self,
        plan_id: i64,
        type_id: Option<i64>,
    ) -> CoreResult<usize> {
        let conn = self.db.conn().await;
        let cleaned = match type_id {
            Some(type_id) => conn.execute(
                "UPDATE plan_materials SET manually_acquired_qty = quantity
                 WHERE plan_id = ?1 AND type_id = ?2 AND manually_acquired_qty > quantity",
                params![plan_id, type_id],
            )?,
            None => conn.execute(
                "UPDATE plan_materials SET manually_acquired_qty = quantity
                 WHERE plan_id = ?1 AND manually_acquired_qty > quantity",
                params![plan_id],
            )?,
        };
        Ok(cleaned)
    }

    /// Write freshly computed unit prices onto materials and products that
    /// have no frozen price.
    pub async fn update_prices(
        &self,
        plan_id: i64,
        material_prices: &HashMap<i64, f64>,
        product_prices: &HashMap<i64, f64>,
    ) -> CoreResult<()> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE plan_materials SET base_price = ?3
                 WHERE plan_id = ?1 AND type_id = ?2 AND price_frozen_at IS NULL",
            )?;
            for (type_id, price) in material_prices {
                stmt.execute(params![plan_id, type_id, price])?;
            }
        }
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE plan_products SET base_price = ?3
                 WHERE plan_id = ?1 AND type_id = ?2 AND price_frozen_at IS NULL",
            )?;
            for (type_id, price) in product_prices {
                stmt.execute(params![plan_id, type_id, price])?;
            }
        }
        touch_plan(&tx, plan_id)?;
        tx.commit()?;
        Ok(())
    }

    pub async fn list_materials(&self, plan_id: i64) -> CoreResult<Vec<PlanMaterial>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT plan_id, type_id, quantity, base_price, custom_price, price_frozen_at,
                manually_acquired_qty, acquisition_method, acquisition_note
             FROM plan_materials WHERE plan_id = ?1 ORDER BY type_id",
        )?;
        let rows = stmt
            .query_map(params![plan_id], material_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn list_products(&self, plan_id: i64) -> CoreResult<Vec<PlanProduct>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT plan_id, type_id, quantity, base_price, price_frozen_at, is_intermediate,
                intermediate_depth
             FROM plan_products WHERE plan_id = ?1 ORDER BY intermediate_depth, type_id",
        )?;
        let rows = stmt
            .query_map(params![plan_id], |row| {
                Ok(PlanProduct {
                    plan_id: row.get(0)?,
                    type_id: row.get(1)?,
                    quantity: row.get(2)?,
                    base_price: row.get(3)?,
                    price_frozen_at: row.get(4)?,
                    is_intermediate: row.get::<_, i64>(5)? != 0,
                    intermediate_depth: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Materials with acquisition progress. `still_needed` folds manual
    /// acquisitions, confirmed purchases, and manufactured output together.
    pub async fn get_materials(
        &self,
        plan_id: i64,
        include_assets: bool,
    ) -> CoreResult<Vec<MaterialProgress>> {
        let materials = self.list_materials(plan_id).await?;
        let purchased = self.confirmed_purchases(plan_id).await?;
        let manufactured = self.manufactured_quantities(plan_id).await?;

        let mut out = Vec::with_capacity(materials.len());
        for material in materials {
            let purchased_quantity = purchased.get(&material.type_id).copied().unwrap_or(0);
            let manufactured_quantity =
                manufactured.get(&material.type_id).copied().unwrap_or(0);
            let still_needed = (material.quantity
                - material.manually_acquired_qty
                - purchased_quantity
                - manufactured_quantity)
                .max(0);
            let assets = if include_assets {
                self.characters.asset_quantities(material.type_id).await?
            } else {
                Vec::new()
            };
            out.push(MaterialProgress {
                material,
                purchased_quantity,
                manufactured_quantity,
                still_needed,
                assets,
            });
        }
        Ok(out)
    }

    /// Σ confirmed material-buy match quantities per type.
    async fn confirmed_purchases(&self, plan_id: i64) -> CoreResult<HashMap<i64, i64>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT m.type_id, SUM(COALESCE(m.quantity, t.quantity))
             FROM plan_transaction_matches m
             JOIN wallet_transactions t ON t.transaction_id = m.transaction_id
             WHERE m.plan_id = ?1 AND m.status = 'confirmed' AND m.match_type = 'material_buy'
             GROUP BY m.type_id",
        )?;
        let rows = stmt
            .query_map(params![plan_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    /// Output of confirmed industry-job matches, per produced type.
    async fn manufactured_quantities(&self, plan_id: i64) -> CoreResult<HashMap<i64, i64>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT b.intermediate_product_type_id, b.blueprint_type_id, j.runs
             FROM plan_job_matches m
             JOIN plan_blueprints b ON b.plan_blueprint_id = m.plan_blueprint_id
             JOIN industry_jobs j ON j.job_id = m.job_id
             WHERE m.plan_id = ?1 AND m.status = 'confirmed'
               AND b.intermediate_product_type_id IS NOT NULL",
        )?;
        let rows = stmt
            .query_map(params![plan_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut out: HashMap<i64, i64> = HashMap::new();
        for (product_type_id, blueprint_type_id, runs) in rows {
            let per_run = self
                .engine
                .sde()
                .blueprint_product(blueprint_type_id, crate::sde::ACTIVITY_MANUFACTURING)?
                .map(|(_, q)| q)
                .unwrap_or(1);
            *out.entry(product_type_id).or_insert(0) += runs * per_run;
        }
        Ok(out)
    }

    pub async fn get_summary(&self, plan_id: i64) -> CoreResult<PlanSummary> {
        let materials = self.list_materials(plan_id).await?;
        let products = self.list_products(plan_id).await?;

        let mut material_cost = 0.0;
        let mut materials_with_price = 0;
        for m in &materials {
            if let Some(price) = m.custom_price.or(m.base_price) {
                material_cost += price * m.quantity as f64;
                materials_with_price += 1;
            }
        }

        let finals: Vec<&PlanProduct> =
            products.iter().filter(|p| p.intermediate_depth == 0).collect();
        let mut product_value = 0.0;
        let mut products_with_price = 0;
        for p in &finals {
            if let Some(price) = p.base_price {
                product_value += price * p.quantity as f64;
                products_with_price += 1;
            }
        }

        let estimated_profit = product_value - material_cost;
        Ok(PlanSummary {
            plan_id,
            material_cost,
            product_value,
            estimated_profit,
            roi: if material_cost > 0.0 {
                estimated_profit / material_cost
            } else {
                0.0
            },
            materials_with_price,
            materials_total: materials.len(),
            products_with_price,
            products_total: finals.len(),
        })
    }

    // -- matches ------------------------------------------------------------

    /// Store job-match candidates. An already-proposed (blueprint, job) pair
    /// is left untouched, so rejections stay terminal.
    pub async fn propose_job_matches(&self, matches: &[PlanJobMatch]) -> CoreResult<usize> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO plan_job_matches (match_id, plan_id, plan_blueprint_id,
                    job_id, confidence, reason, status, confirmed_at, confirmed_by_user)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', NULL, 0)",
            )?;
            for m in matches {
                inserted += stmt.execute(params![
                    m.match_id,
                    m.plan_id,
                    m.plan_blueprint_id,
                    m.job_id,
                    m.confidence,
                    m.reason,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub async fn propose_transaction_matches(
        &self,
        matches: &[PlanTransactionMatch],
    ) -> CoreResult<usize> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO plan_transaction_matches (match_id, plan_id,
                    transaction_id, type_id, match_type, quantity, confidence, reason,
                    status, confirmed_at, confirmed_by_user)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', NULL, 0)",
            )?;
            for m in matches {
                inserted += stmt.execute(params![
                    m.match_id,
                    m.plan_id,
                    m.transaction_id,
                    m.type_id,
                    m.match_type.as_str(),
                    m.quantity,
                    m.confidence,
                    m.reason,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub async fn list_job_matches(&self, plan_id: i64) -> CoreResult<Vec<PlanJobMatch>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT match_id, plan_id, plan_blueprint_id, job_id, confidence, reason,
                status, confirmed_at, confirmed_by_user
             FROM plan_job_matches WHERE plan_id = ?1 ORDER BY confidence DESC",
        )?;
        let rows = stmt
            .query_map(params![plan_id], |row| {
                Ok(PlanJobMatch {
                    match_id: row.get(0)?,
                    plan_id: row.get(1)?,
                    plan_blueprint_id: row.get(2)?,
                    job_id: row.get(3)?,
                    confidence: row.get(4)?,
                    reason: row.get(5)?,
                    status: MatchStatus::from_str(&row.get::<_, String>(6)?)
                        .unwrap_or(MatchStatus::Pending),
                    confirmed_at: row.get(7)?,
                    confirmed_by_user: row.get::<_, i64>(8)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn list_transaction_matches(
        &self,
        plan_id: i64,
    ) -> CoreResult<Vec<PlanTransactionMatch>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT match_id, plan_id, transaction_id, type_id, match_type, quantity,
                confidence, reason, status, confirmed_at, confirmed_by_user
             FROM plan_transaction_matches WHERE plan_id = ?1 ORDER BY confidence DESC",
        )?;
        let rows = stmt
            .query_map(params![plan_id], |row| {
                Ok(PlanTransactionMatch {
                    match_id: row.get(0)?,
                    plan_id: row.get(1)?,
                    transaction_id: row.get(2)?,
                    type_id: row.get(3)?,
                    match_type: TransactionMatchType::from_str(&row.get::<_, String>(4)?)
                        .unwrap_or(TransactionMatchType::MaterialBuy),
                    quantity: row.get(5)?,
                    confidence: row.get(6)?,
                    reason: row.get(7)?,
                    status: MatchStatus::from_str(&row.get::<_, String>(8)?)
                        .unwrap_or(MatchStatus::Pending),
                    confirmed_at: row.get(9)?,
                    confirmed_by_user: row.get::<_, i64>(10)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `pending → confirmed`. Confirmed rows are immutable until unlinked.
    pub async fn confirm_match(&self, table: MatchTable, match_id: &str) -> CoreResult<()> {
        self.transition_match(table, match_id, MatchStatus::Pending, MatchStatus::Confirmed)
            .await
    }

    /// `pending → rejected`. Terminal for this subject; re-proposals are
    /// suppressed by the subject's unique index.
    pub async fn reject_match(&self, table: MatchTable, match_id: &str) -> CoreResult<()> {
        self.transition_match(table, match_id, MatchStatus::Pending, MatchStatus::Rejected)
            .await
    }

    /// `confirmed → pending`, keeping the same match id.
    pub async fn unlink_match(&self, table: MatchTable, match_id: &str) -> CoreResult<()> {
        self.transition_match(table, match_id, MatchStatus::Confirmed, MatchStatus::Pending)
            .await
    }

    async fn transition_match(
        &self,
        table: MatchTable,
        match_id: &str,
        from: MatchStatus,
        to: MatchStatus,
    ) -> CoreResult<()> {
        let conn = self.db.conn().await;
        let confirmed_at = match to {
            MatchStatus::Confirmed => Some(now_ms()),
            _ => None,
        };
        let confirmed_by_user = (to == MatchStatus::Confirmed) as i64;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET status = ?2, confirmed_at = ?3, confirmed_by_user = ?4
                 WHERE match_id = ?1 AND status = ?5",
                table.name()
            ),
            params![match_id, to.as_str(), confirmed_at, confirmed_by_user, from.as_str()],
        )?;
        if updated == 0 {
            let current: Option<String> = conn
                .query_row(
                    &format!("SELECT status FROM {} WHERE match_id = ?1", table.name()),
                    params![match_id],
                    |r| r.get(0),
                )
                .optional()?;
            return match current {
                None => Err(CoreError::NotFound(format!("match {match_id}"))),
                Some(status) => Err(CoreError::Conflict(format!(
                    "match {match_id} is {status}, expected {}",
                    from.as_str()
                ))),
            };
        }
        Ok(())
    }

    // -- allocations --------------------------------------------------------

    pub async fn allocate_assets(
        &self,
        plan_id: i64,
        type_id: i64,
        quantity: i64,
        is_corporation: bool,
    ) -> CoreResult<String> {
        let allocation_id = Uuid::new_v4().to_string();
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT INTO plan_asset_allocations (allocation_id, plan_id, type_id, quantity,
                is_corporation, allocated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![allocation_id, plan_id, type_id, quantity, is_corporation as i64, now_ms()],
        )?;
        Ok(allocation_id)
    }

    pub async fn list_allocations(&self, plan_id: i64) -> CoreResult<Vec<PlanAssetAllocation>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT allocation_id, plan_id, type_id, quantity, is_corporation, allocated_at
             FROM plan_asset_allocations WHERE plan_id = ?1 ORDER BY allocated_at",
        )?;
        let rows = stmt
            .query_map(params![plan_id], |row| {
                Ok(PlanAssetAllocation {
                    allocation_id: row.get(0)?,
                    plan_id: row.get(1)?,
                    type_id: row.get(2)?,
                    quantity: row.get(3)?,
                    is_corporation: row.get::<_, i64>(4)? != 0,
                    allocated_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn remove_allocation(&self, allocation_id: &str) -> CoreResult<()> {
        let conn = self.db.conn().await;
        let removed = conn.execute(
            "DELETE FROM plan_asset_allocations WHERE allocation_id = ?1",
            params![allocation_id],
        )?;
        if removed == 0 {
            return Err(CoreError::NotFound(format!("allocation {allocation_id}")));
        }
        Ok(())
    }
}

/// Which match table an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTable {
    Jobs,
    Transactions,
}

impl MatchTable {
    fn name(&self) -> &'static str {
        match self {
            MatchTable::Jobs => "plan_job_matches",
            MatchTable::Transactions => "plan_transaction_matches",
        }
    }
}

// ---------------------------------------------------------------------------
// row mapping
// ---------------------------------------------------------------------------

const BLUEPRINT_COLS: &str = "plan_blueprint_id, plan_id, blueprint_type_id, runs, lines,
    me_level, te_level, facility_id, facility_snapshot, use_intermediates, is_intermediate,
    parent_blueprint_id, intermediate_product_type_id, built_runs, added_at";

fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<Plan> {
    Ok(Plan {
        plan_id: row.get(0)?,
        character_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        status: PlanStatus::from_str(&row.get::<_, String>(4)?).unwrap_or(PlanStatus::Active),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        completed_at: row.get(7)?,
    })
}

fn blueprint_from_row(row: &Row<'_>) -> rusqlite::Result<PlanBlueprint> {
    Ok(PlanBlueprint {
        plan_blueprint_id: row.get(0)?,
        plan_id: row.get(1)?,
        blueprint_type_id: row.get(2)?,
        runs: row.get(3)?,
        lines: row.get(4)?,
        me_level: row.get(5)?,
        te_level: row.get(6)?,
        facility_id: row.get(7)?,
        facility_snapshot: row.get(8)?,
        use_intermediates: UseIntermediates::parse(&row.get::<_, String>(9)?),
        is_intermediate: row.get::<_, i64>(10)? != 0,
        parent_blueprint_id: row.get(11)?,
        intermediate_product_type_id: row.get(12)?,
        built_runs: row.get(13)?,
        added_at: row.get(14)?,
    })
}

fn material_from_row(row: &Row<'_>) -> rusqlite::Result<PlanMaterial> {
    Ok(PlanMaterial {
        plan_id: row.get(0)?,
        type_id: row.get(1)?,
        quantity: row.get(2)?,
        base_price: row.get(3)?,
        custom_price: row.get(4)?,
        price_frozen_at: row.get(5)?,
        manually_acquired_qty: row.get(6)?,
        acquisition_method: row.get(7)?,
        acquisition_note: row.get(8)?,
    })
}

fn load_blueprint(conn: &rusqlite::Connection, id: i64) -> CoreResult<Option<PlanBlueprint>> {
    let row = conn
        .query_row(
            &format!("SELECT {BLUEPRINT_COLS} FROM plan_blueprints WHERE plan_blueprint_id = ?1"),
            params![id],
            blueprint_from_row,
        )
        .optional()?;
    Ok(row)
}

fn touch_plan(tx: &Transaction, plan_id: i64) -> CoreResult<()> {
    tx.execute(
        "UPDATE plans SET updated_at = ?2 WHERE plan_id = ?1",
        params![plan_id, now_ms()],
    )?;
    Ok(())
}

fn apply_patch(tx: &Transaction, row: &PlanBlueprint, patch: &BlueprintPatch) -> CoreResult<()> {
    let runs = patch.runs.unwrap_or(row.runs);
    if runs < 1 {
        return Err(CoreError::Constraint("runs must be >= 1".into()));
    }
    let lines = patch.lines.unwrap_or(row.lines).max(1);
    let me_level = patch.me_level.unwrap_or(row.me_level);
    let te_level = patch.te_level.unwrap_or(row.te_level);
    let use_intermediates = patch.use_intermediates.unwrap_or(row.use_intermediates);
    let (facility_id, facility_json) = match &patch.facility {
        Some(facility) => (
            facility.as_ref().map(|f| f.facility_id),
            facility.as_ref().map(serde_json::to_string).transpose()?,
        ),
        None => (row.facility_id, row.facility_snapshot.clone()),
    };
    let built_runs = row.built_runs.min(runs);

    tx.execute(
        "UPDATE plan_blueprints SET runs = ?2, lines = ?3, me_level = ?4, te_level = ?5,
            facility_id = ?6, facility_snapshot = ?7, use_intermediates = ?8, built_runs = ?9
         WHERE plan_blueprint_id = ?1",
        params![
            row.plan_blueprint_id,
            runs,
            lines,
            me_level,
            te_level,
            facility_id,
            facility_json,
            use_intermediates.as_str(),
            built_runs,
        ],
    )?;
    Ok(())
}

/// Materialize a tree's children as intermediate rows under `parent_id`.
fn insert_intermediates(
    tx: &Transaction,
    plan_id: i64,
    parent_id: i64,
    tree: &MaterialTree,
) -> CoreResult<()> {
    insert_children(tx, plan_id, parent_id, &tree.root.children)
}

fn insert_children(
    tx: &Transaction,
    plan_id: i64,
    parent_id: i64,
    children: &[crate::industry::BlueprintNode],
) -> CoreResult<()> {
    for child in children {
        tx.execute(
            "INSERT INTO plan_blueprints (plan_id, blueprint_type_id, runs, lines, me_level,
                te_level, facility_id, facility_snapshot, use_intermediates, is_intermediate,
                parent_blueprint_id, intermediate_product_type_id, built_runs, added_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, NULL, NULL, 'raw_materials', 1, ?6, ?7, 0, ?8)",
            params![
                plan_id,
                child.blueprint_type_id,
                child.runs,
                child.me_level,
                child.te_level,
                parent_id,
                child.product_type_id,
                now_ms(),
            ],
        )?;
        let child_id = tx.last_insert_rowid();
        insert_children(tx, plan_id, child_id, &child.children)?;
    }
    Ok(())
}

/// Drop a row's descendants and regrow them from a fresh evaluation.
fn rebuild_subtree(
    tx: &Transaction,
    engine: &CostEngine,
    owned: &OwnedBlueprintLevels,
    character_id: i64,
    plan_blueprint_id: i64,
) -> CoreResult<()> {
    let row = load_blueprint(tx, plan_blueprint_id)?
        .ok_or_else(|| CoreError::NotFound(format!("plan blueprint {plan_blueprint_id}")))?;
    tx.execute(
        "DELETE FROM plan_blueprints WHERE parent_blueprint_id = ?1",
        params![plan_blueprint_id],
    )?;
    let tree = engine.evaluate(&request_for_row(&row, character_id)?, owned)?;
    insert_intermediates(tx, row.plan_id, plan_blueprint_id, &tree)
}

fn request_for_row(row: &PlanBlueprint, character_id: i64) -> CoreResult<CostRequest> {
    let facility: Option<Facility> = row
        .facility_snapshot
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    Ok(CostRequest {
        blueprint_type_id: row.blueprint_type_id,
        runs: row.runs,
        lines: row.lines,
        me_level: row.me_level,
        te_level: row.te_level,
        character_id: Some(character_id),
        facility,
        use_intermediates: row.use_intermediates,
        deadline: None,
    })
}

/// Recompute plan-wide materials and products from the blueprint forest.
///
/// Each top-level blueprint is re-evaluated; its tree nodes are paired with
/// the stored intermediate rows by (parent, product type) so `built_runs`
/// scales leaf demand down the path. Stale rows are deleted; a deleted
/// material that still carried a manual acquisition produces a warning.
fn aggregate_plan(
    tx: &Transaction,
    plan_id: i64,
    character_id: i64,
    engine: &CostEngine,
    owned: &OwnedBlueprintLevels,
) -> CoreResult<Vec<String>> {
    let mut warnings = Vec::new();

    let mut stmt = tx.prepare_cached(&format!(
        "SELECT {BLUEPRINT_COLS} FROM plan_blueprints WHERE plan_id = ?1"
    ))?;
    let rows: Vec<PlanBlueprint> = stmt
        .query_map(params![plan_id], blueprint_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    // (parent, product type) -> stored intermediate row
    let by_parent: HashMap<(i64, i64), &PlanBlueprint> = rows
        .iter()
        .filter_map(|r| {
            match (r.parent_blueprint_id, r.intermediate_product_type_id) {
                (Some(parent), Some(product)) => Some(((parent, product), r)),
                _ => None,
            }
        })
        .collect();

    let mut demand: HashMap<i64, i64> = HashMap::new();
    let mut products: HashMap<i64, (i64, i64)> = HashMap::new(); // type -> (qty, min depth)

    for row in rows.iter().filter(|r| !r.is_intermediate) {
        let tree = engine.evaluate(&request_for_row(row, character_id)?, owned)?;
        for warning in &tree.warnings {
            if !warnings.contains(warning) {
                warnings.push(warning.clone());
            }
        }
        if let Some(product) = &tree.product {
            let entry = products.entry(product.type_id).or_insert((0, 0));
            entry.0 += product.quantity;
            // A top-level product is final even if another blueprint also
            // builds it as an intermediate.
            entry.1 = 0;
        }
        accumulate_node(
            &tree.root,
            row,
            1.0,
            &by_parent,
            &mut demand,
            &mut products,
        );
    }

    write_materials(tx, plan_id, &demand, &mut warnings)?;
    write_products(tx, plan_id, &products)?;
    Ok(warnings)
}

/// Walk a tree node against its stored row, scaling leaf demand by the
/// remaining (unbuilt) fraction along the path.
fn accumulate_node(
    node: &crate::industry::BlueprintNode,
    stored: &PlanBlueprint,
    parent_fraction: f64,
    by_parent: &HashMap<(i64, i64), &PlanBlueprint>,
    demand: &mut HashMap<i64, i64>,
    products: &mut HashMap<i64, (i64, i64)>,
) {
    let remaining = if stored.runs > 0 {
        (stored.runs - stored.built_runs) as f64 / stored.runs as f64
    } else {
        0.0
    };
    let fraction = parent_fraction * remaining;

    let mut children = node.children.iter();
    for line in &node.materials {
        if line.expanded {
            if let Some(child_node) = children.next() {
                let key = (stored.plan_blueprint_id, child_node.product_type_id.unwrap_or(0));
                if let Some(child_row) = by_parent.get(&key) {
                    // The intermediate's own product is tracked as a plan
                    // product at its depth.
                    if let Some(product_type) = child_node.product_type_id {
                        let qty = child_node.runs * child_node.product_per_run;
                        let entry = products.entry(product_type).or_insert((0, child_node.depth as i64));
                        entry.0 += qty;
                        entry.1 = entry.1.min(child_node.depth as i64);
                    }
                    accumulate_node(child_node, child_row, fraction, by_parent, demand, products);
                } else {
                    // No stored row (freshly computed child not yet persisted
                    // in this pass): still roll its leaves up unscaled.
                    accumulate_subtree_raw(child_node, fraction, demand);
                }
            }
        } else if fraction > 0.0 {
            let scaled = (line.adjusted_quantity as f64 * fraction).ceil() as i64;
            if scaled > 0 {
                *demand.entry(line.type_id).or_insert(0) += scaled;
            }
        }
    }
}

fn accumulate_subtree_raw(
    node: &crate::industry::BlueprintNode,
    fraction: f64,
    demand: &mut HashMap<i64, i64>,
) {
    let mut children = node.children.iter();
    for line in &node.materials {
        if line.expanded {
            if let Some(child) = children.next() {
                accumulate_subtree_raw(child, fraction, demand);
            }
        } else if fraction > 0.0 {
            let scaled = (line.adjusted_quantity as f64 * fraction).ceil() as i64;
            if scaled > 0 {
                *demand.entry(line.type_id).or_insert(0) += scaled;
            }
        }
    }
}

fn write_materials(
    tx: &Transaction,
    plan_id: i64,
    demand: &HashMap<i64, i64>,
    warnings: &mut Vec<String>,
) -> CoreResult<()> {
    // Deleting a demanded-no-more material drops its manual acquisition; the
    // user gets a dismissible warning naming it.
    let mut stmt = tx.prepare_cached(
        "SELECT type_id, manually_acquired_qty FROM plan_materials WHERE plan_id = ?1",
    )?;
    let existing: Vec<(i64, i64)> = stmt
        .query_map(params![plan_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let demanded: HashSet<i64> = demand.keys().copied().collect();
    for (type_id, acquired) in &existing {
        if !demanded.contains(type_id) {
            if *acquired > 0 {
                warnings.push(format!(
                    "material {type_id} is no longer needed; removed acquisition of {acquired} units"
                ));
            }
            tx.execute(
                "DELETE FROM plan_materials WHERE plan_id = ?1 AND type_id = ?2",
                params![plan_id, type_id],
            )?;
        }
    }

    let mut upsert = tx.prepare_cached(
        "INSERT INTO plan_materials (plan_id, type_id, quantity)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(plan_id, type_id) DO UPDATE SET quantity = excluded.quantity",
    )?;
    for (type_id, quantity) in demand {
        upsert.execute(params![plan_id, type_id, quantity])?;
    }
    Ok(())
}

fn write_products(
    tx: &Transaction,
    plan_id: i64,
    products: &HashMap<i64, (i64, i64)>,
) -> CoreResult<()> {
    let mut stmt = tx.prepare_cached("SELECT type_id FROM plan_products WHERE plan_id = ?1")?;
    let existing: Vec<i64> = stmt
        .query_map(params![plan_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    for type_id in existing {
        if !products.contains_key(&type_id) {
            tx.execute(
                "DELETE FROM plan_products WHERE plan_id = ?1 AND type_id = ?2",
                params![plan_id, type_id],
            )?;
        }
    }

    let mut upsert = tx.prepare_cached(
        "INSERT INTO plan_products (plan_id, type_id, quantity, is_intermediate,
            intermediate_depth)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(plan_id, type_id) DO UPDATE SET
            quantity = excluded.quantity,
            is_intermediate = excluded.is_intermediate,
            intermediate_depth = excluded.intermediate_depth",
    )?;
    for (type_id, (quantity, depth)) in products {
        upsert.execute(params![plan_id, type_id, quantity, (*depth > 0) as i64, depth])?;
    }
    Ok(())
}

fn over_acquisition_warnings(tx: &Transaction, plan_id: i64) -> CoreResult<Vec<String>> {
    let mut stmt = tx.prepare_cached(
        "SELECT type_id, quantity, manually_acquired_qty FROM plan_materials
         WHERE plan_id = ?1 AND manually_acquired_qty > quantity",
    )?;
    let rows = stmt
        .query_map(params![plan_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(type_id, quantity, acquired)| {
            format!("material {type_id}: acquired {acquired} exceeds demand {quantity}")
        })
        .collect())
}
