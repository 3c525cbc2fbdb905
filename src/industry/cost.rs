//! Recursive manufacturing-graph evaluator.
//!
//! Given a blueprint, runs, efficiency levels, facility, and owner context,
//! rolls the build tree up into a raw-material bill plus a nested breakdown.
//! The math mirrors the game formulas bit for bit: per-line ME application,
//! the 1% structure bonus, rig factors gated by product group and security
//! band, and the `max(runs, ceil(...))` floor.

use crate::error::{CoreError, CoreResult};
use crate::industry::cache::CalcCache;
use crate::industry::facility::Facility;
use crate::models::UseIntermediates;
use crate::sde::{SdeReader, ACTIVITY_MANUFACTURING};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

pub const MAX_RECURSION_DEPTH: usize = 10;

/// A character's effective (ME, TE) per owned blueprint type, overrides
/// already applied. Missing entries fall back to ME 0.
pub type OwnedBlueprintLevels = HashMap<i64, (i64, i64)>;

#[derive(Debug, Clone)]
pub struct CostRequest {
    pub blueprint_type_id: i64,
    pub runs: i64,
    /// Parallel production lines; ME math is applied per line.
    pub lines: i64,
    pub me_level: i64,
    pub te_level: i64,
    pub character_id: Option<i64>,
    pub facility: Option<Facility>,
    pub use_intermediates: UseIntermediates,
    /// Recursion stops early when the deadline passes; the partial tree is
    /// returned with a warning rather than an error.
    pub deadline: Option<Instant>,
}

impl CostRequest {
    pub fn new(blueprint_type_id: i64, runs: i64) -> Self {
        Self {
            blueprint_type_id,
            runs,
            lines: 1,
            me_level: 0,
            te_level: 0,
            character_id: None,
            facility: None,
            use_intermediates: UseIntermediates::RawMaterials,
            deadline: None,
        }
    }

    fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.blueprint_type_id,
            self.runs,
            self.lines,
            self.me_level,
            self.facility.as_ref().map(|f| f.fingerprint()).unwrap_or_default(),
            self.character_id.unwrap_or(0),
            self.use_intermediates.as_str(),
        )
    }
}

/// One material row of a blueprint node.
#[derive(Debug, Clone, Serialize)]
pub struct MaterialLine {
    pub type_id: i64,
    /// Per-run quantity from the SDE.
    pub base_quantity: i64,
    /// After ME/structure/rig and the per-line floor, summed over lines.
    pub adjusted_quantity: i64,
    pub manufacturable: bool,
    /// Set when this line was expanded into a child node.
    pub expanded: bool,
}

/// One blueprint in the build tree. Children are the intermediates this node
/// expanded.
#[derive(Debug, Clone, Serialize)]
pub struct BlueprintNode {
    pub blueprint_type_id: i64,
    pub product_type_id: Option<i64>,
    pub product_per_run: i64,
    pub runs: i64,
    pub lines: i64,
    pub me_level: i64,
    pub te_level: i64,
    pub depth: usize,
    /// Base activity seconds per run scaled by TE; None when the SDE has no
    /// time row.
    pub seconds_per_run: Option<f64>,
    pub materials: Vec<MaterialLine>,
    pub children: Vec<BlueprintNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductOutput {
    pub type_id: i64,
    pub base_quantity: i64,
    pub quantity: i64,
}

/// Rolled-up evaluation result.
#[derive(Debug, Clone, Serialize)]
pub struct MaterialTree {
    /// Raw-material bill: leaves of the expanded tree, merged additively.
    pub materials: BTreeMap<i64, i64>,
    pub product: Option<ProductOutput>,
    pub root: BlueprintNode,
    pub warnings: Vec<String>,
}

pub struct CostEngine {
    sde: Arc<SdeReader>,
    cache: Arc<dyn CalcCache<MaterialTree>>,
}

impl CostEngine {
    pub fn new(sde: Arc<SdeReader>, cache: Arc<dyn CalcCache<MaterialTree>>) -> Self {
        Self { sde, cache }
    }

    pub fn sde(&self) -> &Arc<SdeReader> {
        &self.sde
    }

    /// Evaluate the full tree for a request. Results are memoized per
    /// request fingerprint; cached reads are clones, never shared.
    pub fn evaluate(
        &self,
        request: &CostRequest,
        owned: &OwnedBlueprintLevels,
    ) -> CoreResult<MaterialTree> {
        let key = request.cache_key();
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let product = self
            .sde
            .blueprint_product(request.blueprint_type_id, ACTIVITY_MANUFACTURING)?;
        let base_materials = self
            .sde
            .blueprint_materials(request.blueprint_type_id, ACTIVITY_MANUFACTURING)?;
        if product.is_none() && base_materials.is_empty() {
            return Err(CoreError::BlueprintNotFound(request.blueprint_type_id));
        }

        let mut materials = BTreeMap::new();
        let mut warnings = Vec::new();
        let root = self.evaluate_node(
            request.blueprint_type_id,
            request.runs,
            request.lines,
            request.me_level,
            request.te_level,
            request,
            owned,
            0,
            &mut materials,
            &mut warnings,
        )?;

        let tree = MaterialTree {
            materials,
            product: product.map(|(type_id, base_quantity)| ProductOutput {
                type_id,
                base_quantity,
                quantity: base_quantity * request.runs,
            }),
            root,
            warnings,
        };
        self.cache.put(key, tree.clone());
        Ok(tree)
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_node(
        &self,
        blueprint_type_id: i64,
        runs: i64,
        lines: i64,
        me_level: i64,
        te_level: i64,
        request: &CostRequest,
        owned: &OwnedBlueprintLevels,
        depth: usize,
        rollup: &mut BTreeMap<i64, i64>,
        warnings: &mut Vec<String>,
    ) -> CoreResult<BlueprintNode> {
        let lines = lines.max(1);
        let runs_per_line = (runs + lines - 1) / lines;
        let product = self
            .sde
            .blueprint_product(blueprint_type_id, ACTIVITY_MANUFACTURING)?;
        let product_group = match product {
            Some((product_type_id, _)) => self.sde.group_id(product_type_id)?,
            None => None,
        };

        let structure_factor = match &request.facility {
            Some(f) if f.structure_type_id.is_some() => 0.99,
            _ => 1.0,
        };
        let rig_factor = request
            .facility
            .as_ref()
            .map(|f| f.rig_material_factor(product_group))
            .unwrap_or(1.0);
        let me_factor = 1.0 - me_level as f64 / 100.0;

        let seconds_per_run = self
            .sde
            .activity_time(blueprint_type_id, ACTIVITY_MANUFACTURING)?
            .map(|base| base as f64 * (1.0 - te_level as f64 / 100.0));

        let mut node = BlueprintNode {
            blueprint_type_id,
            product_type_id: product.map(|(t, _)| t),
            product_per_run: product.map(|(_, q)| q).unwrap_or(0),
            runs,
            lines,
            me_level,
            te_level,
            depth,
            seconds_per_run,
            materials: Vec::new(),
            children: Vec::new(),
        };

        let deadline_passed = request
            .deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false);
        if deadline_passed {
            warnings.push(format!(
                "deadline reached at blueprint {blueprint_type_id}; subtree not expanded"
            ));
        }

        for (material_type_id, base_quantity) in
            self.sde.blueprint_materials(blueprint_type_id, ACTIVITY_MANUFACTURING)?
        {
            // Per line: ME, then structure, then rigs, then the floor. The
            // floor never drops below the line's run count.
            let after_me = runs_per_line as f64 * base_quantity as f64 * me_factor;
            let after_rigs = after_me * structure_factor * rig_factor;
            let adjusted_per_line = (after_rigs.ceil() as i64).max(runs_per_line);
            let adjusted = adjusted_per_line * lines;

            let sub_blueprint = self.sde.blueprint_for_product(material_type_id)?;
            let manufacturable = sub_blueprint.is_some();
            let may_recurse = request.use_intermediates.recurses() && !deadline_passed;

            let mut expanded = false;
            match sub_blueprint {
                Some(_) if may_recurse && depth + 1 > MAX_RECURSION_DEPTH => {
                    warnings.push(format!(
                        "recursion depth {MAX_RECURSION_DEPTH} reached; type {material_type_id} kept as raw material"
                    ));
                }
                Some(sub_bp) if may_recurse => {
                    let (_, per_run) = self
                        .sde
                        .blueprint_product(sub_bp, ACTIVITY_MANUFACTURING)?
                        .unwrap_or((material_type_id, 1));
                    let per_run = per_run.max(1);
                    // Demand rounds up to whole sub-blueprint runs.
                    let sub_runs = (adjusted + per_run - 1) / per_run;
                    let (sub_me, sub_te) = owned.get(&sub_bp).copied().unwrap_or((0, 0));
                    let child = self.evaluate_node(
                        sub_bp,
                        sub_runs,
                        1,
                        sub_me,
                        sub_te,
                        request,
                        owned,
                        depth + 1,
                        rollup,
                        warnings,
                    )?;
                    node.children.push(child);
                    expanded = true;
                }
                _ => {}
            }

            if !expanded {
                *rollup.entry(material_type_id).or_insert(0) += adjusted;
            }
            node.materials.push(MaterialLine {
                type_id: material_type_id,
                base_quantity,
                adjusted_quantity: adjusted,
                manufacturable,
                expanded,
            });
        }

        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::industry::cache::{LruCache, NullCache};
    use crate::industry::facility::{FacilityRig, SecurityBand};
    use crate::sde::test_support;
    use rusqlite::Connection;
    use tempfile::tempdir;

    /// Blueprint 1000 makes one unit of type 900 per run from 10x34 and 5x50;
    /// type 50 is itself made by blueprint 1001 (3 per run, from 20x34).
    fn seeded_sde(dir: &std::path::Path) -> Arc<SdeReader> {
        let path = dir.join("sde.sqlite");
        test_support::create_snapshot(&path);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "INSERT INTO invTypes VALUES (34, 18, 'Tritanium');
                 INSERT INTO invTypes VALUES (50, 280, 'Component');
                 INSERT INTO invTypes VALUES (900, 25, 'Frigate');
                 INSERT INTO industryActivityMaterials VALUES (1000, 1, 34, 10);
                 INSERT INTO industryActivityMaterials VALUES (1000, 1, 50, 5);
                 INSERT INTO industryActivityProducts VALUES (1000, 1, 900, 1);
                 INSERT INTO industryActivity VALUES (1000, 1, 600);
                 INSERT INTO industryActivityMaterials VALUES (1001, 1, 34, 20);
                 INSERT INTO industryActivityProducts VALUES (1001, 1, 50, 3);",
            )
            .unwrap();
        }
        Arc::new(SdeReader::open(&path).unwrap())
    }

    fn engine(sde: Arc<SdeReader>) -> CostEngine {
        CostEngine::new(sde, Arc::new(NullCache))
    }

    #[test]
    fn me_floor_per_scenario() {
        let dir = tempdir().unwrap();
        let sde = seeded_sde(dir.path());
        let engine = engine(sde);

        // ME 10 on 10 base: 1 * 10 * 0.9 = 9.
        let mut req = CostRequest::new(1000, 1);
        req.me_level = 10;
        req.use_intermediates = UseIntermediates::Components;
        let tree = engine.evaluate(&req, &HashMap::new()).unwrap();
        assert_eq!(tree.materials[&34], 9);

        // Hypothetical ME 100 zeroes the bill but the floor holds at runs.
        req.me_level = 100;
        let tree = engine.evaluate(&req, &HashMap::new()).unwrap();
        assert_eq!(tree.materials[&34], 1);
        assert_eq!(tree.materials[&50], 1);
    }

    #[test]
    fn adjusted_never_below_runs() {
        let dir = tempdir().unwrap();
        let sde = seeded_sde(dir.path());
        let engine = engine(sde);
        for runs in [1i64, 7, 100, 1_000_000] {
            let mut req = CostRequest::new(1000, runs);
            req.me_level = 10;
            req.use_intermediates = UseIntermediates::Components;
            let tree = engine.evaluate(&req, &HashMap::new()).unwrap();
            for qty in tree.materials.values() {
                assert!(*qty >= runs, "runs={runs} produced quantity {qty}");
            }
        }
    }

    #[test]
    fn per_line_floor_changes_non_divisible_runs() {
        let dir = tempdir().unwrap();
        let sde = seeded_sde(dir.path());
        let engine = engine(sde);

        // 10 runs over 3 lines -> ceil(10/3) = 4 runs per line, 3 lines.
        let mut req = CostRequest::new(1000, 10);
        req.lines = 3;
        req.use_intermediates = UseIntermediates::Components;
        let tree = engine.evaluate(&req, &HashMap::new()).unwrap();
        assert_eq!(tree.materials[&34], 4 * 10 * 3);

        // Divisible runs scale exactly.
        let mut req = CostRequest::new(1000, 10);
        req.lines = 2;
        req.use_intermediates = UseIntermediates::Components;
        let tree = engine.evaluate(&req, &HashMap::new()).unwrap();
        assert_eq!(tree.materials[&34], 100);
    }

    #[test]
    fn recursion_expands_intermediates_and_rounds_runs_up() {
        let dir = tempdir().unwrap();
        let sde = seeded_sde(dir.path());
        let engine = engine(sde);

        let req = CostRequest::new(1000, 1);
        let tree = engine.evaluate(&req, &HashMap::new()).unwrap();

        // 5 units of type 50 at 3 per run -> 2 sub-runs -> 40x34 plus the
        // parent's own 10x34. Type 50 is no longer a leaf.
        assert_eq!(tree.materials[&34], 50);
        assert!(!tree.materials.contains_key(&50));
        assert_eq!(tree.root.children.len(), 1);
        let child = &tree.root.children[0];
        assert_eq!(child.blueprint_type_id, 1001);
        assert_eq!(child.runs, 2);
        assert_eq!(child.depth, 1);
    }

    #[test]
    fn components_mode_stops_at_first_level() {
        let dir = tempdir().unwrap();
        let sde = seeded_sde(dir.path());
        let engine = engine(sde);

        let mut req = CostRequest::new(1000, 1);
        req.use_intermediates = UseIntermediates::Components;
        let tree = engine.evaluate(&req, &HashMap::new()).unwrap();
        assert_eq!(tree.materials[&50], 5);
        assert!(tree.root.children.is_empty());
    }

    #[test]
    fn owned_blueprint_me_applies_to_sub_runs() {
        let dir = tempdir().unwrap();
        let sde = seeded_sde(dir.path());
        let engine = engine(sde);

        let mut owned = HashMap::new();
        owned.insert(1001i64, (10i64, 20i64));
        let req = CostRequest::new(1000, 1);
        let tree = engine.evaluate(&req, &owned).unwrap();
        // Child runs 2 with ME 10: 2 * 20 * 0.9 = 36, plus parent's 10.
        assert_eq!(tree.materials[&34], 46);
        assert_eq!(tree.root.children[0].me_level, 10);
    }

    #[test]
    fn depth_clamps_at_limit_with_warning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sde.sqlite");
        test_support::create_snapshot(&path);
        {
            let conn = Connection::open(&path).unwrap();
            // A 12-deep chain: bp N makes product N from product N+1.
            for i in 0..12i64 {
                conn.execute(
                    "INSERT INTO industryActivityProducts VALUES (?1, 1, ?2, 1)",
                    rusqlite::params![2000 + i, 500 + i],
                )
                .unwrap();
                conn.execute(
                    "INSERT INTO industryActivityMaterials VALUES (?1, 1, ?2, 1)",
                    rusqlite::params![2000 + i, 500 + i + 1],
                )
                .unwrap();
            }
        }
        let engine = engine(Arc::new(SdeReader::open(&path).unwrap()));
        let tree = engine.evaluate(&CostRequest::new(2000, 1), &HashMap::new()).unwrap();
        assert!(tree.warnings.iter().any(|w| w.contains("recursion depth")));
        // The chain truncates at depth 10; material 511 stays raw.
        assert!(tree.materials.contains_key(&511));
    }

    #[test]
    fn unknown_blueprint_is_an_error() {
        let dir = tempdir().unwrap();
        let sde = seeded_sde(dir.path());
        let engine = engine(sde);
        let err = engine
            .evaluate(&CostRequest::new(424242, 1), &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::BlueprintNotFound(424242)));
    }

    #[test]
    fn structure_and_rig_factors_reduce_materials() {
        let dir = tempdir().unwrap();
        let sde = seeded_sde(dir.path());
        let engine = engine(sde);

        let facility = Facility {
            facility_id: 1,
            name: "Raitaru".to_string(),
            system_id: 30000142,
            security: 0.9,
            structure_type_id: Some(35825),
            structure_cost_bonus: 3.0,
            tax_rate: 0.0,
            rigs: vec![FacilityRig {
                type_id: 43867,
                name: "M-Set".to_string(),
                material_bonus: -2.0,
                cost_bonus: 0.0,
                applicable_groups: vec![25],
                applicable_bands: vec![SecurityBand::High],
            }],
        };
        let mut req = CostRequest::new(1000, 100);
        req.me_level = 10;
        req.facility = Some(facility);
        req.use_intermediates = UseIntermediates::Components;
        let tree = engine.evaluate(&req, &HashMap::new()).unwrap();
        // 100 * 10 * 0.9 * 0.99 * 0.98 = 873.18 -> 874.
        assert_eq!(tree.materials[&34], 874);
    }

    #[test]
    fn cached_result_is_a_deep_clone() {
        let dir = tempdir().unwrap();
        let sde = seeded_sde(dir.path());
        let engine = CostEngine::new(sde, Arc::new(LruCache::new(100)));

        let req = CostRequest::new(1000, 1);
        let mut first = engine.evaluate(&req, &HashMap::new()).unwrap();
        first.materials.insert(999, 1);
        let second = engine.evaluate(&req, &HashMap::new()).unwrap();
        assert!(!second.materials.contains_key(&999));
    }
}
