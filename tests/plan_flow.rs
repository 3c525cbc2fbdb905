//! End-to-end plan lifecycle against real SQLite files.
//!
//! Fixture graph: blueprint 1000 builds one Frigate (type 900) per run from
//! 10x Tritanium (34) and 5x Component (50); the component is itself built by
//! blueprint 1001, three per run, from 20x Tritanium.

use quantumforge::industry::{CostEngine, NullCache};
use quantumforge::models::{
    now_ms, Character, IndustryJob, MatchStatus, UseIntermediates, WalletTransaction,
};
use quantumforge::reconcile::{
    propose_job_matches, propose_transaction_matches, JobMatcherConfig, TransactionMatcherConfig,
};
use quantumforge::sde::SdeReader;
use quantumforge::store::character::CharacterStore;
use quantumforge::store::migrations::character_migrations;
use quantumforge::store::plan::{BlueprintConfig, BlueprintPatch, MatchTable, PlanStore};
use quantumforge::store::Db;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    characters: CharacterStore,
    plans: PlanStore,
}

fn seed_sde(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE invTypes (typeID INTEGER PRIMARY KEY, groupID INTEGER, typeName TEXT);
         CREATE TABLE invGroups (groupID INTEGER PRIMARY KEY, categoryID INTEGER, groupName TEXT);
         CREATE TABLE invCategories (categoryID INTEGER PRIMARY KEY, categoryName TEXT);
         CREATE TABLE industryActivityMaterials (
            typeID INTEGER, activityID INTEGER, materialTypeID INTEGER, quantity INTEGER);
         CREATE TABLE industryActivityProducts (
            typeID INTEGER, activityID INTEGER, productTypeID INTEGER, quantity INTEGER);
         CREATE TABLE industryActivity (typeID INTEGER, activityID INTEGER, time INTEGER);
         CREATE TABLE industryActivityProbabilities (
            typeID INTEGER, activityID INTEGER, productTypeID INTEGER, probability REAL);
         CREATE TABLE dgmTypeAttributes (
            typeID INTEGER, attributeID INTEGER, valueInt INTEGER, valueFloat REAL);

         INSERT INTO invTypes VALUES (34, 18, 'Tritanium');
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

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let sde_path = dir.path().join("sde.sqlite");
    seed_sde(&sde_path);
    let sde = Arc::new(SdeReader::open(&sde_path).unwrap());
    let engine = Arc::new(CostEngine::new(sde, Arc::new(NullCache)));

    let db = Db::open(&dir.path().join("characters.db"), &character_migrations()).unwrap();
    let characters = CharacterStore::new(db.clone());
    characters
        .upsert_character(&Character {
            character_id: 1,
            name: "Test Pilot".to_string(),
            corporation_id: Some(98000001),
            alliance_id: None,
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: now_ms() + 1_200_000,
            scopes: vec![],
            is_default: true,
            added_at: now_ms(),
            updated_at: now_ms(),
        })
        .await
        .unwrap();

    let plans = PlanStore::new(db, characters.clone(), engine);
    Fixture {
        _dir: dir,
        characters,
        plans,
    }
}

fn config(runs: i64, mode: UseIntermediates) -> BlueprintConfig {
    BlueprintConfig {
        blueprint_type_id: 1000,
        runs,
        lines: 1,
        me_level: 0,
        te_level: 0,
        facility: None,
        use_intermediates: mode,
    }
}

#[tokio::test]
async fn add_blueprint_aggregates_materials_and_intermediates() {
    let f = fixture().await;
    let plan_id = f.plans.create_plan(1, None, None).await.unwrap();

    // Auto-naming stamps the date.
    let plan = f.plans.get_plan(plan_id).await.unwrap();
    assert!(plan.name.starts_with("Plan "));

    let (root_id, warnings) = f
        .plans
        .add_blueprint(plan_id, &config(1, UseIntermediates::RawMaterials))
        .await
        .unwrap();
    assert!(warnings.is_empty());

    // 10x34 from the parent plus ceil(5/3)=2 runs of 1001 at 20x34 each.
    let materials = f.plans.list_materials(plan_id).await.unwrap();
    assert_eq!(materials.len(), 1);
    assert_eq!(materials[0].type_id, 34);
    assert_eq!(materials[0].quantity, 50);

    let blueprints = f.plans.list_blueprints(plan_id).await.unwrap();
    assert_eq!(blueprints.len(), 2);
    let intermediate = blueprints.iter().find(|b| b.is_intermediate).unwrap();
    assert_eq!(intermediate.blueprint_type_id, 1001);
    assert_eq!(intermediate.parent_blueprint_id, Some(root_id));
    assert_eq!(intermediate.intermediate_product_type_id, Some(50));
    assert_eq!(intermediate.runs, 2);

    // Final product at depth 0, the component at depth 1.
    let products = f.plans.list_products(plan_id).await.unwrap();
    let final_product = products.iter().find(|p| p.type_id == 900).unwrap();
    assert_eq!(final_product.intermediate_depth, 0);
    assert_eq!(final_product.quantity, 1);
    let component = products.iter().find(|p| p.type_id == 50).unwrap();
    assert!(component.is_intermediate);
    assert_eq!(component.quantity, 6);
}

#[tokio::test]
async fn add_then_remove_restores_prior_state() {
    let f = fixture().await;
    let plan_id = f.plans.create_plan(1, Some("Roundtrip".into()), None).await.unwrap();

    let (first_id, _) = f
        .plans
        .add_blueprint(plan_id, &config(10, UseIntermediates::RawMaterials))
        .await
        .unwrap();
    let baseline = f.plans.list_materials(plan_id).await.unwrap();

    let (second_id, _) = f
        .plans
        .add_blueprint(plan_id, &config(3, UseIntermediates::Components))
        .await
        .unwrap();
    assert_ne!(first_id, second_id);
    assert_ne!(f.plans.list_materials(plan_id).await.unwrap(), baseline);

    f.plans.remove_blueprint(second_id).await.unwrap();
    let restored = f.plans.list_materials(plan_id).await.unwrap();
    assert_eq!(restored, baseline);

    f.plans.remove_blueprint(first_id).await.unwrap();
    assert!(f.plans.list_materials(plan_id).await.unwrap().is_empty());
    assert!(f.plans.list_products(plan_id).await.unwrap().is_empty());
    assert!(f.plans.list_blueprints(plan_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn removing_blueprint_deletes_excess_acquisition_with_warning() {
    let f = fixture().await;
    let plan_id = f.plans.create_plan(1, None, None).await.unwrap();
    let (root_id, _) = f
        .plans
        .add_blueprint(plan_id, &config(100, UseIntermediates::Components))
        .await
        .unwrap();

    // Demand is 1000x34; the user over-acquires to 1500.
    let materials = f.plans.list_materials(plan_id).await.unwrap();
    let tritanium = materials.iter().find(|m| m.type_id == 34).unwrap();
    assert_eq!(tritanium.quantity, 1000);
    f.plans
        .mark_material_acquired(plan_id, 34, 1500, Some("buy"), None, None)
        .await
        .unwrap();

    let warnings = f.plans.remove_blueprint(root_id).await.unwrap();
    assert!(
        warnings.iter().any(|w| w.contains("34") && w.contains("1500")),
        "expected a warning naming the deleted acquisition, got {warnings:?}"
    );
    assert!(f.plans.list_materials(plan_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn built_runs_clamp_and_scale_demand() {
    let f = fixture().await;
    let plan_id = f.plans.create_plan(1, None, None).await.unwrap();
    f.plans
        .add_blueprint(plan_id, &config(1, UseIntermediates::RawMaterials))
        .await
        .unwrap();

    let intermediate_id = f
        .plans
        .list_blueprints(plan_id)
        .await
        .unwrap()
        .into_iter()
        .find(|b| b.is_intermediate)
        .unwrap()
        .plan_blueprint_id;

    // Clamp above runs.
    f.plans.mark_intermediate_built(intermediate_id, 99).await.unwrap();
    let row = f.plans.get_blueprint(intermediate_id).await.unwrap();
    assert_eq!(row.built_runs, row.runs);
    // Fully built: only the parent's own 10x34 remains.
    let materials = f.plans.list_materials(plan_id).await.unwrap();
    assert_eq!(materials[0].quantity, 10);

    // Clamp below zero restores full demand.
    f.plans.mark_intermediate_built(intermediate_id, -5).await.unwrap();
    assert_eq!(
        f.plans.get_blueprint(intermediate_id).await.unwrap().built_runs,
        0
    );
    assert_eq!(f.plans.list_materials(plan_id).await.unwrap()[0].quantity, 50);

    // Half built halves the intermediate's leaf demand: 10 + 40/2.
    f.plans.mark_intermediate_built(intermediate_id, 1).await.unwrap();
    assert_eq!(f.plans.list_materials(plan_id).await.unwrap()[0].quantity, 30);
}

#[tokio::test]
async fn bulk_update_applies_all_edits_in_one_pass() {
    let f = fixture().await;
    let plan_id = f.plans.create_plan(1, None, None).await.unwrap();
    let (a, _) = f
        .plans
        .add_blueprint(plan_id, &config(1, UseIntermediates::Components))
        .await
        .unwrap();
    let (b, _) = f
        .plans
        .add_blueprint(plan_id, &config(1, UseIntermediates::Components))
        .await
        .unwrap();

    let patch = BlueprintPatch {
        runs: Some(10),
        ..Default::default()
    };
    f.plans
        .bulk_update_blueprints(plan_id, &[(a, patch.clone()), (b, patch)])
        .await
        .unwrap();

    let materials = f.plans.list_materials(plan_id).await.unwrap();
    let tritanium = materials.iter().find(|m| m.type_id == 34).unwrap();
    assert_eq!(tritanium.quantity, 200);

    // Updating a row from another plan is refused.
    let other_plan = f.plans.create_plan(1, None, None).await.unwrap();
    let err = f
        .plans
        .bulk_update_blueprints(
            other_plan,
            &[(a, BlueprintPatch::default())],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, quantumforge::CoreError::Constraint(_)));
}

#[tokio::test]
async fn job_match_lifecycle() {
    let f = fixture().await;
    let plan_id = f.plans.create_plan(1, None, None).await.unwrap();
    f.plans
        .add_blueprint(plan_id, &config(10, UseIntermediates::Components))
        .await
        .unwrap();

    f.characters
        .save_industry_jobs(
            1,
            &[IndustryJob {
                job_id: 500,
                character_id: 1,
                installer_id: 1,
                facility_id: 60003760,
                activity_id: 1,
                blueprint_type_id: 1000,
                runs: 10,
                status: "active".to_string(),
                start_date: Some(now_ms()),
                end_date: None,
                completed_date: None,
            }],
            None,
        )
        .await
        .unwrap();

    let proposed = propose_job_matches(
        &f.plans,
        &f.characters,
        plan_id,
        &JobMatcherConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(proposed, 1);

    let matches = f.plans.list_job_matches(plan_id).await.unwrap();
    assert_eq!(matches.len(), 1);
    let match_id = matches[0].match_id.clone();
    assert!(matches[0].confidence > 0.7);

    // Re-running the pass does not duplicate the proposal.
    let again = propose_job_matches(
        &f.plans,
        &f.characters,
        plan_id,
        &JobMatcherConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(again, 0);

    // pending -> confirmed -> (immutable) -> unlink -> pending, same id.
    f.plans.confirm_match(MatchTable::Jobs, &match_id).await.unwrap();
    let err = f.plans.confirm_match(MatchTable::Jobs, &match_id).await.unwrap_err();
    assert!(matches!(err, quantumforge::CoreError::Conflict(_)));

    f.plans.unlink_match(MatchTable::Jobs, &match_id).await.unwrap();
    let matches = f.plans.list_job_matches(plan_id).await.unwrap();
    assert_eq!(matches[0].match_id, match_id);
    assert_eq!(matches[0].status, MatchStatus::Pending);

    // Rejection is terminal.
    f.plans.reject_match(MatchTable::Jobs, &match_id).await.unwrap();
    let err = f.plans.confirm_match(MatchTable::Jobs, &match_id).await.unwrap_err();
    assert!(matches!(err, quantumforge::CoreError::Conflict(_)));
}

#[tokio::test]
async fn confirmed_purchases_reduce_still_needed() {
    let f = fixture().await;
    let plan_id = f.plans.create_plan(1, None, None).await.unwrap();
    f.plans
        .add_blueprint(plan_id, &config(10, UseIntermediates::Components))
        .await
        .unwrap();

    f.characters
        .save_wallet_transactions(
            1,
            &[WalletTransaction {
                transaction_id: 900,
                character_id: 1,
                date: now_ms(),
                type_id: 34,
                quantity: 60,
                unit_price: 4.5,
                location_id: 60003760,
                is_buy: true,
                is_personal: true,
            }],
            None,
        )
        .await
        .unwrap();

    let config = TransactionMatcherConfig {
        min_confidence: 0.3,
        preferred_location: Some(60003760),
    };
    let proposed =
        propose_transaction_matches(&f.plans, &f.characters, plan_id, &config).await.unwrap();
    assert!(proposed >= 1);

    let matches = f.plans.list_transaction_matches(plan_id).await.unwrap();
    let tritanium_match = matches.iter().find(|m| m.type_id == 34).unwrap();
    f.plans
        .confirm_match(MatchTable::Transactions, &tritanium_match.match_id)
        .await
        .unwrap();

    let materials = f.plans.get_materials(plan_id, false).await.unwrap();
    let tritanium = materials.iter().find(|m| m.material.type_id == 34).unwrap();
    assert_eq!(tritanium.material.quantity, 100);
    assert_eq!(tritanium.purchased_quantity, 60);
    assert_eq!(tritanium.still_needed, 40);
}

#[tokio::test]
async fn update_blueprint_recomputes_subtree() {
    let f = fixture().await;
    let plan_id = f.plans.create_plan(1, None, None).await.unwrap();
    let (root_id, _) = f
        .plans
        .add_blueprint(plan_id, &config(1, UseIntermediates::RawMaterials))
        .await
        .unwrap();

    // Switching to components collapses the intermediate row.
    f.plans
        .update_blueprint(
            root_id,
            &BlueprintPatch {
                use_intermediates: Some(UseIntermediates::Components),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
    let blueprints = f.plans.list_blueprints(plan_id).await.unwrap();
    assert_eq!(blueprints.len(), 1);
    let materials = f.plans.list_materials(plan_id).await.unwrap();
    let by_type: std::collections::HashMap<i64, i64> =
        materials.iter().map(|m| (m.type_id, m.quantity)).collect();
    assert_eq!(by_type[&34], 10);
    assert_eq!(by_type[&50], 5);

    // skip_recalc leaves the aggregates untouched.
    f.plans
        .update_blueprint(
            root_id,
            &BlueprintPatch {
                runs: Some(100),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap();
    assert_eq!(f.plans.list_materials(plan_id).await.unwrap().len(), 2);
    let by_type: std::collections::HashMap<i64, i64> = f
        .plans
        .list_materials(plan_id)
        .await
        .unwrap()
        .iter()
        .map(|m| (m.type_id, m.quantity))
        .collect();
    assert_eq!(by_type[&34], 10);
}
