//! Numbered schema migrations.
//!
//! Each database carries a `schema_migrations` ledger; pending migrations
//! apply in ascending id order, one transaction each. A failed migration
//! rolls back and halts startup.

use crate::error::{CoreError, CoreResult};
use crate::models::now_ms;
use rusqlite::{params, Connection, Transaction};

pub struct Migration {
    pub id: i64,
    pub description: &'static str,
    pub apply: fn(&Transaction) -> rusqlite::Result<()>,
}

pub fn run(conn: &mut Connection, migrations: &[Migration]) -> CoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            id INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let mut sorted: Vec<&Migration> = migrations.iter().collect();
    sorted.sort_by_key(|m| m.id);

    for migration in sorted {
        let applied: bool = conn.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE id = ?1",
            params![migration.id],
            |row| row.get::<_, i64>(0).map(|n| n > 0),
        )?;
        if applied {
            continue;
        }

        let tx = conn.transaction()?;
        (migration.apply)(&tx).map_err(|e| {
            CoreError::Database(format!(
                "migration {} ({}) failed: {e}",
                migration.id, migration.description
            ))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (id, description, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.id, migration.description, now_ms()],
        )?;
        tx.commit()?;
        tracing::info!(id = migration.id, desc = migration.description, "migration applied");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Character database (identities, inventory facts, plans)
// ---------------------------------------------------------------------------

fn character_schema_v1(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE characters (
            character_id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            corporation_id INTEGER,
            alliance_id INTEGER,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            scopes TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            added_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE skills (
            character_id INTEGER NOT NULL REFERENCES characters(character_id) ON DELETE CASCADE,
            skill_id INTEGER NOT NULL,
            active_level INTEGER NOT NULL,
            trained_level INTEGER NOT NULL,
            skillpoints INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            cache_expires_at INTEGER,
            PRIMARY KEY (character_id, skill_id)
        );

        CREATE TABLE skill_overrides (
            character_id INTEGER NOT NULL REFERENCES characters(character_id) ON DELETE CASCADE,
            skill_id INTEGER NOT NULL,
            override_level INTEGER NOT NULL,
            PRIMARY KEY (character_id, skill_id)
        );

        CREATE TABLE blueprints (
            item_id TEXT PRIMARY KEY,
            type_id INTEGER NOT NULL,
            character_id INTEGER NOT NULL REFERENCES characters(character_id) ON DELETE CASCADE,
            corporation_id INTEGER,
            location_id INTEGER,
            location_flag TEXT,
            quantity INTEGER NOT NULL,
            time_efficiency INTEGER NOT NULL,
            material_efficiency INTEGER NOT NULL,
            runs INTEGER NOT NULL,
            is_copy INTEGER NOT NULL,
            is_corporation INTEGER NOT NULL,
            source TEXT NOT NULL,
            manually_added INTEGER NOT NULL DEFAULT 0,
            last_updated INTEGER NOT NULL,
            cache_expires_at INTEGER
        );
        CREATE INDEX idx_blueprints_character_type ON blueprints(character_id, type_id);

        CREATE TABLE blueprint_overrides (
            item_id TEXT NOT NULL,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (item_id, field)
        );

        -- item_id was INTEGER at first; v2 rebuilds this table with TEXT.
        CREATE TABLE assets (
            item_id INTEGER PRIMARY KEY,
            character_id INTEGER NOT NULL REFERENCES characters(character_id) ON DELETE CASCADE,
            type_id INTEGER NOT NULL,
            location_id INTEGER NOT NULL,
            location_flag TEXT,
            quantity INTEGER NOT NULL,
            is_singleton INTEGER NOT NULL,
            is_blueprint_copy INTEGER,
            is_corporation INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            cache_expires_at INTEGER
        );
        CREATE INDEX idx_assets_character_type ON assets(character_id, type_id);

        CREATE TABLE industry_jobs (
            job_id INTEGER PRIMARY KEY,
            character_id INTEGER NOT NULL REFERENCES characters(character_id) ON DELETE CASCADE,
            installer_id INTEGER NOT NULL,
            facility_id INTEGER NOT NULL,
            activity_id INTEGER NOT NULL,
            blueprint_type_id INTEGER NOT NULL,
            runs INTEGER NOT NULL,
            status TEXT NOT NULL,
            start_date INTEGER,
            end_date INTEGER,
            completed_date INTEGER,
            last_updated INTEGER NOT NULL,
            cache_expires_at INTEGER
        );
        CREATE INDEX idx_jobs_character_bp ON industry_jobs(character_id, blueprint_type_id);

        CREATE TABLE wallet_transactions (
            transaction_id INTEGER PRIMARY KEY,
            character_id INTEGER NOT NULL REFERENCES characters(character_id) ON DELETE CASCADE,
            date INTEGER NOT NULL,
            type_id INTEGER NOT NULL,
            quantity INTEGER NOT NULL,
            unit_price REAL NOT NULL,
            location_id INTEGER NOT NULL,
            is_buy INTEGER NOT NULL,
            is_personal INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            cache_expires_at INTEGER
        );
        CREATE INDEX idx_transactions_character_type ON wallet_transactions(character_id, type_id);",
    )
}

/// Game item ids exceed 53-bit integers; rebuild assets with a TEXT key.
fn character_schema_v2_asset_item_id_text(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE assets_new (
            item_id TEXT PRIMARY KEY,
            character_id INTEGER NOT NULL REFERENCES characters(character_id) ON DELETE CASCADE,
            type_id INTEGER NOT NULL,
            location_id INTEGER NOT NULL,
            location_flag TEXT,
            quantity INTEGER NOT NULL,
            is_singleton INTEGER NOT NULL,
            is_blueprint_copy INTEGER,
            is_corporation INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            cache_expires_at INTEGER
        );
        INSERT INTO assets_new
            SELECT CAST(item_id AS TEXT), character_id, type_id, location_id, location_flag,
                   quantity, is_singleton, is_blueprint_copy, is_corporation,
                   last_updated, cache_expires_at
            FROM assets;
        DROP TABLE assets;
        ALTER TABLE assets_new RENAME TO assets;
        CREATE INDEX idx_assets_character_type ON assets(character_id, type_id);",
    )
}

fn character_schema_v3_plans(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE plans (
            plan_id INTEGER PRIMARY KEY AUTOINCREMENT,
            character_id INTEGER NOT NULL REFERENCES characters(character_id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            completed_at INTEGER
        );

        CREATE TABLE plan_blueprints (
            plan_blueprint_id INTEGER PRIMARY KEY AUTOINCREMENT,
            plan_id INTEGER NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
            blueprint_type_id INTEGER NOT NULL,
            runs INTEGER NOT NULL,
            lines INTEGER NOT NULL DEFAULT 1,
            me_level INTEGER NOT NULL DEFAULT 0,
            te_level INTEGER NOT NULL DEFAULT 0,
            facility_id INTEGER,
            facility_snapshot TEXT,
            use_intermediates TEXT NOT NULL DEFAULT 'raw_materials',
            is_intermediate INTEGER NOT NULL DEFAULT 0,
            parent_blueprint_id INTEGER REFERENCES plan_blueprints(plan_blueprint_id) ON DELETE CASCADE,
            intermediate_product_type_id INTEGER,
            built_runs INTEGER NOT NULL DEFAULT 0,
            added_at INTEGER NOT NULL
        );
        CREATE INDEX idx_plan_blueprints_plan ON plan_blueprints(plan_id);
        CREATE INDEX idx_plan_blueprints_parent ON plan_blueprints(parent_blueprint_id);

        CREATE TABLE plan_materials (
            plan_id INTEGER NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
            type_id INTEGER NOT NULL,
            quantity INTEGER NOT NULL,
            base_price REAL,
            custom_price REAL,
            price_frozen_at INTEGER,
            manually_acquired_qty INTEGER NOT NULL DEFAULT 0,
            acquisition_method TEXT,
            acquisition_note TEXT,
            PRIMARY KEY (plan_id, type_id)
        );

        CREATE TABLE plan_products (
            plan_id INTEGER NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
            type_id INTEGER NOT NULL,
            quantity INTEGER NOT NULL,
            base_price REAL,
            price_frozen_at INTEGER,
            is_intermediate INTEGER NOT NULL DEFAULT 0,
            intermediate_depth INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (plan_id, type_id)
        );

        CREATE TABLE plan_job_matches (
            match_id TEXT PRIMARY KEY,
            plan_id INTEGER NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
            plan_blueprint_id INTEGER NOT NULL,
            job_id INTEGER NOT NULL,
            confidence REAL NOT NULL,
            reason TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            confirmed_at INTEGER,
            confirmed_by_user INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_job_matches_plan ON plan_job_matches(plan_id);
        CREATE UNIQUE INDEX idx_job_matches_subject ON plan_job_matches(plan_blueprint_id, job_id);

        CREATE TABLE plan_transaction_matches (
            match_id TEXT PRIMARY KEY,
            plan_id INTEGER NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
            transaction_id INTEGER NOT NULL,
            type_id INTEGER NOT NULL,
            match_type TEXT NOT NULL,
            quantity INTEGER,
            confidence REAL NOT NULL,
            reason TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            confirmed_at INTEGER,
            confirmed_by_user INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_tx_matches_plan ON plan_transaction_matches(plan_id);
        CREATE UNIQUE INDEX idx_tx_matches_subject
            ON plan_transaction_matches(transaction_id, type_id, match_type);

        CREATE TABLE plan_asset_allocations (
            allocation_id TEXT PRIMARY KEY,
            plan_id INTEGER NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
            type_id INTEGER NOT NULL,
            quantity INTEGER NOT NULL,
            is_corporation INTEGER NOT NULL DEFAULT 0,
            allocated_at INTEGER NOT NULL
        );",
    )
}

pub fn character_migrations() -> Vec<Migration> {
    vec![
        Migration {
            id: 1,
            description: "identity and inventory schema",
            apply: character_schema_v1,
        },
        Migration {
            id: 2,
            description: "assets.item_id INTEGER -> TEXT",
            apply: character_schema_v2_asset_item_id_text,
        },
        Migration {
            id: 3,
            description: "manufacturing plan schema",
            apply: character_schema_v3_plans,
        },
    ]
}

// ---------------------------------------------------------------------------
// Market database
// ---------------------------------------------------------------------------

fn market_schema_v1(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE orders (
            order_id INTEGER NOT NULL,
            region_id INTEGER NOT NULL,
            type_id INTEGER NOT NULL,
            price REAL NOT NULL,
            volume_remain INTEGER NOT NULL,
            is_buy_order INTEGER NOT NULL,
            location_id INTEGER NOT NULL,
            fetched_at INTEGER NOT NULL,
            PRIMARY KEY (region_id, type_id, order_id)
        );
        CREATE INDEX idx_orders_region_type ON orders(region_id, type_id);

        CREATE TABLE history (
            region_id INTEGER NOT NULL,
            type_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            average REAL NOT NULL,
            highest REAL NOT NULL,
            lowest REAL NOT NULL,
            volume INTEGER NOT NULL,
            order_count INTEGER NOT NULL,
            PRIMARY KEY (region_id, type_id, date)
        );

        CREATE TABLE price_overrides (
            type_id INTEGER PRIMARY KEY,
            price REAL NOT NULL,
            notes TEXT,
            updated_at INTEGER NOT NULL
        );

        -- location_id 0 means a region-wide price.
        CREATE TABLE price_cache (
            type_id INTEGER NOT NULL,
            location_id INTEGER NOT NULL DEFAULT 0,
            region_id INTEGER NOT NULL,
            price_type TEXT NOT NULL,
            price REAL NOT NULL,
            method TEXT NOT NULL,
            confidence TEXT NOT NULL,
            calculated_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (type_id, region_id, price_type, location_id)
        );",
    )
}

fn market_schema_v2_indices(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE adjusted_prices (
            type_id INTEGER PRIMARY KEY,
            adjusted_price REAL NOT NULL,
            average_price REAL,
            fetched_at INTEGER NOT NULL
        );

        CREATE TABLE system_cost_indices (
            system_id INTEGER NOT NULL,
            activity TEXT NOT NULL,
            cost_index REAL NOT NULL,
            fetched_at INTEGER NOT NULL,
            PRIMARY KEY (system_id, activity)
        );",
    )
}

pub fn market_migrations() -> Vec<Migration> {
    vec![
        Migration {
            id: 1,
            description: "orders, history, overrides, price cache",
            apply: market_schema_v1,
        },
        Migration {
            id: 2,
            description: "adjusted prices and system cost indices",
            apply: market_schema_v2_indices,
        },
    ]
}
