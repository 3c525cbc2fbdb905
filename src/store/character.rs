//! Character store: authenticated identities plus the inventory facts fetched
//! for them (skills, blueprints, assets, industry jobs, wallet transactions).
//!
//! Saves are idempotent: ESI payloads replace prior rows wholesale, keyed so
//! manual rows survive refreshes. Every row carries `last_updated` and a
//! nullable `cache_expires_at` from the server's `expires` header.

use crate::error::{CoreError, CoreResult};
use crate::industry::OwnedBlueprintLevels;
use crate::models::{
    now_ms, Asset, Character, IndustryJob, OwnedBlueprint, SkillRecord, WalletTransaction,
};
use crate::store::Db;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;

/// Freshness of one endpoint's data for one character.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointCacheState {
    pub endpoint: String,
    pub last_updated: Option<i64>,
    pub cache_expires_at: Option<i64>,
}

#[derive(Clone)]
pub struct CharacterStore {
    db: Db,
}

impl CharacterStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    // -- identities ---------------------------------------------------------

    pub async fn upsert_character(&self, character: &Character) -> CoreResult<()> {
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT INTO characters (character_id, name, corporation_id, alliance_id,
                access_token, refresh_token, expires_at, scopes, is_default, added_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(character_id) DO UPDATE SET
                name = excluded.name,
                corporation_id = excluded.corporation_id,
                alliance_id = excluded.alliance_id,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                updated_at = excluded.updated_at",
            params![
                character.character_id,
                character.name,
                character.corporation_id,
                character.alliance_id,
                character.access_token,
                character.refresh_token,
                character.expires_at,
                character.scopes.join(" "),
                character.is_default as i64,
                character.added_at,
                character.updated_at,
            ],
        )?;
        Ok(())
    }

    fn character_from_row(row: &Row<'_>) -> rusqlite::Result<Character> {
        let scopes: String = row.get(7)?;
        Ok(Character {
            character_id: row.get(0)?,
            name: row.get(1)?,
            corporation_id: row.get(2)?,
            alliance_id: row.get(3)?,
            access_token: row.get(4)?,
            refresh_token: row.get(5)?,
            expires_at: row.get(6)?,
            scopes: scopes.split_whitespace().map(str::to_string).collect(),
            is_default: row.get::<_, i64>(8)? != 0,
            added_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    const CHARACTER_COLS: &'static str = "character_id, name, corporation_id, alliance_id,
        access_token, refresh_token, expires_at, scopes, is_default, added_at, updated_at";

    pub async fn get_character(&self, character_id: i64) -> CoreResult<Character> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM characters WHERE character_id = ?1",
            Self::CHARACTER_COLS
        ))?;
        stmt.query_row(params![character_id], Self::character_from_row)
            .optional()?
            .ok_or(CoreError::MissingCharacter(character_id))
    }

    pub async fn list_characters(&self) -> CoreResult<Vec<Character>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM characters ORDER BY added_at",
            Self::CHARACTER_COLS
        ))?;
        let rows = stmt
            .query_map([], Self::character_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Removal cascades to every owned inventory and plan row.
    pub async fn remove_character(&self, character_id: i64) -> CoreResult<()> {
        let conn = self.db.conn().await;
        let removed = conn.execute(
            "DELETE FROM characters WHERE character_id = ?1",
            params![character_id],
        )?;
        if removed == 0 {
            return Err(CoreError::MissingCharacter(character_id));
        }
        tracing::info!(character_id, "character removed with owned rows");
        Ok(())
    }

    /// At most one character is default; setting a new one clears the old in
    /// the same transaction.
    pub async fn set_default(&self, character_id: i64) -> CoreResult<()> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT COUNT(*) FROM characters WHERE character_id = ?1",
            params![character_id],
            |r| r.get::<_, i64>(0).map(|n| n > 0),
        )?;
        if !exists {
            return Err(CoreError::MissingCharacter(character_id));
        }
        tx.execute("UPDATE characters SET is_default = 0 WHERE is_default = 1", [])?;
        tx.execute(
            "UPDATE characters SET is_default = 1 WHERE character_id = ?1",
            params![character_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn default_character(&self) -> CoreResult<Option<Character>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM characters WHERE is_default = 1 LIMIT 1",
            Self::CHARACTER_COLS
        ))?;
        Ok(stmt.query_row([], Self::character_from_row).optional()?)
    }

    pub async fn update_tokens(
        &self,
        character_id: i64,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> CoreResult<()> {
        let conn = self.db.conn().await;
        let updated = conn.execute(
            "UPDATE characters SET access_token = ?2, refresh_token = ?3,
                expires_at = ?4, updated_at = ?5
             WHERE character_id = ?1",
            params![character_id, access_token, refresh_token, expires_at, now_ms()],
        )?;
        if updated == 0 {
            return Err(CoreError::MissingCharacter(character_id));
        }
        Ok(())
    }

    // -- skills -------------------------------------------------------------

    pub async fn save_skills(
        &self,
        character_id: i64,
        skills: &[SkillRecord],
        cache_expires_at: Option<i64>,
    ) -> CoreResult<()> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM skills WHERE character_id = ?1", params![character_id])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO skills (character_id, skill_id, active_level, trained_level,
                    skillpoints, last_updated, cache_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let now = now_ms();
            for skill in skills {
                stmt.execute(params![
                    character_id,
                    skill.skill_id,
                    skill.active_level,
                    skill.trained_level,
                    skill.skillpoints,
                    now,
                    cache_expires_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn set_skill_override(
        &self,
        character_id: i64,
        skill_id: i64,
        level: Option<i64>,
    ) -> CoreResult<()> {
        let conn = self.db.conn().await;
        match level {
            Some(level) => {
                conn.execute(
                    "INSERT INTO skill_overrides (character_id, skill_id, override_level)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(character_id, skill_id) DO UPDATE SET
                        override_level = excluded.override_level",
                    params![character_id, skill_id, level.clamp(0, 5)],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM skill_overrides WHERE character_id = ?1 AND skill_id = ?2",
                    params![character_id, skill_id],
                )?;
            }
        }
        Ok(())
    }

    /// Override wins over the trained level; unknown skills are level 0.
    pub async fn effective_skill_level(
        &self,
        character_id: i64,
        skill_id: i64,
    ) -> CoreResult<i64> {
        let conn = self.db.conn().await;
        let override_level: Option<i64> = conn
            .query_row(
                "SELECT override_level FROM skill_overrides
                 WHERE character_id = ?1 AND skill_id = ?2",
                params![character_id, skill_id],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(level) = override_level {
            return Ok(level);
        }
        let active: Option<i64> = conn
            .query_row(
                "SELECT active_level FROM skills WHERE character_id = ?1 AND skill_id = ?2",
                params![character_id, skill_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(active.unwrap_or(0))
    }

    // -- blueprints ---------------------------------------------------------

    /// Replace ESI-sourced rows; manually added blueprints survive.
    pub async fn save_blueprints(
        &self,
        character_id: i64,
        blueprints: &[OwnedBlueprint],
        cache_expires_at: Option<i64>,
    ) -> CoreResult<()> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM blueprints WHERE character_id = ?1 AND manually_added = 0",
            params![character_id],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO blueprints (item_id, type_id, character_id,
                    corporation_id, location_id, location_flag, quantity, time_efficiency,
                    material_efficiency, runs, is_copy, is_corporation, source,
                    manually_added, last_updated, cache_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )?;
            let now = now_ms();
            for bp in blueprints {
                stmt.execute(params![
                    bp.item_id,
                    bp.type_id,
                    character_id,
                    bp.corporation_id,
                    bp.location_id,
                    bp.location_flag,
                    bp.quantity,
                    bp.time_efficiency,
                    bp.material_efficiency,
                    bp.runs,
                    bp.is_copy as i64,
                    bp.is_corporation as i64,
                    bp.source,
                    bp.manually_added as i64,
                    now,
                    cache_expires_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn add_manual_blueprint(&self, blueprint: &OwnedBlueprint) -> CoreResult<()> {
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT OR REPLACE INTO blueprints (item_id, type_id, character_id,
                corporation_id, location_id, location_flag, quantity, time_efficiency,
                material_efficiency, runs, is_copy, is_corporation, source,
                manually_added, last_updated, cache_expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'manual', 1, ?13, NULL)",
            params![
                blueprint.item_id,
                blueprint.type_id,
                blueprint.character_id,
                blueprint.corporation_id,
                blueprint.location_id,
                blueprint.location_flag,
                blueprint.quantity,
                blueprint.time_efficiency,
                blueprint.material_efficiency,
                blueprint.runs,
                blueprint.is_copy as i64,
                blueprint.is_corporation as i64,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    /// Per-blueprint per-field string override ("me", "te", ...). `None`
    /// clears the field's override.
    pub async fn set_blueprint_override(
        &self,
        item_id: &str,
        field: &str,
        value: Option<&str>,
    ) -> CoreResult<()> {
        let conn = self.db.conn().await;
        match value {
            Some(value) => {
                conn.execute(
                    "INSERT INTO blueprint_overrides (item_id, field, value)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(item_id, field) DO UPDATE SET value = excluded.value",
                    params![item_id, field, value],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM blueprint_overrides WHERE item_id = ?1 AND field = ?2",
                    params![item_id, field],
                )?;
            }
        }
        Ok(())
    }

    pub async fn list_blueprints(&self, character_id: i64) -> CoreResult<Vec<OwnedBlueprint>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT item_id, type_id, character_id, corporation_id, location_id,
                location_flag, quantity, time_efficiency, material_efficiency, runs,
                is_copy, is_corporation, source, manually_added
             FROM blueprints WHERE character_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![character_id], |row| {
                Ok(OwnedBlueprint {
                    item_id: row.get(0)?,
                    type_id: row.get(1)?,
                    character_id: row.get(2)?,
                    corporation_id: row.get(3)?,
                    location_id: row.get(4)?,
                    location_flag: row.get(5)?,
                    quantity: row.get(6)?,
                    time_efficiency: row.get(7)?,
                    material_efficiency: row.get(8)?,
                    runs: row.get(9)?,
                    is_copy: row.get::<_, i64>(10)? != 0,
                    is_corporation: row.get::<_, i64>(11)? != 0,
                    source: row.get(12)?,
                    manually_added: row.get::<_, i64>(13)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Effective (ME, TE) per owned blueprint type, overrides applied, best
    /// ME winning when several copies exist. This is the map the cost engine
    /// recurses with.
    pub async fn owned_blueprint_levels(
        &self,
        character_id: i64,
    ) -> CoreResult<OwnedBlueprintLevels> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT b.type_id, b.material_efficiency, b.time_efficiency,
                    me_o.value, te_o.value
             FROM blueprints b
             LEFT JOIN blueprint_overrides me_o
                ON me_o.item_id = b.item_id AND me_o.field = 'me'
             LEFT JOIN blueprint_overrides te_o
                ON te_o.item_id = b.item_id AND te_o.field = 'te'
             WHERE b.character_id = ?1",
        )?;
        let mut levels: OwnedBlueprintLevels = HashMap::new();
        let rows = stmt.query_map(params![character_id], |row| {
            let type_id: i64 = row.get(0)?;
            let me: i64 = row.get(1)?;
            let te: i64 = row.get(2)?;
            let me_override: Option<String> = row.get(3)?;
            let te_override: Option<String> = row.get(4)?;
            Ok((type_id, me, te, me_override, te_override))
        })?;
        for row in rows {
            let (type_id, me, te, me_override, te_override) = row?;
            let me = me_override.and_then(|v| v.parse().ok()).unwrap_or(me);
            let te = te_override.and_then(|v| v.parse().ok()).unwrap_or(te);
            levels
                .entry(type_id)
                .and_modify(|(best_me, best_te)| {
                    if me > *best_me {
                        *best_me = me;
                        *best_te = te;
                    }
                })
                .or_insert((me, te));
        }
        Ok(levels)
    }

    // -- assets -------------------------------------------------------------

    /// Delete-then-insert per (character, corporation flag): re-saving an
    /// identical payload yields identical rows.
    pub async fn save_assets(
        &self,
        character_id: i64,
        is_corporation: bool,
        assets: &[Asset],
        cache_expires_at: Option<i64>,
    ) -> CoreResult<()> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM assets WHERE character_id = ?1 AND is_corporation = ?2",
            params![character_id, is_corporation as i64],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO assets (item_id, character_id, type_id, location_id,
                    location_flag, quantity, is_singleton, is_blueprint_copy, is_corporation,
                    last_updated, cache_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            let now = now_ms();
            for asset in assets {
                stmt.execute(params![
                    asset.item_id,
                    character_id,
                    asset.type_id,
                    asset.location_id,
                    asset.location_flag,
                    asset.quantity,
                    asset.is_singleton as i64,
                    asset.is_blueprint_copy.map(|b| b as i64),
                    is_corporation as i64,
                    now,
                    cache_expires_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Per-character totals of a type across hangars, for the "available
    /// assets" column next to each material.
    pub async fn asset_quantities(
        &self,
        type_id: i64,
    ) -> CoreResult<Vec<(i64, bool, i64)>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT character_id, is_corporation, SUM(quantity) FROM assets
             WHERE type_id = ?1 GROUP BY character_id, is_corporation",
        )?;
        let rows = stmt
            .query_map(params![type_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)? != 0,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- industry jobs ------------------------------------------------------

    pub async fn save_industry_jobs(
        &self,
        character_id: i64,
        jobs: &[IndustryJob],
        cache_expires_at: Option<i64>,
    ) -> CoreResult<()> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO industry_jobs (job_id, character_id, installer_id, facility_id,
                    activity_id, blueprint_type_id, runs, status, start_date, end_date,
                    completed_date, last_updated, cache_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(job_id) DO UPDATE SET
                    status = excluded.status,
                    end_date = excluded.end_date,
                    completed_date = excluded.completed_date,
                    last_updated = excluded.last_updated,
                    cache_expires_at = excluded.cache_expires_at",
            )?;
            let now = now_ms();
            for job in jobs {
                stmt.execute(params![
                    job.job_id,
                    character_id,
                    job.installer_id,
                    job.facility_id,
                    job.activity_id,
                    job.blueprint_type_id,
                    job.runs,
                    job.status,
                    job.start_date,
                    job.end_date,
                    job.completed_date,
                    now,
                    cache_expires_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn list_industry_jobs(&self, character_id: i64) -> CoreResult<Vec<IndustryJob>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT job_id, character_id, installer_id, facility_id, activity_id,
                blueprint_type_id, runs, status, start_date, end_date, completed_date
             FROM industry_jobs WHERE character_id = ?1 ORDER BY start_date DESC",
        )?;
        let rows = stmt
            .query_map(params![character_id], |row| {
                Ok(IndustryJob {
                    job_id: row.get(0)?,
                    character_id: row.get(1)?,
                    installer_id: row.get(2)?,
                    facility_id: row.get(3)?,
                    activity_id: row.get(4)?,
                    blueprint_type_id: row.get(5)?,
                    runs: row.get(6)?,
                    status: row.get(7)?,
                    start_date: row.get(8)?,
                    end_date: row.get(9)?,
                    completed_date: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- wallet transactions ------------------------------------------------

    /// Transactions are immutable facts; duplicates are ignored.
    pub async fn save_wallet_transactions(
        &self,
        character_id: i64,
        transactions: &[WalletTransaction],
        cache_expires_at: Option<i64>,
    ) -> CoreResult<()> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO wallet_transactions (transaction_id, character_id,
                    date, type_id, quantity, unit_price, location_id, is_buy, is_personal,
                    last_updated, cache_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            let now = now_ms();
            for t in transactions {
                stmt.execute(params![
                    t.transaction_id,
                    character_id,
                    t.date,
                    t.type_id,
                    t.quantity,
                    t.unit_price,
                    t.location_id,
                    t.is_buy as i64,
                    t.is_personal as i64,
                    now,
                    cache_expires_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn list_wallet_transactions(
        &self,
        character_id: i64,
    ) -> CoreResult<Vec<WalletTransaction>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT transaction_id, character_id, date, type_id, quantity, unit_price,
                location_id, is_buy, is_personal
             FROM wallet_transactions WHERE character_id = ?1 ORDER BY date DESC",
        )?;
        let rows = stmt
            .query_map(params![character_id], |row| {
                Ok(WalletTransaction {
                    transaction_id: row.get(0)?,
                    character_id: row.get(1)?,
                    date: row.get(2)?,
                    type_id: row.get(3)?,
                    quantity: row.get(4)?,
                    unit_price: row.get(5)?,
                    location_id: row.get(6)?,
                    is_buy: row.get::<_, i64>(7)? != 0,
                    is_personal: row.get::<_, i64>(8)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- freshness ----------------------------------------------------------

    /// Per-endpoint freshness for the UI's cache indicators.
    pub async fn cache_state(&self, character_id: i64) -> CoreResult<Vec<EndpointCacheState>> {
        let conn = self.db.conn().await;
        let mut out = Vec::new();
        for (endpoint, table) in [
            ("skills", "skills"),
            ("blueprints", "blueprints"),
            ("assets", "assets"),
            ("industry_jobs", "industry_jobs"),
            ("wallet_transactions", "wallet_transactions"),
        ] {
            let row: (Option<i64>, Option<i64>) = conn.query_row(
                &format!(
                    "SELECT MAX(last_updated), MAX(cache_expires_at) FROM {table}
                     WHERE character_id = ?1"
                ),
                params![character_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            out.push(EndpointCacheState {
                endpoint: endpoint.to_string(),
                last_updated: row.0,
                cache_expires_at: row.1,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::migrations::character_migrations;

    fn store() -> CharacterStore {
        CharacterStore::new(Db::open_in_memory(&character_migrations()).unwrap())
    }

    fn character(id: i64) -> Character {
        Character {
            character_id: id,
            name: format!("Pilot {id}"),
            corporation_id: Some(98000001),
            alliance_id: None,
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: now_ms() + 1200_000,
            scopes: vec!["esi-skills.read_skills.v1".to_string()],
            is_default: false,
            added_at: now_ms(),
            updated_at: now_ms(),
        }
    }

    #[tokio::test]
    async fn single_default_invariant() {
        let store = store();
        store.upsert_character(&character(1)).await.unwrap();
        store.upsert_character(&character(2)).await.unwrap();

        store.set_default(1).await.unwrap();
        store.set_default(2).await.unwrap();

        let defaults: Vec<i64> = store
            .list_characters()
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.is_default)
            .map(|c| c.character_id)
            .collect();
        assert_eq!(defaults, vec![2]);

        let err = store.set_default(99).await.unwrap_err();
        assert!(matches!(err, CoreError::MissingCharacter(99)));
    }

    #[tokio::test]
    async fn asset_resave_is_idempotent() {
        let store = store();
        store.upsert_character(&character(1)).await.unwrap();

        let assets = vec![Asset {
            item_id: "9007199254740993".to_string(),
            character_id: 1,
            type_id: 34,
            location_id: 60003760,
            location_flag: Some("Hangar".to_string()),
            quantity: 5000,
            is_singleton: false,
            is_blueprint_copy: None,
            is_corporation: false,
        }];
        store.save_assets(1, false, &assets, None).await.unwrap();
        store.save_assets(1, false, &assets, None).await.unwrap();

        let totals = store.asset_quantities(34).await.unwrap();
        assert_eq!(totals, vec![(1, false, 5000)]);
    }

    #[tokio::test]
    async fn manual_blueprints_survive_esi_refresh() {
        let store = store();
        store.upsert_character(&character(1)).await.unwrap();

        let manual = OwnedBlueprint {
            item_id: "manual-1".to_string(),
            type_id: 1000,
            character_id: 1,
            corporation_id: None,
            location_id: None,
            location_flag: None,
            quantity: 1,
            time_efficiency: 20,
            material_efficiency: 10,
            runs: -1,
            is_copy: false,
            is_corporation: false,
            source: "manual".to_string(),
            manually_added: true,
        };
        store.add_manual_blueprint(&manual).await.unwrap();
        store.save_blueprints(1, &[], None).await.unwrap();

        let bps = store.list_blueprints(1).await.unwrap();
        assert_eq!(bps.len(), 1);
        assert!(bps[0].manually_added);
    }

    #[tokio::test]
    async fn blueprint_override_wins_for_levels() {
        let store = store();
        store.upsert_character(&character(1)).await.unwrap();

        let bp = OwnedBlueprint {
            item_id: "bp-1".to_string(),
            type_id: 1000,
            character_id: 1,
            corporation_id: None,
            location_id: None,
            location_flag: None,
            quantity: 1,
            time_efficiency: 0,
            material_efficiency: 4,
            runs: -1,
            is_copy: false,
            is_corporation: false,
            source: "esi".to_string(),
            manually_added: false,
        };
        store.save_blueprints(1, &[bp], None).await.unwrap();
        store.set_blueprint_override("bp-1", "me", Some("10")).await.unwrap();

        let levels = store.owned_blueprint_levels(1).await.unwrap();
        assert_eq!(levels[&1000], (10, 0));

        store.set_blueprint_override("bp-1", "me", None).await.unwrap();
        let levels = store.owned_blueprint_levels(1).await.unwrap();
        assert_eq!(levels[&1000], (4, 0));
    }

    #[tokio::test]
    async fn skill_override_preferred() {
        let store = store();
        store.upsert_character(&character(1)).await.unwrap();
        store
            .save_skills(
                1,
                &[SkillRecord {
                    character_id: 1,
                    skill_id: 16622, // Accounting
                    active_level: 3,
                    trained_level: 3,
                    skillpoints: 40_000,
                }],
                None,
            )
            .await
            .unwrap();

        assert_eq!(store.effective_skill_level(1, 16622).await.unwrap(), 3);
        store.set_skill_override(1, 16622, Some(5)).await.unwrap();
        assert_eq!(store.effective_skill_level(1, 16622).await.unwrap(), 5);
        assert_eq!(store.effective_skill_level(1, 3446).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_character_cascades() {
        let store = store();
        store.upsert_character(&character(1)).await.unwrap();
        store
            .save_wallet_transactions(
                1,
                &[WalletTransaction {
                    transaction_id: 77,
                    character_id: 1,
                    date: now_ms(),
                    type_id: 34,
                    quantity: 100,
                    unit_price: 4.5,
                    location_id: 60003760,
                    is_buy: true,
                    is_personal: true,
                }],
                None,
            )
            .await
            .unwrap();

        store.remove_character(1).await.unwrap();
        let conn = store.db.conn().await;
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM wallet_transactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
