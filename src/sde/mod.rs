//! Read-only queries against the static game-data snapshot (SDE).
//!
//! The snapshot is a SQLite file the engine never writes to. Every cost
//! calculation starts here; callers must surface `MissingSde` before running
//! any math.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Dogma attribute carrying the invention/structure cost-bonus value.
pub const ATTR_COST_BONUS: i64 = 2783;

/// Manufacturing activity id in the industry tables.
pub const ACTIVITY_MANUFACTURING: i64 = 1;
/// Invention activity id.
pub const ACTIVITY_INVENTION: i64 = 8;

/// Decryptor group in the type catalog.
const GROUP_DECRYPTOR: i64 = 1304;

/// File names the snapshot may carry, current first.
const SNAPSHOT_NAMES: &[&str] = &["sde.sqlite", "eve_sde.sqlite"];

#[derive(Debug, Clone, Serialize)]
pub struct DecryptorInfo {
    pub type_id: i64,
    pub name: String,
    pub probability_multiplier: f64,
    pub me_modifier: i64,
    pub te_modifier: i64,
    pub runs_modifier: i64,
}

/// Read-only SDE capability. Cheap to share behind an `Arc`; the connection
/// is serialized with a mutex and the hot type-name lookups are cached.
pub struct SdeReader {
    conn: Mutex<Connection>,
    type_names: RwLock<HashMap<i64, String>>,
}

impl SdeReader {
    /// Resolve the snapshot inside `dir`, trying the current file name first
    /// and falling back to the historical one.
    pub fn resolve(dir: &Path) -> CoreResult<PathBuf> {
        for name in SNAPSHOT_NAMES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(CoreError::MissingSde(dir.display().to_string()))
    }

    pub fn open(path: &Path) -> CoreResult<Self> {
        if !path.is_file() {
            return Err(CoreError::MissingSde(path.display().to_string()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| CoreError::MissingSde(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "SDE snapshot opened");
        Ok(Self {
            conn: Mutex::new(conn),
            type_names: RwLock::new(HashMap::new()),
        })
    }

    /// Materials consumed per run of `bp_type_id` for an activity, largest
    /// quantities first.
    pub fn blueprint_materials(
        &self,
        bp_type_id: i64,
        activity_id: i64,
    ) -> CoreResult<Vec<(i64, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT materialTypeID, quantity FROM industryActivityMaterials
             WHERE typeID = ?1 AND activityID = ?2
             ORDER BY quantity DESC",
        )?;
        let rows = stmt
            .query_map(params![bp_type_id, activity_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Product of one manufacturing run, or None for blueprints without one.
    pub fn blueprint_product(
        &self,
        bp_type_id: i64,
        activity_id: i64,
    ) -> CoreResult<Option<(i64, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT productTypeID, quantity FROM industryActivityProducts
             WHERE typeID = ?1 AND activityID = ?2
             LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![bp_type_id, activity_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;
        Ok(row)
    }

    /// The blueprint that manufactures `product_type_id`, if any. This is the
    /// test for "is this material itself manufacturable".
    pub fn blueprint_for_product(&self, product_type_id: i64) -> CoreResult<Option<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT typeID FROM industryActivityProducts
             WHERE productTypeID = ?1 AND activityID = ?2
             LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![product_type_id, ACTIVITY_MANUFACTURING], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        Ok(row)
    }

    pub fn type_name(&self, type_id: i64) -> CoreResult<Option<String>> {
        if let Some(name) = self.type_names.read().get(&type_id) {
            return Ok(Some(name.clone()));
        }
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT typeName FROM invTypes WHERE typeID = ?1")?;
        let name = stmt
            .query_row(params![type_id], |row| row.get::<_, String>(0))
            .optional()?;
        if let Some(ref n) = name {
            self.type_names.write().insert(type_id, n.clone());
        }
        Ok(name)
    }

    pub fn group_id(&self, type_id: i64) -> CoreResult<Option<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT groupID FROM invTypes WHERE typeID = ?1")?;
        Ok(stmt
            .query_row(params![type_id], |row| row.get::<_, i64>(0))
            .optional()?)
    }

    /// Category name for a type, joined through its group.
    pub fn category(&self, type_id: i64) -> CoreResult<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT c.categoryName
             FROM invTypes t
             JOIN invGroups g ON g.groupID = t.groupID
             JOIN invCategories c ON c.categoryID = g.categoryID
             WHERE t.typeID = ?1",
        )?;
        Ok(stmt
            .query_row(params![type_id], |row| row.get::<_, String>(0))
            .optional()?)
    }

    /// Search the type catalog by name fragment, for the UI.
    pub fn search_types(&self, fragment: &str, limit: i64) -> CoreResult<Vec<(i64, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT typeID, typeName FROM invTypes
             WHERE typeName LIKE '%' || ?1 || '%'
             ORDER BY typeName LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![fragment, limit], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Dogma attributes of a rig type.
    pub fn rig_effects(&self, rig_type_id: i64) -> CoreResult<Vec<(i64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT attributeID, COALESCE(valueFloat, valueInt, 0)
             FROM dgmTypeAttributes WHERE typeID = ?1",
        )?;
        let rows = stmt
            .query_map(params![rig_type_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Absolute job-cost reduction (percent) granted by a structure type.
    pub fn structure_cost_bonus(&self, structure_type_id: i64) -> CoreResult<f64> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT COALESCE(valueFloat, valueInt, 0) FROM dgmTypeAttributes
             WHERE typeID = ?1 AND attributeID = ?2",
        )?;
        let bonus = stmt
            .query_row(params![structure_type_id, ATTR_COST_BONUS], |row| {
                row.get::<_, f64>(0)
            })
            .optional()?;
        Ok(bonus.unwrap_or(0.0))
    }

    /// Base duration (seconds) of an activity on a blueprint.
    pub fn activity_time(&self, bp_type_id: i64, activity_id: i64) -> CoreResult<Option<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT time FROM industryActivity WHERE typeID = ?1 AND activityID = ?2",
        )?;
        Ok(stmt
            .query_row(params![bp_type_id, activity_id], |row| row.get::<_, i64>(0))
            .optional()?)
    }

    /// Whether the blueprint supports invention at all.
    pub fn invention_activity(&self, bp_type_id: i64) -> CoreResult<bool> {
        Ok(self.activity_time(bp_type_id, ACTIVITY_INVENTION)?.is_some())
    }

    /// T2 blueprints inventable from this one, with per-run output quantity.
    pub fn invention_products(&self, bp_type_id: i64) -> CoreResult<Vec<(i64, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT productTypeID, quantity FROM industryActivityProducts
             WHERE typeID = ?1 AND activityID = ?2",
        )?;
        let rows = stmt
            .query_map(params![bp_type_id, ACTIVITY_INVENTION], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Base invention probability for a (blueprint, product) pair.
    pub fn probability_for(
        &self,
        bp_type_id: i64,
        product_type_id: i64,
    ) -> CoreResult<Option<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT probability FROM industryActivityProbabilities
             WHERE typeID = ?1 AND activityID = ?2 AND productTypeID = ?3",
        )?;
        Ok(stmt
            .query_row(
                params![bp_type_id, ACTIVITY_INVENTION, product_type_id],
                |row| row.get::<_, f64>(0),
            )
            .optional()?)
    }

    /// All decryptors with their invention modifiers.
    pub fn decryptors(&self) -> CoreResult<Vec<DecryptorInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT typeID, typeName FROM invTypes WHERE groupID = ?1 ORDER BY typeName",
        )?;
        let base: Vec<(i64, String)> = stmt
            .query_map(params![GROUP_DECRYPTOR], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut attr_stmt = conn.prepare_cached(
            "SELECT attributeID, COALESCE(valueFloat, valueInt, 0)
             FROM dgmTypeAttributes WHERE typeID = ?1",
        )?;
        let mut out = Vec::with_capacity(base.len());
        for (type_id, name) in base {
            let attrs: HashMap<i64, f64> = attr_stmt
                .query_map(params![type_id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
                })?
                .collect::<Result<HashMap<_, _>, _>>()?;
            out.push(DecryptorInfo {
                type_id,
                name,
                // 1112/1113/1114/1124: probability, ME, TE, runs modifiers.
                probability_multiplier: attrs.get(&1112).copied().unwrap_or(1.0),
                me_modifier: attrs.get(&1113).copied().unwrap_or(0.0) as i64,
                te_modifier: attrs.get(&1114).copied().unwrap_or(0.0) as i64,
                runs_modifier: attrs.get(&1124).copied().unwrap_or(0.0) as i64,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a minimal in-file snapshot for tests. The schema mirrors the
    /// subset of the real export the reader touches.
    pub fn create_snapshot(path: &Path) {
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
                typeID INTEGER, attributeID INTEGER, valueInt INTEGER, valueFloat REAL);",
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_snapshot_is_a_typed_error() {
        let dir = tempdir().unwrap();
        let err = SdeReader::resolve(dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::MissingSde(_)));
    }

    #[test]
    fn resolves_current_name_before_historical() {
        let dir = tempdir().unwrap();
        test_support::create_snapshot(&dir.path().join("eve_sde.sqlite"));
        assert!(SdeReader::resolve(dir.path())
            .unwrap()
            .ends_with("eve_sde.sqlite"));
        test_support::create_snapshot(&dir.path().join("sde.sqlite"));
        assert!(SdeReader::resolve(dir.path()).unwrap().ends_with("sde.sqlite"));
    }

    #[test]
    fn materials_ordered_by_quantity_desc() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sde.sqlite");
        test_support::create_snapshot(&path);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "INSERT INTO industryActivityMaterials VALUES (100, 1, 34, 50);
                 INSERT INTO industryActivityMaterials VALUES (100, 1, 35, 2000);
                 INSERT INTO industryActivityMaterials VALUES (100, 1, 36, 7);",
            )
            .unwrap();
        }
        let sde = SdeReader::open(&path).unwrap();
        let mats = sde.blueprint_materials(100, ACTIVITY_MANUFACTURING).unwrap();
        assert_eq!(mats, vec![(35, 2000), (34, 50), (36, 7)]);
    }

    #[test]
    fn type_name_is_cached() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sde.sqlite");
        test_support::create_snapshot(&path);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("INSERT INTO invTypes VALUES (34, 18, 'Tritanium')", [])
                .unwrap();
        }
        let sde = SdeReader::open(&path).unwrap();
        assert_eq!(sde.type_name(34).unwrap().as_deref(), Some("Tritanium"));
        assert!(sde.type_names.read().contains_key(&34));
        assert_eq!(sde.type_name(99).unwrap(), None);
    }
}
