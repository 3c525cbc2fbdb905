//! Application configuration.
//!
//! One JSON document (`quantum_config.json`) in the user config directory.
//! Tokens never live here; they stay in the character database. The directory
//! is created on demand, and a one-time migration sweeps pre-existing sibling
//! files (old flat layout) into it, flagged by `.migration-complete`.

use crate::industry::Facility;
use crate::pricing::PriceMethod;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "quantum_config.json";
const MIGRATION_FLAG: &str = ".migration-complete";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub character_db: String,
    pub market_db: String,
    /// Directory holding the SDE snapshot.
    pub sde_dir: String,
    pub user_agent: String,
    pub listen_port: u16,
    pub oauth_client_id: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            character_db: "characters.db".to_string(),
            market_db: "market.db".to_string(),
            sde_dir: ".".to_string(),
            user_agent: "QuantumForge/0.1 (industry planner)".to_string(),
            listen_port: 8134,
            oauth_client_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub region_id: i64,
    pub location_id: Option<i64>,
    pub price_method: PriceMethod,
    /// Multiplier on material (input) prices.
    pub input_modifier: f64,
    /// Multiplier on product (output) prices.
    pub output_modifier: f64,
    pub percentile: f64,
    pub min_volume: i64,
    pub min_match_confidence: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            // The Forge / Jita 4-4.
            region_id: 10000002,
            location_id: Some(60003760),
            price_method: PriceMethod::Hybrid,
            input_modifier: 1.0,
            output_modifier: 1.0,
            percentile: 0.2,
            min_volume: 1,
            min_match_confidence: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub market: MarketConfig,
    pub facilities: Vec<Facility>,
}

impl AppConfig {
    /// Load from `dir`, writing defaults on first run.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.is_file() {
            let config = Self::default();
            config.save(dir)?;
            return Ok(config);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn facility(&self, facility_id: i64) -> Option<&Facility> {
        self.facilities.iter().find(|f| f.facility_id == facility_id)
    }

    /// Resolve a path from the config relative to the config directory.
    pub fn resolve_path(dir: &Path, value: &str) -> PathBuf {
        let path = Path::new(value);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            dir.join(path)
        }
    }
}

/// The user config directory: `$QUANTUMFORGE_CONFIG_DIR`, else the platform
/// config home under `quantumforge/`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("QUANTUMFORGE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("APPDATA").map(PathBuf::from))
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Path::new(&home).join(".config")
        });
    base.join("quantumforge")
}

/// Create the directory and, once, pull the old flat-layout files (config and
/// databases beside the directory) into it.
pub fn ensure_config_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let flag = dir.join(MIGRATION_FLAG);
    if flag.exists() {
        return Ok(());
    }

    if let Some(parent) = dir.parent() {
        for name in [CONFIG_FILE, "characters.db", "market.db"] {
            let old = parent.join(name);
            let new = dir.join(name);
            if old.is_file() && !new.exists() {
                fs::rename(&old, &new)
                    .with_context(|| format!("moving {} into {}", old.display(), dir.display()))?;
                tracing::info!(file = name, "migrated into config directory");
            }
        }
    }
    fs::write(&flag, b"")?;
    Ok(())
}
