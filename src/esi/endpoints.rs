//! Typed endpoint wrappers over the transport.
//!
//! Each call emits status events (`start -> success | error`), converts the
//! wire DTOs into domain records, and returns the response cache expiry so
//! stores can stamp rows. Corporation-endpoint 403s become empty successes:
//! the character simply lacks the role.

use crate::error::{CoreError, CoreResult};
use crate::esi::auth::TokenManager;
use crate::esi::client::{CallOptions, EsiTransport, ResponseMeta};
use crate::models::{
    Asset, HistoryDay, IndustryJob, MarketOrder, OwnedBlueprint, SkillRecord, WalletTransaction,
};
use serde::Deserialize;
use std::sync::Arc;

pub struct EsiClient {
    transport: EsiTransport,
    tokens: Arc<TokenManager>,
}

// -- wire DTOs --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SkillsResponse {
    skills: Vec<SkillEntry>,
}

#[derive(Debug, Deserialize)]
struct SkillEntry {
    skill_id: i64,
    active_skill_level: i64,
    trained_skill_level: i64,
    skillpoints_in_skill: i64,
}

#[derive(Debug, Deserialize)]
struct BlueprintEntry {
    item_id: i64,
    type_id: i64,
    location_id: i64,
    location_flag: String,
    quantity: i64,
    material_efficiency: i64,
    time_efficiency: i64,
    runs: i64,
}

#[derive(Debug, Deserialize)]
struct AssetEntry {
    item_id: i64,
    type_id: i64,
    location_id: i64,
    location_flag: String,
    quantity: i64,
    is_singleton: bool,
    #[serde(default)]
    is_blueprint_copy: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct IndustryJobEntry {
    job_id: i64,
    installer_id: i64,
    facility_id: i64,
    activity_id: i64,
    blueprint_type_id: i64,
    runs: i64,
    status: String,
    start_date: Option<String>,
    end_date: Option<String>,
    completed_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WalletTransactionEntry {
    transaction_id: i64,
    date: String,
    type_id: i64,
    quantity: i64,
    unit_price: f64,
    location_id: i64,
    is_buy: bool,
    is_personal: bool,
}

#[derive(Debug, Deserialize)]
struct OrderEntry {
    order_id: i64,
    type_id: i64,
    price: f64,
    volume_remain: i64,
    is_buy_order: bool,
    location_id: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    date: String,
    average: f64,
    highest: f64,
    lowest: f64,
    volume: i64,
    order_count: i64,
}

#[derive(Debug, Deserialize)]
struct CostIndexEntry {
    solar_system_id: i64,
    cost_indices: Vec<CostIndexActivity>,
}

#[derive(Debug, Deserialize)]
struct CostIndexActivity {
    activity: String,
    cost_index: f64,
}

#[derive(Debug, Deserialize)]
struct AdjustedPriceEntry {
    type_id: i64,
    #[serde(default)]
    adjusted_price: Option<f64>,
    #[serde(default)]
    average_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct CharacterInfo {
    pub name: String,
    pub corporation_id: i64,
    #[serde(default)]
    pub alliance_id: Option<i64>,
}

fn parse_date_ms(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

impl EsiClient {
    pub fn new(transport: EsiTransport, tokens: Arc<TokenManager>) -> Self {
        Self { transport, tokens }
    }

    pub fn status(&self) -> &Arc<crate::esi::status::FetchStatusTracker> {
        &self.transport.status
    }

    async fn tracked<T, F>(&self, key: String, fut: F) -> CoreResult<(T, ResponseMeta)>
    where
        F: std::future::Future<Output = CoreResult<(T, ResponseMeta)>>,
    {
        self.transport.status.start(&key);
        match fut.await {
            Ok((value, meta)) => {
                self.transport
                    .status
                    .success(&key, meta.expires_at, meta.response_size);
                Ok((value, meta))
            }
            Err(err) => {
                self.transport.status.error(&key, err.to_string());
                Err(err)
            }
        }
    }

    // -- character endpoints ------------------------------------------------

    pub async fn character_info(
        &self,
        character_id: i64,
        opts: &CallOptions,
    ) -> CoreResult<CharacterInfo> {
        let path = format!("/characters/{character_id}/");
        let (info, _meta) = self
            .tracked(format!("{character_id}:info"), async {
                self.transport
                    .get_json::<CharacterInfo>(&path, &[], None, opts)
                    .await
            })
            .await?;
        Ok(info)
    }

    pub async fn skills(
        &self,
        character_id: i64,
        opts: &CallOptions,
    ) -> CoreResult<(Vec<SkillRecord>, ResponseMeta)> {
        let token = self.tokens.access_token(character_id).await?;
        let path = format!("/characters/{character_id}/skills/");
        let (response, meta) = self
            .tracked(format!("{character_id}:skills"), async {
                self.transport
                    .get_json::<SkillsResponse>(&path, &[], Some(&token), opts)
                    .await
            })
            .await?;
        let skills = response
            .skills
            .into_iter()
            .map(|s| SkillRecord {
                character_id,
                skill_id: s.skill_id,
                active_level: s.active_skill_level,
                trained_level: s.trained_skill_level,
                skillpoints: s.skillpoints_in_skill,
            })
            .collect();
        Ok((skills, meta))
    }

    pub async fn blueprints(
        &self,
        character_id: i64,
        opts: &CallOptions,
    ) -> CoreResult<(Vec<OwnedBlueprint>, ResponseMeta)> {
        let token = self.tokens.access_token(character_id).await?;
        let path = format!("/characters/{character_id}/blueprints/");
        let (entries, meta) = self
            .tracked(format!("{character_id}:blueprints"), async {
                self.transport
                    .get_paginated::<BlueprintEntry>(&path, &[], Some(&token), opts)
                    .await
            })
            .await?;
        let blueprints = entries
            .into_iter()
            .map(|b| OwnedBlueprint {
                item_id: b.item_id.to_string(),
                type_id: b.type_id,
                character_id,
                corporation_id: None,
                location_id: Some(b.location_id),
                location_flag: Some(b.location_flag),
                quantity: b.quantity,
                time_efficiency: b.time_efficiency,
                material_efficiency: b.material_efficiency,
                runs: b.runs,
                is_copy: b.runs >= 0,
                is_corporation: false,
                source: "esi".to_string(),
                manually_added: false,
            })
            .collect();
        Ok((blueprints, meta))
    }

    pub async fn assets(
        &self,
        character_id: i64,
        opts: &CallOptions,
    ) -> CoreResult<(Vec<Asset>, ResponseMeta)> {
        let token = self.tokens.access_token(character_id).await?;
        let path = format!("/characters/{character_id}/assets/");
        let (entries, meta) = self
            .tracked(format!("{character_id}:assets"), async {
                self.transport
                    .get_paginated::<AssetEntry>(&path, &[], Some(&token), opts)
                    .await
            })
            .await?;
        Ok((
            entries
                .into_iter()
                .map(|a| asset_from_entry(a, character_id, false))
                .collect(),
            meta,
        ))
    }

    /// Corporation assets need a role the character may not have; a 403 is
    /// "no permission, empty result", not an error.
    pub async fn corporation_assets(
        &self,
        character_id: i64,
        corporation_id: i64,
        opts: &CallOptions,
    ) -> CoreResult<(Vec<Asset>, ResponseMeta)> {
        let token = self.tokens.access_token(character_id).await?;
        let path = format!("/corporations/{corporation_id}/assets/");
        let key = format!("{character_id}:corporation_assets");
        self.transport.status.start(&key);
        match self
            .transport
            .get_paginated::<AssetEntry>(&path, &[], Some(&token), opts)
            .await
        {
            Ok((entries, meta)) => {
                self.transport
                    .status
                    .success(&key, meta.expires_at, meta.response_size);
                Ok((
                    entries
                        .into_iter()
                        .map(|a| asset_from_entry(a, character_id, true))
                        .collect(),
                    meta,
                ))
            }
            Err(CoreError::HttpStatus { status: 403, .. }) => {
                tracing::debug!(character_id, corporation_id, "no corporation asset role");
                self.transport.status.success(&key, None, 0);
                Ok((Vec::new(), ResponseMeta::default()))
            }
            Err(err) => {
                self.transport.status.error(&key, err.to_string());
                Err(err)
            }
        }
    }

    pub async fn industry_jobs(
        &self,
        character_id: i64,
        opts: &CallOptions,
    ) -> CoreResult<(Vec<IndustryJob>, ResponseMeta)> {
        let token = self.tokens.access_token(character_id).await?;
        let path = format!("/characters/{character_id}/industry/jobs/");
        let (entries, meta) = self
            .tracked(format!("{character_id}:industry_jobs"), async {
                self.transport
                    .get_json::<Vec<IndustryJobEntry>>(
                        &path,
                        &[("include_completed", "true".to_string())],
                        Some(&token),
                        opts,
                    )
                    .await
            })
            .await?;
        let jobs = entries
            .into_iter()
            .map(|j| IndustryJob {
                job_id: j.job_id,
                character_id,
                installer_id: j.installer_id,
                facility_id: j.facility_id,
                activity_id: j.activity_id,
                blueprint_type_id: j.blueprint_type_id,
                runs: j.runs,
                status: j.status,
                start_date: j.start_date.as_deref().and_then(parse_date_ms),
                end_date: j.end_date.as_deref().and_then(parse_date_ms),
                completed_date: j.completed_date.as_deref().and_then(parse_date_ms),
            })
            .collect();
        Ok((jobs, meta))
    }

    pub async fn wallet_transactions(
        &self,
        character_id: i64,
        opts: &CallOptions,
    ) -> CoreResult<(Vec<WalletTransaction>, ResponseMeta)> {
        let token = self.tokens.access_token(character_id).await?;
        let path = format!("/characters/{character_id}/wallet/transactions/");
        let (entries, meta) = self
            .tracked(format!("{character_id}:wallet_transactions"), async {
                self.transport
                    .get_json::<Vec<WalletTransactionEntry>>(&path, &[], Some(&token), opts)
                    .await
            })
            .await?;
        let transactions = entries
            .into_iter()
            .map(|t| WalletTransaction {
                transaction_id: t.transaction_id,
                character_id,
                date: parse_date_ms(&t.date).unwrap_or(0),
                type_id: t.type_id,
                quantity: t.quantity,
                unit_price: t.unit_price,
                location_id: t.location_id,
                is_buy: t.is_buy,
                is_personal: t.is_personal,
            })
            .collect();
        Ok((transactions, meta))
    }

    // -- public market endpoints --------------------------------------------

    pub async fn market_orders(
        &self,
        region_id: i64,
        type_id: i64,
        opts: &CallOptions,
    ) -> CoreResult<(Vec<MarketOrder>, ResponseMeta)> {
        let path = format!("/markets/{region_id}/orders/");
        let (entries, meta) = self
            .tracked(format!("market:{region_id}:{type_id}:orders"), async {
                self.transport
                    .get_paginated::<OrderEntry>(
                        &path,
                        &[
                            ("order_type", "all".to_string()),
                            ("type_id", type_id.to_string()),
                        ],
                        None,
                        opts,
                    )
                    .await
            })
            .await?;
        let orders = entries
            .into_iter()
            .map(|o| MarketOrder {
                order_id: o.order_id,
                region_id,
                type_id: o.type_id,
                price: o.price,
                volume_remain: o.volume_remain,
                is_buy_order: o.is_buy_order,
                location_id: o.location_id,
            })
            .collect();
        Ok((orders, meta))
    }

    pub async fn market_history(
        &self,
        region_id: i64,
        type_id: i64,
        opts: &CallOptions,
    ) -> CoreResult<(Vec<HistoryDay>, ResponseMeta)> {
        let path = format!("/markets/{region_id}/history/");
        let (entries, meta) = self
            .tracked(format!("market:{region_id}:{type_id}:history"), async {
                self.transport
                    .get_json::<Vec<HistoryEntry>>(
                        &path,
                        &[("type_id", type_id.to_string())],
                        None,
                        opts,
                    )
                    .await
            })
            .await?;
        let history = entries
            .into_iter()
            .map(|h| HistoryDay {
                region_id,
                type_id,
                date: h.date,
                average: h.average,
                highest: h.highest,
                lowest: h.lowest,
                volume: h.volume,
                order_count: h.order_count,
            })
            .collect();
        Ok((history, meta))
    }

    /// Per-system cost indices, flattened to (system, activity, index).
    pub async fn cost_indices(
        &self,
        opts: &CallOptions,
    ) -> CoreResult<(Vec<(i64, String, f64)>, ResponseMeta)> {
        let (entries, meta) = self
            .tracked("industry:systems".to_string(), async {
                self.transport
                    .get_json::<Vec<CostIndexEntry>>("/industry/systems/", &[], None, opts)
                    .await
            })
            .await?;
        let mut out = Vec::new();
        for entry in entries {
            for activity in entry.cost_indices {
                out.push((entry.solar_system_id, activity.activity, activity.cost_index));
            }
        }
        Ok((out, meta))
    }

    /// The server's adjusted-price table (the EIV base), as
    /// (type, adjusted, average).
    pub async fn adjusted_prices(
        &self,
        opts: &CallOptions,
    ) -> CoreResult<(Vec<(i64, f64, Option<f64>)>, ResponseMeta)> {
        let (entries, meta) = self
            .tracked("markets:prices".to_string(), async {
                self.transport
                    .get_json::<Vec<AdjustedPriceEntry>>("/markets/prices/", &[], None, opts)
                    .await
            })
            .await?;
        let prices = entries
            .into_iter()
            .filter_map(|p| p.adjusted_price.map(|adj| (p.type_id, adj, p.average_price)))
            .collect();
        Ok((prices, meta))
    }
}

fn asset_from_entry(entry: AssetEntry, character_id: i64, is_corporation: bool) -> Asset {
    Asset {
        item_id: entry.item_id.to_string(),
        character_id,
        type_id: entry.type_id,
        location_id: entry.location_id,
        location_flag: Some(entry.location_flag),
        quantity: entry.quantity,
        is_singleton: entry.is_singleton,
        is_blueprint_copy: entry.is_blueprint_copy,
        is_corporation,
    }
}
