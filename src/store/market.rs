//! Market store: order books, daily history, price overrides, memoized price
//! calculations, and the server-published adjusted prices / cost indices.
//!
//! Order books are replaced wholesale per (region, type) fetch so a read
//! always observes one complete snapshot.

use crate::error::CoreResult;
use crate::models::{now_ms, CachedPrice, HistoryDay, MarketOrder, PriceOverride};
use crate::store::Db;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;

/// Memoized price results live this long.
pub const PRICE_CACHE_TTL_MS: i64 = 5 * 60 * 1000;

#[derive(Clone)]
pub struct MarketStore {
    db: Db,
}

impl MarketStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    // -- orders -------------------------------------------------------------

    pub async fn replace_orders(
        &self,
        region_id: i64,
        type_id: i64,
        orders: &[MarketOrder],
    ) -> CoreResult<()> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM orders WHERE region_id = ?1 AND type_id = ?2",
            params![region_id, type_id],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO orders (order_id, region_id, type_id, price, volume_remain,
                    is_buy_order, location_id, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            let now = now_ms();
            for order in orders {
                stmt.execute(params![
                    order.order_id,
                    region_id,
                    type_id,
                    order.price,
                    order.volume_remain,
                    order.is_buy_order as i64,
                    order.location_id,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn get_orders(&self, region_id: i64, type_id: i64) -> CoreResult<Vec<MarketOrder>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, region_id, type_id, price, volume_remain, is_buy_order, location_id
             FROM orders WHERE region_id = ?1 AND type_id = ?2",
        )?;
        let rows = stmt
            .query_map(params![region_id, type_id], |row| {
                Ok(MarketOrder {
                    order_id: row.get(0)?,
                    region_id: row.get(1)?,
                    type_id: row.get(2)?,
                    price: row.get(3)?,
                    volume_remain: row.get(4)?,
                    is_buy_order: row.get::<_, i64>(5)? != 0,
                    location_id: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// When the last order snapshot for (region, type) was written, if ever.
    pub async fn orders_fetched_at(&self, region_id: i64, type_id: i64) -> CoreResult<Option<i64>> {
        let conn = self.db.conn().await;
        let fetched: Option<i64> = conn
            .query_row(
                "SELECT MAX(fetched_at) FROM orders WHERE region_id = ?1 AND type_id = ?2",
                params![region_id, type_id],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        Ok(fetched)
    }

    // -- history ------------------------------------------------------------

    pub async fn upsert_history(
        &self,
        region_id: i64,
        type_id: i64,
        days: &[HistoryDay],
    ) -> CoreResult<()> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO history (region_id, type_id, date, average, highest, lowest,
                    volume, order_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(region_id, type_id, date) DO UPDATE SET
                    average = excluded.average,
                    highest = excluded.highest,
                    lowest = excluded.lowest,
                    volume = excluded.volume,
                    order_count = excluded.order_count",
            )?;
            for day in days {
                stmt.execute(params![
                    region_id,
                    type_id,
                    day.date,
                    day.average,
                    day.highest,
                    day.lowest,
                    day.volume,
                    day.order_count,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Daily history sorted by date ascending.
    pub async fn get_history(&self, region_id: i64, type_id: i64) -> CoreResult<Vec<HistoryDay>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT region_id, type_id, date, average, highest, lowest, volume, order_count
             FROM history WHERE region_id = ?1 AND type_id = ?2 ORDER BY date ASC",
        )?;
        let rows = stmt
            .query_map(params![region_id, type_id], |row| {
                Ok(HistoryDay {
                    region_id: row.get(0)?,
                    type_id: row.get(1)?,
                    date: row.get(2)?,
                    average: row.get(3)?,
                    highest: row.get(4)?,
                    lowest: row.get(5)?,
                    volume: row.get(6)?,
                    order_count: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- overrides ----------------------------------------------------------

    pub async fn set_override(&self, type_id: i64, price: f64, notes: Option<&str>) -> CoreResult<()> {
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT INTO price_overrides (type_id, price, notes, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(type_id) DO UPDATE SET
                price = excluded.price,
                notes = excluded.notes,
                updated_at = excluded.updated_at",
            params![type_id, price, notes, now_ms()],
        )?;
        Ok(())
    }

    pub async fn get_override(&self, type_id: i64) -> CoreResult<Option<PriceOverride>> {
        let conn = self.db.conn().await;
        let row = conn
            .query_row(
                "SELECT type_id, price, notes, updated_at FROM price_overrides WHERE type_id = ?1",
                params![type_id],
                |row| {
                    Ok(PriceOverride {
                        type_id: row.get(0)?,
                        price: row.get(1)?,
                        notes: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub async fn list_overrides(&self) -> CoreResult<Vec<PriceOverride>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT type_id, price, notes, updated_at FROM price_overrides ORDER BY type_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PriceOverride {
                    type_id: row.get(0)?,
                    price: row.get(1)?,
                    notes: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn remove_override(&self, type_id: i64) -> CoreResult<bool> {
        let conn = self.db.conn().await;
        let removed =
            conn.execute("DELETE FROM price_overrides WHERE type_id = ?1", params![type_id])?;
        Ok(removed > 0)
    }

    // -- price cache --------------------------------------------------------

    pub async fn get_cached_price(
        &self,
        type_id: i64,
        region_id: i64,
        location_id: Option<i64>,
        price_type: &str,
    ) -> CoreResult<Option<CachedPrice>> {
        let conn = self.db.conn().await;
        let row = conn
            .query_row(
                "SELECT type_id, location_id, region_id, price_type, price, method,
                    confidence, calculated_at, expires_at
                 FROM price_cache
                 WHERE type_id = ?1 AND region_id = ?2 AND location_id = ?3
                   AND price_type = ?4 AND expires_at > ?5",
                params![type_id, region_id, location_id.unwrap_or(0), price_type, now_ms()],
                |row| {
                    let location: i64 = row.get(1)?;
                    Ok(CachedPrice {
                        type_id: row.get(0)?,
                        location_id: if location == 0 { None } else { Some(location) },
                        region_id: row.get(2)?,
                        price_type: row.get(3)?,
                        price: row.get(4)?,
                        method: row.get(5)?,
                        confidence: row.get(6)?,
                        calculated_at: row.get(7)?,
                        expires_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub async fn put_cached_price(&self, cached: &CachedPrice) -> CoreResult<()> {
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT INTO price_cache (type_id, location_id, region_id, price_type, price,
                method, confidence, calculated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(type_id, region_id, price_type, location_id) DO UPDATE SET
                price = excluded.price,
                method = excluded.method,
                confidence = excluded.confidence,
                calculated_at = excluded.calculated_at,
                expires_at = excluded.expires_at",
            params![
                cached.type_id,
                cached.location_id.unwrap_or(0),
                cached.region_id,
                cached.price_type,
                cached.price,
                cached.method,
                cached.confidence,
                cached.calculated_at,
                cached.expires_at,
            ],
        )?;
        Ok(())
    }

    pub async fn purge_expired_prices(&self) -> CoreResult<usize> {
        let conn = self.db.conn().await;
        let purged = conn.execute(
            "DELETE FROM price_cache WHERE expires_at <= ?1",
            params![now_ms()],
        )?;
        Ok(purged)
    }

    // -- adjusted prices & cost indices -------------------------------------

    pub async fn replace_adjusted_prices(&self, prices: &[(i64, f64, Option<f64>)]) -> CoreResult<()> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM adjusted_prices", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO adjusted_prices (type_id, adjusted_price, average_price, fetched_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let now = now_ms();
            for (type_id, adjusted, average) in prices {
                stmt.execute(params![type_id, adjusted, average, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn adjusted_prices(&self) -> CoreResult<HashMap<i64, f64>> {
        let conn = self.db.conn().await;
        let mut stmt =
            conn.prepare_cached("SELECT type_id, adjusted_price FROM adjusted_prices")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    pub async fn replace_cost_indices(
        &self,
        indices: &[(i64, String, f64)],
    ) -> CoreResult<()> {
        let mut conn = self.db.conn().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM system_cost_indices", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO system_cost_indices (system_id, activity, cost_index, fetched_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let now = now_ms();
            for (system_id, activity, index) in indices {
                stmt.execute(params![system_id, activity, index, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn cost_index(&self, system_id: i64, activity: &str) -> CoreResult<Option<f64>> {
        let conn = self.db.conn().await;
        let index: Option<f64> = conn
            .query_row(
                "SELECT cost_index FROM system_cost_indices WHERE system_id = ?1 AND activity = ?2",
                params![system_id, activity],
                |r| r.get(0),
            )
            .optional()?;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::migrations::market_migrations;

    fn store() -> MarketStore {
        MarketStore::new(Db::open_in_memory(&market_migrations()).unwrap())
    }

    fn order(order_id: i64, price: f64) -> MarketOrder {
        MarketOrder {
            order_id,
            region_id: 10000002,
            type_id: 34,
            price,
            volume_remain: 100,
            is_buy_order: false,
            location_id: 60003760,
        }
    }

    #[tokio::test]
    async fn orders_replaced_wholesale() {
        let store = store();
        store
            .replace_orders(10000002, 34, &[order(1, 4.0), order(2, 4.1)])
            .await
            .unwrap();
        store.replace_orders(10000002, 34, &[order(3, 5.0)]).await.unwrap();

        let orders = store.get_orders(10000002, 34).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, 3);
        assert!(store.orders_fetched_at(10000002, 34).await.unwrap().is_some());
        assert!(store.orders_fetched_at(10000002, 35).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn price_cache_expires() {
        let store = store();
        let mut cached = CachedPrice {
            type_id: 34,
            location_id: None,
            region_id: 10000002,
            price_type: "sell".to_string(),
            price: 4.5,
            method: "hybrid".to_string(),
            confidence: "high".to_string(),
            calculated_at: now_ms(),
            expires_at: now_ms() + PRICE_CACHE_TTL_MS,
        };
        store.put_cached_price(&cached).await.unwrap();
        assert!(store
            .get_cached_price(34, 10000002, None, "sell")
            .await
            .unwrap()
            .is_some());

        cached.expires_at = now_ms() - 1;
        store.put_cached_price(&cached).await.unwrap();
        assert!(store
            .get_cached_price(34, 10000002, None, "sell")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.purge_expired_prices().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn override_roundtrip() {
        let store = store();
        store.set_override(34, 10.0, Some("frozen for plan")).await.unwrap();
        let o = store.get_override(34).await.unwrap().unwrap();
        assert_eq!(o.price, 10.0);
        assert!(store.remove_override(34).await.unwrap());
        assert!(store.get_override(34).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cost_index_lookup() {
        let store = store();
        store
            .replace_cost_indices(&[(30000142, "manufacturing".to_string(), 0.0512)])
            .await
            .unwrap();
        assert_eq!(
            store.cost_index(30000142, "manufacturing").await.unwrap(),
            Some(0.0512)
        );
        assert_eq!(store.cost_index(1, "manufacturing").await.unwrap(), None);
    }
}
