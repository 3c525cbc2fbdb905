//! Persistent stores.
//!
//! Two SQLite files, WAL journaling, one connection per file for the whole
//! process. Writes serialize through a tokio mutex; every multi-table
//! mutation runs in a single transaction.

pub mod character;
pub mod market;
pub mod migrations;
pub mod plan;

use crate::error::{CoreError, CoreResult};
use migrations::Migration;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// A single-writer handle to one database file. Clones share the connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open the file, apply pragmas, and bring the schema up to date. The
    /// process keeps exactly one connection per file.
    pub fn open(path: &Path, migrations: &[Migration]) -> CoreResult<Self> {
        let mut conn = Connection::open(path)
            .map_err(|e| CoreError::Database(format!("{}: {e}", path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        migrations::run(&mut conn, migrations)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory(migrations: &[Migration]) -> CoreResult<Self> {
        let mut conn =
            Connection::open_in_memory().map_err(|e| CoreError::Database(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        migrations::run(&mut conn, migrations)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
