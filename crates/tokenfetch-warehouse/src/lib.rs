//! # Tokenfetch Warehouse
//!
//! DuckDB-backed persistence for previously fetched quote records.
//!
//! The warehouse stores one row per entity id. Each row remembers the window it was
//! fetched for, an opaque JSON payload and the unix time it was fetched at. Freshness and
//! payload decoding are the caller's concern: the warehouse only stores and returns rows, so a
//! row with a damaged payload never prevents other rows from being read.
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `fetch_cache` | Last fetched record per entity id |
//! | `schema_migrations` | Applied migration versions |
//!
//! ```rust,no_run
//! use tokenfetch_warehouse::{CacheRecord, CacheWarehouse, WarehouseConfig};
//!
//! let warehouse = CacheWarehouse::open(WarehouseConfig::default())?;
//! warehouse.upsert(&CacheRecord {
//!     entity_id: 1,
//!     symbol: "BTC".to_string(),
//!     window_start: "2024-01-01".to_string(),
//!     window_end: "2024-01-02".to_string(),
//!     payload: "{}".to_string(),
//!     fetched_at: 1_704_153_600,
//! })?;
//! assert!(warehouse.load(1)?.is_some());
//! # Ok::<(), tokenfetch_warehouse::WarehouseError>(())
//! ```

pub mod migrations;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use ::duckdb::{Connection, OptionalExt, ToSql};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error while preparing the database directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Location of the cache database.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Root directory for tokenfetch data.
    pub tokenfetch_home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self::under(resolve_tokenfetch_home())
    }
}

impl WarehouseConfig {
    /// Standard layout below a given home directory.
    pub fn under(tokenfetch_home: impl Into<PathBuf>) -> Self {
        let tokenfetch_home = tokenfetch_home.into();
        let db_path = tokenfetch_home.join("cache").join("quotes.duckdb");
        Self {
            tokenfetch_home,
            db_path,
        }
    }
}

/// One persisted cache row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub entity_id: i64,
    pub symbol: String,
    /// Window start as `YYYY-MM-DD`.
    pub window_start: String,
    /// Window end as `YYYY-MM-DD`.
    pub window_end: String,
    /// Serialized fetch result.
    pub payload: String,
    /// Unix timestamp (seconds) of the fetch.
    pub fetched_at: i64,
}

/// Summary of the persisted cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub db_path: PathBuf,
    pub entries: usize,
    pub oldest_fetched_at: Option<i64>,
    pub newest_fetched_at: Option<i64>,
}

/// Quote cache persisted in a single `DuckDB` file.
pub struct CacheWarehouse {
    db_path: PathBuf,
    connection: Mutex<Connection>,
}

impl CacheWarehouse {
    /// Open (creating if needed) the database described by `config`.
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let connection = Connection::open(&config.db_path)?;
        connection.execute_batch("PRAGMA disable_progress_bar;")?;
        migrations::apply_migrations(&connection)?;

        Ok(Self {
            db_path: config.db_path,
            connection: Mutex::new(connection),
        })
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        let connection = Connection::open_in_memory()?;
        migrations::apply_migrations(&connection)?;
        Ok(Self {
            db_path: PathBuf::from(":memory:"),
            connection: Mutex::new(connection),
        })
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    /// Load the row stored for `entity_id`, if any.
    pub fn load(&self, entity_id: i64) -> Result<Option<CacheRecord>, WarehouseError> {
        let connection = self.lock();
        let record = connection
            .query_row(
                "SELECT entity_id, symbol, window_start, window_end, payload, fetched_at \
                 FROM fetch_cache WHERE entity_id = ?",
                [entity_id],
                |row| {
                    Ok(CacheRecord {
                        entity_id: row.get(0)?,
                        symbol: row.get(1)?,
                        window_start: row.get(2)?,
                        window_end: row.get(3)?,
                        payload: row.get(4)?,
                        fetched_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Insert or replace the row for `record.entity_id`. Last write wins.
    pub fn upsert(&self, record: &CacheRecord) -> Result<(), WarehouseError> {
        let connection = self.lock();
        let params: [&dyn ToSql; 6] = [
            &record.entity_id,
            &record.symbol,
            &record.window_start,
            &record.window_end,
            &record.payload,
            &record.fetched_at,
        ];
        connection.execute(
            "INSERT OR REPLACE INTO fetch_cache \
             (entity_id, symbol, window_start, window_end, payload, fetched_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
            params.as_slice(),
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats, WarehouseError> {
        let connection = self.lock();
        let (entries, oldest, newest): (i64, Option<i64>, Option<i64>) = connection.query_row(
            "SELECT COUNT(*), MIN(fetched_at), MAX(fetched_at) FROM fetch_cache",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(CacheStats {
            db_path: self.db_path.clone(),
            entries: usize::try_from(entries).unwrap_or_default(),
            oldest_fetched_at: oldest,
            newest_fetched_at: newest,
        })
    }

    /// Delete every row and return how many were removed.
    pub fn clear(&self) -> Result<usize, WarehouseError> {
        let connection = self.lock();
        let removed = connection.execute("DELETE FROM fetch_cache", [])?;
        Ok(removed)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(|poisoned| {
            warn!("cache warehouse connection mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Resolve the tokenfetch home directory from environment or default.
fn resolve_tokenfetch_home() -> PathBuf {
    if let Some(path) = env::var_os("TOKENFETCH_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".tokenfetch");
    }

    PathBuf::from(".tokenfetch")
}
