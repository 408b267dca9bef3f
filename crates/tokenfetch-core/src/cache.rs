//! Time-bounded cache of per-entity fetch results.
//!
//! Entries are keyed by entity id and remember the window they were fetched for. A lookup only
//! hits when the stored window equals the requested one and the entry is younger than the TTL.
//! Stale or mismatched entries stay in place until a newer fetch overwrites them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;
use tokenfetch_warehouse::{CacheRecord, CacheWarehouse, WarehouseConfig, WarehouseError};
use tracing::{debug, warn};

use crate::domain::{FetchResult, FetchWindow, UtcDateTime};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("cache payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A stored result plus the context needed to judge its freshness.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub result: FetchResult,
    pub window: FetchWindow,
    pub fetched_at: UtcDateTime,
}

impl CacheEntry {
    pub fn new(result: FetchResult, window: FetchWindow) -> Self {
        Self {
            result,
            window,
            fetched_at: UtcDateTime::now(),
        }
    }

    pub fn with_fetched_at(mut self, fetched_at: UtcDateTime) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    pub fn entity_id(&self) -> i64 {
        self.result.entity().id()
    }

    fn serves(&self, window: &FetchWindow, ttl: Duration, now: UtcDateTime) -> bool {
        self.window == *window && is_fresh(self.fetched_at, ttl, now)
    }
}

fn is_fresh(fetched_at: UtcDateTime, ttl: Duration, now: UtcDateTime) -> bool {
    !ttl.is_zero() && fetched_at.seconds_until(now) <= ttl.as_secs()
}

/// Pluggable result cache shared by all batch workers.
pub trait QuoteCache: Send + Sync {
    /// Fresh result for `entity_id` over exactly `window`, if any.
    fn get(&self, entity_id: i64, window: &FetchWindow) -> Result<Option<FetchResult>, CacheError>;

    /// Store `entry`, replacing whatever was kept for the same entity.
    ///
    /// Results that are not terminal successes are ignored.
    fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;
}

/// Process-local cache.
#[derive(Debug)]
pub struct MemoryCache {
    ttl: Duration,
    entries: RwLock<HashMap<i64, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn is_disabled(&self) -> bool {
        self.ttl.is_zero()
    }

    /// Stored entries, including stale ones.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<i64, CacheEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| {
            warn!("memory cache lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<i64, CacheEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| {
            warn!("memory cache lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl QuoteCache for MemoryCache {
    fn get(&self, entity_id: i64, window: &FetchWindow) -> Result<Option<FetchResult>, CacheError> {
        let now = UtcDateTime::now();
        let entries = self.read();
        Ok(entries
            .get(&entity_id)
            .filter(|entry| entry.serves(window, self.ttl, now))
            .map(|entry| entry.result.clone()))
    }

    fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        if self.is_disabled() || !entry.result.status().is_cacheable() {
            return Ok(());
        }
        self.write().insert(entry.entity_id(), entry);
        Ok(())
    }
}

/// Cache persisted in the `DuckDB` warehouse so results survive restarts.
pub struct PersistentCache {
    warehouse: CacheWarehouse,
    ttl: Duration,
}

impl PersistentCache {
    pub fn new(warehouse: CacheWarehouse, ttl: Duration) -> Self {
        Self { warehouse, ttl }
    }

    pub fn open(config: WarehouseConfig, ttl: Duration) -> Result<Self, CacheError> {
        Ok(Self::new(CacheWarehouse::open(config)?, ttl))
    }

    pub fn warehouse(&self) -> &CacheWarehouse {
        &self.warehouse
    }
}

impl QuoteCache for PersistentCache {
    fn get(&self, entity_id: i64, window: &FetchWindow) -> Result<Option<FetchResult>, CacheError> {
        let Some(record) = self.warehouse.load(entity_id)? else {
            return Ok(None);
        };

        if record.window_start != window.start_str() || record.window_end != window.end_str() {
            debug!(entity_id, "cached window differs from request");
            return Ok(None);
        }

        let fetched_at = UtcDateTime::from_unix_timestamp(record.fetched_at);
        if !is_fresh(fetched_at, self.ttl, UtcDateTime::now()) {
            debug!(entity_id, "cached entry expired");
            return Ok(None);
        }

        match serde_json::from_str::<FetchResult>(&record.payload) {
            Ok(result) if result.entity().id() == entity_id => Ok(Some(result)),
            Ok(_) => {
                warn!(entity_id, "cached payload belongs to another entity, ignoring");
                Ok(None)
            }
            Err(error) => {
                warn!(entity_id, %error, "cached payload is corrupt, ignoring");
                Ok(None)
            }
        }
    }

    fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        if self.ttl.is_zero() || !entry.result.status().is_cacheable() {
            return Ok(());
        }

        let record = CacheRecord {
            entity_id: entry.entity_id(),
            symbol: entry.result.entity().symbol().to_owned(),
            window_start: entry.window.start_str(),
            window_end: entry.window.end_str(),
            payload: serde_json::to_string(&entry.result)?,
            fetched_at: entry.fetched_at.unix_timestamp(),
        };
        self.warehouse.upsert(&record)?;
        Ok(())
    }
}

/// Open the persistent cache, degrading to a process-local one when the database is unusable.
pub fn open_cache_or_memory(config: WarehouseConfig, ttl: Duration) -> Arc<dyn QuoteCache> {
    let db_path = config.db_path.clone();
    match PersistentCache::open(config, ttl) {
        Ok(cache) => Arc::new(cache),
        Err(error) => {
            warn!(
                db_path = %db_path.display(),
                %error,
                "persistent cache unavailable, falling back to memory cache"
            );
            Arc::new(MemoryCache::new(ttl))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityRef, FetchStatus, QuotePoint};

    fn window(start: &str, end: &str) -> FetchWindow {
        FetchWindow::parse(start, end).expect("valid window")
    }

    fn ok_result(id: i64, price: f64) -> FetchResult {
        FetchResult::ok(
            EntityRef::new(id, format!("T{id}")).expect("valid entity"),
            QuotePoint {
                price,
                market_cap: Some(price * 1_000.0),
            },
        )
    }

    fn caches() -> Vec<Box<dyn QuoteCache>> {
        vec![
            Box::new(MemoryCache::new(Duration::from_secs(3_600))),
            Box::new(PersistentCache::new(
                CacheWarehouse::open_in_memory().expect("in-memory warehouse"),
                Duration::from_secs(3_600),
            )),
        ]
    }

    #[test]
    fn hit_requires_exact_window() {
        let jan = window("2024-01-01", "2024-01-02");
        for cache in caches() {
            cache
                .put(CacheEntry::new(ok_result(1, 10.0), jan))
                .expect("put");

            assert_eq!(cache.get(1, &jan).expect("get"), Some(ok_result(1, 10.0)));
            assert_eq!(
                cache.get(1, &window("2024-01-01", "2024-01-03")).expect("get"),
                None
            );
            assert_eq!(cache.get(2, &jan).expect("get"), None);
        }
    }

    #[test]
    fn expired_entries_are_misses_but_stay_stored() {
        let jan = window("2024-01-01", "2024-01-02");
        let two_hours_ago =
            UtcDateTime::from_unix_timestamp(UtcDateTime::now().unix_timestamp() - 7_200);

        let memory = MemoryCache::new(Duration::from_secs(3_600));
        memory
            .put(CacheEntry::new(ok_result(1, 10.0), jan).with_fetched_at(two_hours_ago))
            .expect("put");
        assert_eq!(memory.get(1, &jan).expect("get"), None);
        assert_eq!(memory.len(), 1);

        let persistent = PersistentCache::new(
            CacheWarehouse::open_in_memory().expect("warehouse"),
            Duration::from_secs(3_600),
        );
        persistent
            .put(CacheEntry::new(ok_result(1, 10.0), jan).with_fetched_at(two_hours_ago))
            .expect("put");
        assert_eq!(persistent.get(1, &jan).expect("get"), None);
        assert_eq!(persistent.warehouse().stats().expect("stats").entries, 1);
    }

    #[test]
    fn last_write_wins() {
        let jan = window("2024-01-01", "2024-01-02");
        for cache in caches() {
            cache.put(CacheEntry::new(ok_result(1, 10.0), jan)).expect("put");
            cache.put(CacheEntry::new(ok_result(1, 11.0), jan)).expect("put");
            assert_eq!(cache.get(1, &jan).expect("get"), Some(ok_result(1, 11.0)));
        }
    }

    #[test]
    fn failures_are_never_cached() {
        let jan = window("2024-01-01", "2024-01-02");
        let entity = EntityRef::new(9, "BAD").expect("valid entity");
        for cache in caches() {
            cache
                .put(CacheEntry::new(
                    FetchResult::failed(entity.clone(), FetchStatus::Invalid),
                    jan,
                ))
                .expect("put");
            assert_eq!(cache.get(9, &jan).expect("get"), None);
        }
    }

    #[test]
    fn no_data_is_cached() {
        let jan = window("2024-01-01", "2024-01-02");
        let entity = EntityRef::new(4, "NEW").expect("valid entity");
        for cache in caches() {
            cache
                .put(CacheEntry::new(FetchResult::no_data(entity.clone()), jan))
                .expect("put");
            let hit = cache.get(4, &jan).expect("get").expect("cached");
            assert_eq!(hit.status(), FetchStatus::NoData);
        }
    }

    #[test]
    fn corrupt_row_is_a_miss_and_does_not_block_others() {
        let jan = window("2024-01-01", "2024-01-02");
        let cache = PersistentCache::new(
            CacheWarehouse::open_in_memory().expect("warehouse"),
            Duration::from_secs(3_600),
        );
        cache.put(CacheEntry::new(ok_result(1, 10.0), jan)).expect("put");
        cache
            .warehouse()
            .upsert(&CacheRecord {
                entity_id: 2,
                symbol: String::from("T2"),
                window_start: jan.start_str(),
                window_end: jan.end_str(),
                payload: String::from("{not json"),
                fetched_at: UtcDateTime::now().unix_timestamp(),
            })
            .expect("raw upsert");

        assert_eq!(cache.get(2, &jan).expect("get"), None);
        assert_eq!(cache.get(1, &jan).expect("get"), Some(ok_result(1, 10.0)));
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let jan = window("2024-01-01", "2024-01-02");
        let cache = MemoryCache::disabled();
        cache.put(CacheEntry::new(ok_result(1, 10.0), jan)).expect("put");
        assert!(cache.is_empty());
        assert_eq!(cache.get(1, &jan).expect("get"), None);
    }

    #[test]
    fn unusable_database_degrades_to_memory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = WarehouseConfig::under(temp.path());
        std::fs::create_dir_all(config.db_path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&config.db_path, b"garbage").expect("write");

        let jan = window("2024-01-01", "2024-01-02");
        let cache = open_cache_or_memory(config, Duration::from_secs(60));
        cache.put(CacheEntry::new(ok_result(1, 10.0), jan)).expect("put");
        assert!(cache.get(1, &jan).expect("get").is_some());
    }
}
