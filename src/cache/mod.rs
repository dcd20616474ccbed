//! Cache/Store Coordinator - tiered cache for API data
//!
//! Provides:
//! - Memory tier (moka) with per-entry TTL and size-bounded LRU eviction
//! - Durable tier through the `DurableStore` (survives reloads)
//! - Tag-based invalidation across both tiers
//! - Request coalescing for concurrent fetches of the same missing key
//!
//! This layer never talks to the network itself; `get_or_fetch` runs the
//! caller's fetch on a miss.

pub mod keys;

use crate::store::{ensure_schema_version, load_json, save_json, DurableStore, StoreError};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock};

const DURABLE_PREFIX: &str = "cache:entry:";

/// Bumped when `CacheEntry` changes shape
pub const CACHE_SCHEMA_VERSION: u32 = 1;
pub const CACHE_NAMESPACE: &str = "cache";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Durable tier error: {0}")]
    Store(#[from] StoreError),
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Aggregate weight (serialized bytes) of the memory tier
    pub max_bytes: u64,

    /// TTL when neither the caller nor the key policy provides one
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
        }
    }
}

/// A cached value plus metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: BTreeSet<String>,
    pub size_bytes: u32,
}

impl CacheEntry {
    fn new(key: &str, value: Value, ttl: Option<Duration>, tags: BTreeSet<String>) -> Self {
        let created_at = Utc::now();
        let expires_at = ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok().map(|d| created_at + d));
        let size_bytes = u32::try_from(value.to_string().len()).unwrap_or(u32::MAX);
        Self {
            key: key.to_string(),
            value,
            created_at,
            expires_at,
            tags,
            size_bytes,
        }
    }

    /// Same metadata, different value
    fn replace_value(&self, value: Value) -> Self {
        let size_bytes = u32::try_from(value.to_string().len()).unwrap_or(u32::MAX);
        Self {
            value,
            size_bytes,
            ..self.clone()
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Time left before expiry; `None` = never expires
    fn time_to_live(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Expiry derived from each entry's own deadline
struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &CacheEntry, _created_at: Instant) -> Option<Duration> {
        value.time_to_live()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.time_to_live()
    }
}

/// Options for `set`; unset fields fall back to the key policy
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// (epoch, per-key count). Changes whenever a key is invalidated.
type Generation = (u64, u64);

/// One coalesced fetch; every caller of the same generation awaits it
type Flight<E> = OnceCell<Result<CacheEntry, Arc<E>>>;

/// Tiered cache; the only writer of `cache:*` records
pub struct CacheCoordinator {
    memory: Cache<String, CacheEntry>,
    durable: Arc<dyn DurableStore>,
    config: CacheConfig,

    /// Tags of entries written this session
    tag_index: Mutex<HashMap<String, BTreeSet<String>>>,

    /// Readers share; writers and tag invalidation are exclusive
    gate: RwLock<()>,

    /// Bumped by tag invalidation and `clear`
    epoch: AtomicU64,
    /// Bumped by `invalidate`; reset when the epoch moves
    generations: Mutex<HashMap<String, u64>>,
    /// In-flight fetches by (key, generation), type-erased over the fetch error
    flights: Mutex<HashMap<(String, Generation), Arc<dyn Any + Send + Sync>>>,
    /// Keys the memory tier dropped for size, awaiting durable removal
    evicted: Arc<Mutex<Vec<String>>>,

    hits: AtomicU64,
    misses: AtomicU64,
    durability_degraded: AtomicBool,
}

impl CacheCoordinator {
    pub fn new(durable: Arc<dyn DurableStore>, config: CacheConfig) -> Self {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);

        let memory = Cache::builder()
            .max_capacity(config.max_bytes)
            .weigher(|_key: &String, entry: &CacheEntry| entry.size_bytes.max(1))
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .eviction_listener(move |key: Arc<String>, _entry: CacheEntry, cause: RemovalCause| {
                if cause == RemovalCause::Size {
                    sink.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(key.as_ref().clone());
                }
            })
            .build();

        Self {
            memory,
            durable,
            config,
            tag_index: Mutex::new(HashMap::new()),
            gate: RwLock::new(()),
            epoch: AtomicU64::new(0),
            generations: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            evicted,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            durability_degraded: AtomicBool::new(false),
        }
    }

    /// Discard durable entries written under an older schema
    pub async fn init(&self) -> Result<(), CacheError> {
        let discarded =
            ensure_schema_version(self.durable.as_ref(), CACHE_NAMESPACE, CACHE_SCHEMA_VERSION).await?;
        if discarded {
            log::info!("Cache schema upgraded, durable tier reset");
        }
        Ok(())
    }

    /// Memory tier, then durable tier. Expired values are never returned.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let _guard = self.gate.read().await;
        match self.lookup(key).await {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Full entry including metadata
    pub async fn entry(&self, key: &str) -> Option<CacheEntry> {
        let _guard = self.gate.read().await;
        self.lookup(key).await
    }

    /// Write-through to memory and durable tiers
    pub async fn set(&self, key: &str, value: Value, options: SetOptions) {
        let entry = self.build_entry(key, value, options);
        let _guard = self.gate.write().await;
        self.store(entry).await;
    }

    /// Atomic read-modify-write. `f` sees the live value (if any); returning
    /// `None` leaves the entry untouched. Existing TTL and tags are kept.
    pub async fn update<F>(&self, key: &str, f: F) -> Option<Value>
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let _guard = self.gate.write().await;
        let current = self.lookup(key).await;
        let next = f(current.as_ref().map(|entry| &entry.value))?;

        let entry = match current {
            Some(existing) => existing.replace_value(next.clone()),
            None => self.build_entry(key, next.clone(), SetOptions::default()),
        };
        self.store(entry).await;
        Some(next)
    }

    /// Cached value, or run `fetch` once for all concurrent callers.
    ///
    /// Callers only share a fetch that started after the latest invalidation
    /// of `key`. A fetch overtaken by an invalidation still answers the
    /// callers that joined it, but its value is not cached.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        options: SetOptions,
        fetch: F,
    ) -> Result<Value, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Send + Sync + 'static,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let generation = self.generation(key);
        let flight = self.join_flight::<E>(key, generation);

        let outcome = flight
            .get_or_init(move || async move {
                let value = fetch().await.map_err(Arc::new)?;
                let entry = self.build_entry(key, value, options);

                let _guard = self.gate.write().await;
                if self.generation(key) == generation {
                    self.store(entry.clone()).await;
                } else {
                    log::debug!("Fetch of {} overtaken by invalidation, not cached", key);
                }
                Ok::<_, Arc<E>>(entry)
            })
            .await
            .clone();

        self.leave_flight(key, generation, &flight);
        outcome.map(|entry| entry.value)
    }

    pub async fn invalidate(&self, key: &str) {
        let _guard = self.gate.write().await;
        *self
            .generations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_insert(0) += 1;
        self.remove_everywhere(key).await;
        log::debug!("Cache invalidated: {}", key);
    }

    /// Remove every entry carrying `tag` from all tiers; returns the count
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let _guard = self.gate.write().await;
        // In-flight fetches are not indexed yet; retire all of them
        self.advance_epoch();

        let mut doomed: BTreeSet<String> = {
            let index = self.tag_index.lock().unwrap_or_else(|e| e.into_inner());
            index
                .iter()
                .filter(|(_, tags)| tags.contains(tag))
                .map(|(key, _)| key.clone())
                .collect()
        };

        // Entries persisted by earlier sessions are only known to the durable tier
        for entry in self.durable_entries().await {
            if entry.tags.contains(tag) {
                doomed.insert(entry.key);
            }
        }

        for key in &doomed {
            self.remove_everywhere(key).await;
        }

        log::debug!("Cache tag '{}' invalidated {} entries", tag, doomed.len());
        doomed.len()
    }

    /// Reclaim expired durable entries; memory expiry is handled by moka
    pub async fn purge_expired(&self) -> usize {
        let _guard = self.gate.write().await;
        let now = Utc::now();
        let mut purged = 0;

        for entry in self.durable_entries().await {
            if entry.is_expired(now) {
                self.remove_everywhere(&entry.key).await;
                purged += 1;
            }
        }
        self.memory.run_pending_tasks().await;

        if purged > 0 {
            log::debug!("Cache sweep purged {} expired entries", purged);
        }
        purged
    }

    /// Empty both tiers
    pub async fn clear(&self) {
        let _guard = self.gate.write().await;
        self.advance_epoch();
        self.memory.invalidate_all();
        self.memory.run_pending_tasks().await;

        match self.durable.keys(DURABLE_PREFIX).await {
            Ok(keys) => {
                for key in keys {
                    if let Err(e) = self.durable.remove(&key).await {
                        self.degrade(&format!("remove {}: {}", key, e));
                    }
                }
            }
            Err(e) => self.degrade(&format!("list cache entries: {}", e)),
        }

        self.tag_index.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.evicted.lock().unwrap_or_else(|e| e.into_inner()).clear();
        log::info!("Cache cleared");
    }

    pub fn is_durability_degraded(&self) -> bool {
        self.durability_degraded.load(Ordering::Relaxed)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests > 0 {
            (hits as f64 / total_requests as f64) * 100.0
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            total_requests,
            hit_rate,
            entry_count: self.memory.entry_count(),
            weighted_size: self.memory.weighted_size(),
        }
    }

    /// Reset cache statistics
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------

    fn build_entry(&self, key: &str, value: Value, options: SetOptions) -> CacheEntry {
        let ttl = options
            .ttl
            .or_else(|| keys::default_ttl(key))
            .unwrap_or(self.config.default_ttl);
        let tags: BTreeSet<String> = options
            .tags
            .into_iter()
            .chain(keys::default_tags(key))
            .collect();
        CacheEntry::new(key, value, Some(ttl), tags)
    }

    /// Caller holds the gate (read or write)
    async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let now = Utc::now();

        if let Some(entry) = self.memory.get(key).await {
            if !entry.is_expired(now) {
                return Some(entry);
            }
            self.memory.invalidate(key).await;
        }

        let entry = self.load_durable(key).await?;
        if entry.is_expired(now) {
            return None;
        }

        // Promote to the memory tier
        self.index(&entry);
        self.memory.insert(key.to_string(), entry.clone()).await;
        self.memory.run_pending_tasks().await;
        self.reap_evicted().await;
        Some(entry)
    }

    /// Caller holds the write gate
    async fn store(&self, entry: CacheEntry) {
        self.index(&entry);
        self.persist(&entry).await;
        self.memory.insert(entry.key.clone(), entry).await;
        // Apply size-based eviction now rather than on the next maintenance cycle
        self.memory.run_pending_tasks().await;
        self.reap_evicted().await;
    }

    /// Size eviction deletes the entry, not just its memory copy
    async fn reap_evicted(&self) {
        let keys = std::mem::take(&mut *self.evicted.lock().unwrap_or_else(|e| e.into_inner()));
        for key in keys {
            // Re-admitted since it was evicted
            if self.memory.contains_key(&key) {
                continue;
            }
            self.remove_everywhere(&key).await;
            log::debug!("Cache evicted {} for size", key);
        }
    }

    fn generation(&self, key: &str) -> Generation {
        let generations = self.generations.lock().unwrap_or_else(|e| e.into_inner());
        (
            self.epoch.load(Ordering::SeqCst),
            generations.get(key).copied().unwrap_or(0),
        )
    }

    /// Caller holds the write gate
    fn advance_epoch(&self) {
        let mut generations = self.generations.lock().unwrap_or_else(|e| e.into_inner());
        self.epoch.fetch_add(1, Ordering::SeqCst);
        generations.clear();
    }

    fn join_flight<E: Send + Sync + 'static>(&self, key: &str, generation: Generation) -> Arc<Flight<E>> {
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        let slot = (key.to_string(), generation);

        if let Some(existing) = flights.get(&slot) {
            if let Ok(flight) = Arc::clone(existing).downcast::<Flight<E>>() {
                return flight;
            }
        }

        let flight: Arc<Flight<E>> = Arc::new(OnceCell::new());
        flights.insert(slot, Arc::clone(&flight) as Arc<dyn Any + Send + Sync>);
        flight
    }

    fn leave_flight<E: Send + Sync + 'static>(&self, key: &str, generation: Generation, flight: &Arc<Flight<E>>) {
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        let slot = (key.to_string(), generation);

        let ours = flights
            .get(&slot)
            .is_some_and(|existing| Arc::as_ptr(existing) as *const () == Arc::as_ptr(flight) as *const ());
        if ours {
            flights.remove(&slot);
        }
    }

    fn index(&self, entry: &CacheEntry) {
        let mut index = self.tag_index.lock().unwrap_or_else(|e| e.into_inner());
        index.insert(entry.key.clone(), entry.tags.clone());
    }

    async fn persist(&self, entry: &CacheEntry) {
        let durable_key = format!("{}{}", DURABLE_PREFIX, entry.key);
        if let Err(e) = save_json(self.durable.as_ref(), &durable_key, entry).await {
            self.degrade(&format!("write {}: {}", entry.key, e));
        }
    }

    async fn remove_everywhere(&self, key: &str) {
        self.memory.invalidate(key).await;
        self.tag_index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);

        let durable_key = format!("{}{}", DURABLE_PREFIX, key);
        if let Err(e) = self.durable.remove(&durable_key).await {
            self.degrade(&format!("remove {}: {}", key, e));
        }
    }

    async fn load_durable(&self, key: &str) -> Option<CacheEntry> {
        let durable_key = format!("{}{}", DURABLE_PREFIX, key);
        match load_json::<CacheEntry>(self.durable.as_ref(), &durable_key).await {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Unreadable cache record {}: {}", key, e);
                None
            }
        }
    }

    async fn durable_entries(&self) -> Vec<CacheEntry> {
        let keys = match self.durable.keys(DURABLE_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                self.degrade(&format!("list cache entries: {}", e));
                return Vec::new();
            }
        };

        let mut entries = Vec::with_capacity(keys.len());
        for durable_key in keys {
            if let Some(key) = durable_key.strip_prefix(DURABLE_PREFIX) {
                if let Some(entry) = self.load_durable(key).await {
                    entries.push(entry);
                }
            }
        }
        entries
    }

    fn degrade(&self, message: &str) {
        if !self.durability_degraded.swap(true, Ordering::Relaxed) {
            log::warn!("Cache durable tier degraded: {}", message);
        } else {
            log::debug!("Cache durable tier write failed: {}", message);
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Total cache requests
    pub total_requests: u64,

    /// Cache hit rate (percentage)
    pub hit_rate: f64,

    /// Number of entries in the memory tier
    pub entry_count: u64,

    /// Weighted size of the memory tier
    pub weighted_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache_with(store: MemoryStore) -> CacheCoordinator {
        CacheCoordinator::new(Arc::new(store), CacheConfig::default())
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = cache_with(MemoryStore::new());

        cache.set("userStats:u1", json!({"answered": 5}), SetOptions::default()).await;
        assert_eq!(cache.get("userStats:u1").await, Some(json!({"answered": 5})));
        assert_eq!(cache.get("userStats:u2").await, None);

        let entry = cache.entry("userStats:u1").await.unwrap();
        assert!(entry.tags.contains("userStats:u1"));
        assert!(entry.tags.contains("owner:u1"));
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let cache = cache_with(MemoryStore::new());

        cache
            .set("k", json!(1), SetOptions::ttl(Duration::from_millis(100)))
            .await;
        assert_eq!(cache.get("k").await, Some(json!(1)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_expired_durable_entry_is_absent_in_new_session() {
        let store = MemoryStore::new();
        let first = cache_with(store.clone());
        first
            .set("k", json!(1), SetOptions::ttl(Duration::from_millis(50)))
            .await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = cache_with(store);
        assert_eq!(second.get("k").await, None);
        assert_eq!(second.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_durable_tier_survives_reload() {
        let store = MemoryStore::new();
        {
            let cache = cache_with(store.clone());
            cache.set("userStats:u1", json!({"answered": 2}), SetOptions::default()).await;
        }

        let reloaded = cache_with(store);
        assert_eq!(reloaded.get("userStats:u1").await, Some(json!({"answered": 2})));
        // Promoted into memory
        assert_eq!(reloaded.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_tag_removes_only_tagged() {
        let store = MemoryStore::new();
        let cache = cache_with(store.clone());

        cache.set("a", json!(1), SetOptions::default().tag("t")).await;
        cache.set("b", json!(2), SetOptions::default().tag("t").tag("other")).await;
        cache.set("c", json!(3), SetOptions::default().tag("other")).await;
        cache.set("d", json!(4), SetOptions::default()).await;

        assert_eq!(cache.invalidate_by_tag("t").await, 2);

        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("c").await, Some(json!(3)));
        assert_eq!(cache.get("d").await, Some(json!(4)));
        assert!(store.get("cache:entry:a").await.unwrap().is_none());
        assert!(store.get("cache:entry:c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retagged_key_follows_latest_tags() {
        let cache = cache_with(MemoryStore::new());

        cache.set("a", json!(1), SetOptions::default().tag("t")).await;
        cache.set("a", json!(2), SetOptions::default().tag("u")).await;

        assert_eq!(cache.invalidate_by_tag("t").await, 0);
        assert_eq!(cache.get("a").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_tag_invalidation_reaches_previous_session_entries() {
        let store = MemoryStore::new();
        cache_with(store.clone())
            .set("userStats:u1", json!({}), SetOptions::default())
            .await;

        let cache = cache_with(store);
        assert_eq!(cache.invalidate_by_tag("owner:u1").await, 1);
        assert_eq!(cache.get("userStats:u1").await, None);
    }

    #[tokio::test]
    async fn test_update_keeps_metadata() {
        let cache = cache_with(MemoryStore::new());
        cache.set("userStats:u1", json!({"answered": 1}), SetOptions::default().tag("x")).await;
        let before = cache.entry("userStats:u1").await.unwrap();

        let next = cache
            .update("userStats:u1", |current| {
                let answered = current?.get("answered")?.as_i64()?;
                Some(json!({"answered": answered + 1}))
            })
            .await;
        assert_eq!(next, Some(json!({"answered": 2})));

        let after = cache.entry("userStats:u1").await.unwrap();
        assert_eq!(after.expires_at, before.expires_at);
        assert_eq!(after.tags, before.tags);
    }

    #[tokio::test]
    async fn test_update_absent_is_noop() {
        let cache = cache_with(MemoryStore::new());
        let result = cache.update("userStats:u1", |current| current.cloned()).await;
        assert_eq!(result, None);
        assert_eq!(cache.get("userStats:u1").await, None);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_coalesce() {
        let cache = cache_with(MemoryStore::new());
        let calls = AtomicUsize::new(0);

        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, String>(json!({"remaining_count": 12}))
        };

        let (a, b) = tokio::join!(
            cache.get_or_fetch("remainingCount:u1", SetOptions::default(), fetch),
            cache.get_or_fetch("remainingCount:u1", SetOptions::default(), fetch),
        );

        assert_eq!(a.unwrap(), json!({"remaining_count": 12}));
        assert_eq!(b.unwrap(), json!({"remaining_count": 12}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Now cached: no further fetch
        let c = cache
            .get_or_fetch("remainingCount:u1", SetOptions::default(), fetch)
            .await
            .unwrap();
        assert_eq!(c, json!({"remaining_count": 12}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_is_not_cached() {
        let cache = cache_with(MemoryStore::new());

        let result = cache
            .get_or_fetch("k", SetOptions::default(), || async { Err::<Value, _>("offline".to_string()) })
            .await;
        assert_eq!(result.unwrap_err().as_str(), "offline");
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_size_bound_evicts() {
        let config = CacheConfig {
            max_bytes: 64,
            default_ttl: Duration::from_secs(60),
        };
        let store = MemoryStore::new();
        let cache = CacheCoordinator::new(Arc::new(store.clone()), config);

        // 18 serialized bytes each; at most three fit
        for i in 0..10 {
            cache.set(&format!("k{}", i), json!("0123456789abcdef"), SetOptions::default().tag("t")).await;
        }

        let stats = cache.stats();
        assert!(stats.weighted_size <= 64, "weighted size {}", stats.weighted_size);
        assert!(stats.entry_count < 10);

        // Evicted entries are gone from the durable tier too
        let durable = store.keys("cache:entry:").await.unwrap();
        assert!(durable.len() <= 3, "durable records {:?}", durable);
        assert_eq!(cache.get("k0").await, None);
        assert_eq!(cache.get("k9").await, Some(json!("0123456789abcdef")));
        assert!(cache.invalidate_by_tag("t").await <= 3);
    }

    #[tokio::test]
    async fn test_fetch_after_invalidate_runs_its_own_fetch() {
        let store = MemoryStore::new();
        let cache = Arc::new(cache_with(store.clone()));

        let early = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_fetch("userStats:u1", SetOptions::default(), || async {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Ok::<_, String>(json!({"answered": 5}))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.invalidate("userStats:u1").await;

        let late = cache
            .get_or_fetch("userStats:u1", SetOptions::default(), || async {
                Ok::<_, String>(json!({"answered": 6}))
            })
            .await;
        assert_eq!(late.unwrap(), json!({"answered": 6}));

        // The early caller still gets its answer, but it does not replace the newer one
        assert_eq!(early.await.unwrap().unwrap(), json!({"answered": 5}));
        assert_eq!(cache.get("userStats:u1").await, Some(json!({"answered": 6})));

        let stored: CacheEntry = load_json(&store, "cache:entry:userStats:u1").await.unwrap().unwrap();
        assert_eq!(stored.value, json!({"answered": 6}));
    }

    #[tokio::test]
    async fn test_tag_invalidation_discards_in_flight_fetch() {
        let store = MemoryStore::new();
        let cache = Arc::new(cache_with(store.clone()));

        let early = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_fetch("userStats:u1", SetOptions::default(), || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>(json!({"answered": 5}))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.invalidate_by_tag("owner:u1").await;

        assert_eq!(early.await.unwrap().unwrap(), json!({"answered": 5}));
        assert_eq!(cache.get("userStats:u1").await, None);
        assert!(store.get("cache:entry:userStats:u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let store = MemoryStore::new();
        let cache = cache_with(store.clone());
        cache.set("a", json!(1), SetOptions::default()).await;

        cache.get("a").await;
        cache.get("missing").await;
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 50.0);

        cache.clear().await;
        assert_eq!(cache.get("a").await, None);
        assert!(store.keys("cache:entry:").await.unwrap().is_empty());

        cache.reset_stats();
        assert_eq!(cache.stats().total_requests, 0);
    }
}
