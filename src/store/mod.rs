//! Durable Store - key-value persistence over pluggable backends
//!
//! The queue and the cache persist JSON records through this trait. Keys are
//! namespaced (`queue:*`, `cache:*`) and every namespace carries a schema
//! version tag so incompatible records can be dropped after an upgrade.

use crate::db::{Database, DbError, DbResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Key-value persistence backend
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Keys beginning with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Read and decode a JSON record
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON record
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn DurableStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw).await
}

/// Drop every record under `namespace` when its stored version differs
///
/// Returns `true` when records were discarded.
pub async fn ensure_schema_version(
    store: &dyn DurableStore,
    namespace: &str,
    version: u32,
) -> Result<bool, StoreError> {
    let version_key = format!("{}:schema_version", namespace);
    let stored: Option<u32> = match load_json(store, &version_key).await {
        Ok(v) => v,
        // An unreadable tag is as good as a mismatch
        Err(StoreError::Serialization(_)) => Some(0),
        Err(e) => return Err(e),
    };

    if stored == Some(version) {
        return Ok(false);
    }

    let prefix = format!("{}:", namespace);
    let stale = store.keys(&prefix).await?;
    let discarded = stale.iter().filter(|k| **k != version_key).count();
    for key in stale {
        store.remove(&key).await?;
    }
    save_json(store, &version_key, &version).await?;

    if stored.is_some() {
        log::warn!(
            "Schema version changed for '{}' ({:?} -> {}), discarded {} records",
            namespace, stored, version, discarded
        );
    }

    Ok(stored.is_some() && discarded > 0)
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Process-local store; survives only as long as the value (or its clones)
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

// ============================================================================
// SQLite backend
// ============================================================================

/// Durable store on the pooled SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// rusqlite and the r2d2 pool block, so run the call on the blocking pool
    async fn blocking<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        match tokio::task::spawn_blocking(move || call(&db)).await {
            Ok(result) => Ok(result?),
            Err(e) => Err(StoreError::Unavailable(format!("database task failed: {}", e))),
        }
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.blocking(move |db| db.kv_get(&key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.blocking(move |db| db.kv_set(&key, &value)).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.blocking(move |db| db.kv_remove(&key).map(|_| ())).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.to_string();
        self.blocking(move |db| db.kv_keys(&prefix)).await
    }
}
