//! # QuizSync
//!
//! Offline operation queue, sync coordinator and tiered cache for the FSRS
//! quiz client. Answers and settings changes are accepted while offline,
//! shown optimistically, and replayed against the backend once connectivity
//! returns.

pub mod cache;
pub mod config;
pub mod db;
pub mod store;
pub mod sync;

use cache::{keys, CacheConfig, CacheCoordinator, CacheError, CacheStats, SetOptions};
use chrono::{DateTime, Utc};
use config::{ConfigError, SyncConfig};
use db::{Database, DbError};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use store::{DurableStore, SqliteStore, StoreError};
use sync::api::{AnswerSubmit, BatchAnswersSubmit, ExamSettingsUpdate, UserSettingsUpdate};
use sync::{
    ApiError, AutoSyncScheduler, ConflictResolver, EnqueueOptions, HandlerRegistry, NetworkMonitor, NetworkStatus,
    Operation, OperationQueue, OperationType, OptimisticUpdate, Priority, QueueError, QueueStats, QueueStatus,
    QuizApiClient, ResourceFetcher, RetryPolicy, SchedulerContext, SchedulerError, SyncCoordinator, SyncEvent,
    SyncReport,
};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Runtime
// ============================================================================

/// Errors raised while wiring or driving the runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Snapshot for status displays and shutdown logging
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub queue: QueueStats,
    pub queue_status: QueueStatus,
    pub network: NetworkStatus,
    pub cache: CacheStats,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub durability_degraded: bool,
}

/// Typed context owning every sync service for one client session
pub struct OfflineRuntime {
    config: SyncConfig,
    cache: Arc<CacheCoordinator>,
    queue: Arc<OperationQueue>,
    network: Arc<NetworkMonitor>,
    coordinator: Arc<SyncCoordinator>,
    scheduler: AutoSyncScheduler,
    events: broadcast::Sender<SyncEvent>,
}

impl OfflineRuntime {
    /// Default stack: SQLite at `config.db_path` and the HTTP backend
    pub async fn connect(config: SyncConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        log::info!("Database path: {:?}", config.db_path);
        let db = Database::new(config.db_path.clone())?;
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::new(Arc::new(db)));

        let api = Arc::new(QuizApiClient::new(&config.api_base_url, config.request_timeout())?);
        let registry = HandlerRegistry::quiz(api.clone());

        Self::init(config, store, registry, api).await
    }

    /// Build all services, rehydrate the queue and start auto-sync
    pub async fn init(
        config: SyncConfig,
        store: Arc<dyn DurableStore>,
        registry: HandlerRegistry,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let cache = Arc::new(CacheCoordinator::new(
            store.clone(),
            CacheConfig {
                max_bytes: config.cache_max_bytes,
                default_ttl: config.cache_default_ttl(),
            },
        ));
        cache.init().await?;

        let registry = Arc::new(registry);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let queue = Arc::new(OperationQueue::new(
            store,
            registry.clone(),
            cache.clone(),
            RetryPolicy::from_config(&config),
            events.clone(),
        ));
        let restored = queue.rehydrate().await?;

        let network = Arc::new(NetworkMonitor::default());
        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            registry,
            cache.clone(),
            network.clone(),
            fetcher.clone(),
            ConflictResolver::new(config.conflict_strategy),
            events.clone(),
        ));

        let scheduler = AutoSyncScheduler::new(
            SchedulerContext {
                coordinator: coordinator.clone(),
                queue: queue.clone(),
                cache: cache.clone(),
                network: network.clone(),
                fetcher,
            },
            config.auto_sync_interval(),
        )?;
        scheduler.start()?;

        log::info!(
            "Offline runtime ready: {} queued operations restored, conflict strategy {}",
            restored,
            config.conflict_strategy.as_str()
        );

        Ok(Self {
            config,
            cache,
            queue,
            network,
            coordinator,
            scheduler,
            events,
        })
    }

    /// Stop auto-sync. Queued work stays persisted for the next session.
    pub fn dispose(&self) {
        if !self.scheduler.is_running() {
            return;
        }
        match self.scheduler.stop() {
            Ok(()) => log::info!("Offline runtime disposed"),
            Err(e) => log::warn!("Failed to stop auto-sync scheduler: {}", e),
        }
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Queue an answer; the user's stats reflect it immediately
    pub async fn submit_answer(&self, answer: AnswerSubmit, rating: Option<u8>) -> Result<String, RuntimeError> {
        let optimistic = OptimisticUpdate::answer_submitted(&answer.user_id, answer.is_correct);
        let options = EnqueueOptions::for_user(answer.user_id.clone())
            .with_priority(Priority::High)
            .with_optimistic(optimistic);

        let mut payload = serde_json::to_value(&answer)?;
        if let (Some(rating), Some(object)) = (rating, payload.as_object_mut()) {
            object.insert("rating".to_string(), Value::from(rating));
        }

        Ok(self.queue.enqueue(OperationType::SubmitAnswer, payload, options).await?)
    }

    /// Queue several answers as one request
    pub async fn submit_answers(&self, batch: BatchAnswersSubmit) -> Result<String, RuntimeError> {
        let answered = batch.answers.len() as i64;
        let correct = batch.answers.iter().filter(|a| a.is_correct).count() as i64;
        let optimistic = OptimisticUpdate::increment(
            keys::user_stats(&batch.user_id),
            [("answered", answered), ("correct", correct)],
        );
        let options = EnqueueOptions::for_user(batch.user_id.clone())
            .with_priority(Priority::High)
            .with_optimistic(optimistic);

        let payload = serde_json::to_value(&batch)?;
        Ok(self.queue.enqueue(OperationType::SubmitAnswersBatch, payload, options).await?)
    }

    /// Queue a profile settings patch; the cached profile is patched at once
    pub async fn update_settings(&self, user_id: &str, settings: UserSettingsUpdate) -> Result<String, RuntimeError> {
        let fields = to_object(&settings)?;
        let mut payload = fields.clone();
        payload.insert("user_id".to_string(), Value::from(user_id));

        let options = EnqueueOptions::for_user(user_id)
            .with_optimistic(OptimisticUpdate::patch(keys::user(user_id), fields));

        Ok(self
            .queue
            .enqueue(OperationType::UpdateSettings, Value::Object(payload), options)
            .await?)
    }

    /// Queue exam date and daily goal
    pub async fn set_exam_settings(&self, user_id: &str, settings: ExamSettingsUpdate) -> Result<String, RuntimeError> {
        let fields = to_object(&settings)?;
        let mut payload = fields.clone();
        payload.insert("user_id".to_string(), Value::from(user_id));

        let options = EnqueueOptions::for_user(user_id)
            .with_optimistic(OptimisticUpdate::patch(keys::exam_settings(user_id), fields));

        Ok(self
            .queue
            .enqueue(OperationType::SetExamSettings, Value::Object(payload), options)
            .await?)
    }

    /// Queue an arbitrary operation
    pub async fn enqueue(
        &self,
        op_type: OperationType,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<String, RuntimeError> {
        Ok(self.queue.enqueue(op_type, payload, options).await?)
    }

    pub async fn failed_operations(&self) -> Vec<Operation> {
        self.queue.failed_operations().await
    }

    /// Put FAILED operations back in line and try them now
    pub async fn retry_failed(&self) -> SyncReport {
        let count = self.queue.retry_failed().await;
        log::info!("Manual retry of {} failed operations", count);
        self.sync_now().await
    }

    pub async fn remove_operation(&self, id: &str) -> Result<Operation, RuntimeError> {
        Ok(self.queue.remove(id).await?)
    }

    // ------------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------------

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).await
    }

    pub async fn set(&self, key: &str, value: Value, options: SetOptions) {
        self.cache.set(key, value, options).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        self.cache.invalidate_by_tag(tag).await
    }

    /// Fetch `key` from the backend if it is not cached
    pub async fn refresh(&self, key: &str) {
        self.coordinator.refresh(key).await;
    }

    // ------------------------------------------------------------------------
    // Sync & connectivity
    // ------------------------------------------------------------------------

    /// Run a drain pass now (skipped when offline or already syncing)
    pub async fn sync_now(&self) -> SyncReport {
        self.coordinator.start_sync().await
    }

    /// Platform connectivity signal
    pub fn set_network_status(&self, status: NetworkStatus) {
        self.network.set_observed(status);
    }

    /// Simulate a connectivity state for `duration`
    pub fn force_network_status(&self, status: NetworkStatus, duration: Duration) {
        self.network.force_status(status, duration);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            queue: self.queue.stats().await,
            queue_status: self.queue.status(),
            network: self.network.status(),
            cache: self.cache.stats(),
            last_sync_at: self.queue.last_sync_at().await,
            durability_degraded: self.queue.is_durability_degraded() || self.cache.is_durability_degraded(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<CacheCoordinator> {
        &self.cache
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &AutoSyncScheduler {
        &self.scheduler
    }
}

impl Drop for OfflineRuntime {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>, RuntimeError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

// ============================================================================
// Application Entry Point
// ============================================================================

#[tokio::main]
pub async fn run() {
    // Load .env file for backend URL and tuning overrides
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            eprintln!("FATAL: Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match OfflineRuntime::connect(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start offline runtime: {}", e);
            eprintln!("FATAL: Offline runtime initialization failed: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Syncing against {} (Ctrl-C to stop)", runtime.config().api_base_url);

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }

    runtime.dispose();
    let stats = runtime.stats().await;
    log::info!(
        "Shutdown: {} pending, {} failed operations; cache hit rate {:.1}%",
        stats.queue.pending_count,
        stats.queue.failed_count,
        stats.cache.hit_rate
    );
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use serde_json::json;
    use store::MemoryStore;

    fn config(server: &Server) -> SyncConfig {
        SyncConfig {
            api_base_url: server.url(),
            request_timeout_secs: 5,
            auto_sync_interval_secs: 3_600,
            ..SyncConfig::default()
        }
    }

    async fn runtime_on(server: &Server, store: MemoryStore) -> OfflineRuntime {
        let config = config(server);
        let api = Arc::new(QuizApiClient::new(&config.api_base_url, config.request_timeout()).unwrap());
        OfflineRuntime::init(config, Arc::new(store), HandlerRegistry::quiz(api.clone()), api)
            .await
            .unwrap()
    }

    fn answer(question_id: i64, is_correct: bool) -> AnswerSubmit {
        AnswerSubmit {
            user_id: "u1".to_string(),
            question_id,
            is_correct,
            timestamp: None,
            response_time: None,
        }
    }

    #[tokio::test]
    async fn test_init_and_dispose() {
        let server = Server::new_async().await;
        let runtime = runtime_on(&server, MemoryStore::new()).await;

        assert!(runtime.scheduler().is_running());
        assert!(runtime.queue().is_empty().await);

        runtime.dispose();
        assert!(!runtime.scheduler().is_running());
        // Idempotent
        runtime.dispose();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let server = Server::new_async().await;
        let mut config = config(&server);
        config.base_delay_ms = 10_000;
        config.max_delay_ms = 1_000;

        let api = Arc::new(QuizApiClient::new(&config.api_base_url, config.request_timeout()).unwrap());
        let result =
            OfflineRuntime::init(config, Arc::new(MemoryStore::new()), HandlerRegistry::quiz(api.clone()), api).await;
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[tokio::test]
    async fn test_submit_answer_is_optimistic_and_queued() {
        let server = Server::new_async().await;
        let runtime = runtime_on(&server, MemoryStore::new()).await;
        runtime
            .set("userStats:u1", json!({"answered": 4, "correct": 2}), SetOptions::default())
            .await;

        let id = runtime.submit_answer(answer(7, true), Some(3)).await.unwrap();

        assert_eq!(runtime.get("userStats:u1").await, Some(json!({"answered": 5, "correct": 3})));
        let op = runtime.queue().get(&id).await.unwrap();
        assert_eq!(op.priority, Priority::High);
        assert_eq!(op.payload["rating"], 3);
        assert_eq!(op.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_update_settings_patches_profile() {
        let server = Server::new_async().await;
        let runtime = runtime_on(&server, MemoryStore::new()).await;
        runtime
            .set("user:u1", json!({"id": "u1", "ui_language": "en"}), SetOptions::default())
            .await;

        let settings = UserSettingsUpdate {
            ui_language: Some("de".to_string()),
            ..UserSettingsUpdate::default()
        };
        let id = runtime.update_settings("u1", settings).await.unwrap();

        assert_eq!(runtime.get("user:u1").await, Some(json!({"id": "u1", "ui_language": "de"})));
        let op = runtime.queue().get(&id).await.unwrap();
        assert_eq!(op.payload, json!({"user_id": "u1", "ui_language": "de"}));
    }

    #[tokio::test]
    async fn test_restart_restores_queue_and_cache() {
        let server = Server::new_async().await;
        let store = MemoryStore::new();

        let first = runtime_on(&server, store.clone()).await;
        first
            .set("userStats:u1", json!({"answered": 0, "correct": 0}), SetOptions::default())
            .await;
        let id = first.submit_answer(answer(1, false), None).await.unwrap();
        first.dispose();
        drop(first);

        let second = runtime_on(&server, store).await;
        let ops = second.queue().operations().await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, id);
        // The optimistic value was persisted, not re-applied
        assert_eq!(second.get("userStats:u1").await, Some(json!({"answered": 1, "correct": 0})));
    }

    #[tokio::test]
    async fn test_sync_now_converges_on_server_truth() {
        let mut server = Server::new_async().await;
        let submit = server
            .mock("POST", "/user_progress/submit_answer")
            .with_status(200)
            .with_body(r#"{"question_id": 7, "reps": 1}"#)
            .create_async()
            .await;
        let _stats = server
            .mock("GET", "/users/u1/stats")
            .with_status(200)
            .with_body(r#"{"answered": 10, "correct": 8}"#)
            .create_async()
            .await;
        let _progress = server
            .mock("GET", "/users/u1/daily-progress")
            .with_status(200)
            .with_body(r#"{"answered_today": 3}"#)
            .create_async()
            .await;

        let runtime = runtime_on(&server, MemoryStore::new()).await;
        runtime
            .set("userStats:u1", json!({"answered": 0, "correct": 0}), SetOptions::default())
            .await;
        runtime.submit_answer(answer(7, true), None).await.unwrap();

        let report = runtime.sync_now().await;
        assert_eq!(report.succeeded, 1);
        assert!(runtime.queue().is_empty().await);
        assert_eq!(runtime.get("userStats:u1").await, Some(json!({"answered": 10, "correct": 8})));
        assert_eq!(runtime.get("dailyProgress:u1").await, Some(json!({"answered_today": 3})));

        let stats = runtime.stats().await;
        assert_eq!(stats.queue_status, QueueStatus::Idle);
        assert!(stats.last_sync_at.is_some());
        submit.assert_async().await;
    }

    #[tokio::test]
    async fn test_connect_with_sqlite_survives_restart() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&server);
        config.db_path = dir.path().join("quizsync.db");

        let first = OfflineRuntime::connect(config.clone()).await.unwrap();
        first.force_network_status(NetworkStatus::Offline, Duration::from_secs(60));
        first.submit_answer(answer(3, true), Some(2)).await.unwrap();
        first.dispose();
        drop(first);

        let second = OfflineRuntime::connect(config).await.unwrap();
        let ops = second.queue().operations().await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].payload["question_id"], 3);
        assert_eq!(ops[0].payload["rating"], 2);
    }
}
