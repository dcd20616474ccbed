//! Operation Queue - durable, priority-aware queue of pending mutations
//!
//! Operations are enqueued while offline (or online) and drained by the
//! sync coordinator. Every state change is written to the durable store
//! before the call returns, so a restart resumes where the queue left off.
//!
//! Features:
//! - Priority, then FIFO ordering, with per-(user, type) serialization
//! - Deduplication of equivalent PENDING operations (last payload wins)
//! - Exponential backoff retry policy with a per-operation retry budget
//! - Optimistic cache updates applied on enqueue, rolled back on failure
//! - Crash recovery: SYNCING operations revert to PENDING on rehydrate

use super::handlers::HandlerRegistry;
use super::models::{
    EnqueueOptions, FailureOutcome, Operation, OperationError, OperationStatus, OperationType, QueueStats,
    QueueStatus, SyncEvent,
};
use super::optimistic::OptimisticUpdate;
use crate::cache::CacheCoordinator;
use crate::config::SyncConfig;
use crate::store::{ensure_schema_version, load_json, save_json, DurableStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};

// ============================================================================
// Constants
// ============================================================================

const OP_PREFIX: &str = "queue:op:";
const META_KEY: &str = "queue:meta";

pub const QUEUE_NAMESPACE: &str = "queue";

/// Bumped when `Operation` changes shape
pub const QUEUE_SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Retry Policy
// ============================================================================

/// Retry budget and exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// Delay before retry number `retry` (1-based): `min(base * 2^(retry-1), max)`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueMeta {
    next_seq: u64,
    last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    /// Ordered by `seq`
    ops: Vec<Operation>,
    meta: QueueMeta,
}

impl QueueState {
    fn position(&self, id: &str) -> Option<usize> {
        self.ops.iter().position(|op| op.id == id)
    }
}

/// Durable operation queue for one client session
pub struct OperationQueue {
    store: Arc<dyn DurableStore>,
    registry: Arc<HandlerRegistry>,
    cache: Arc<CacheCoordinator>,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
    status_tx: watch::Sender<QueueStatus>,
    events: broadcast::Sender<SyncEvent>,
    durability_degraded: AtomicBool,
}

impl OperationQueue {
    pub fn new(
        store: Arc<dyn DurableStore>,
        registry: Arc<HandlerRegistry>,
        cache: Arc<CacheCoordinator>,
        policy: RetryPolicy,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let (status_tx, _rx) = watch::channel(QueueStatus::Idle);
        Self {
            store,
            registry,
            cache,
            policy,
            state: Mutex::new(QueueState::default()),
            status_tx,
            events,
            durability_degraded: AtomicBool::new(false),
        }
    }

    /// Load persisted operations; SYNCING ones revert to PENDING
    pub async fn rehydrate(&self) -> Result<usize, QueueError> {
        ensure_schema_version(self.store.as_ref(), QUEUE_NAMESPACE, QUEUE_SCHEMA_VERSION).await?;

        let mut meta: QueueMeta = match load_json(self.store.as_ref(), META_KEY).await {
            Ok(meta) => meta.unwrap_or_default(),
            Err(StoreError::Serialization(e)) => {
                log::warn!("Unreadable queue metadata, starting fresh: {}", e);
                QueueMeta::default()
            }
            Err(e) => return Err(e.into()),
        };

        let mut ops = Vec::new();
        for key in self.store.keys(OP_PREFIX).await? {
            match load_json::<Operation>(self.store.as_ref(), &key).await {
                Ok(Some(op)) => ops.push(op),
                Ok(None) => {}
                Err(StoreError::Serialization(e)) => {
                    log::warn!("Dropping unreadable queued operation {}: {}", key, e);
                    self.store.remove(&key).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        ops.sort_by_key(|op| op.seq);

        let mut recovered = 0;
        for op in ops.iter_mut().filter(|op| op.status == OperationStatus::Syncing) {
            // A previous in-flight attempt may or may not have landed; retry it
            op.status = OperationStatus::Pending;
            op.updated_at = Utc::now();
            self.persist_op(op).await;
            recovered += 1;
        }

        if let Some(max_seq) = ops.iter().map(|op| op.seq).max() {
            meta.next_seq = meta.next_seq.max(max_seq + 1);
        }

        let count = ops.len();
        let mut state = self.state.lock().await;
        state.ops = ops;
        state.meta = meta;
        drop(state);

        log::info!(
            "Operation queue rehydrated: {} operations ({} recovered from SYNCING)",
            count, recovered
        );
        Ok(count)
    }

    /// Validate, coalesce, persist and apply the optimistic update
    pub async fn enqueue(
        &self,
        op_type: OperationType,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let handler = self.registry.get(op_type)?;
        handler.validate(&payload)?;
        let dedup_key = handler.dedup_key(&payload);

        let now = Utc::now();
        let mut state = self.state.lock().await;

        if let Some(key) = dedup_key.as_deref() {
            let existing = state.ops.iter_mut().find(|op| {
                op.status == OperationStatus::Pending
                    && op.op_type == op_type
                    && op.dedup_key.as_deref() == Some(key)
            });

            if let Some(existing) = existing {
                if let Some(previous) = existing.optimistic.take() {
                    self.rollback(previous).await;
                }
                existing.payload = payload;
                existing.priority = existing.priority.max(options.priority);
                existing.updated_at = now;
                existing.optimistic = match options.optimistic {
                    Some(update) => Some(self.apply(update).await),
                    None => None,
                };

                let id = existing.id.clone();
                let snapshot = existing.clone();
                drop(state);

                self.persist_op(&snapshot).await;
                log::debug!("Coalesced {} into pending operation {}", op_type, id);
                return Ok(id);
            }
        }

        let user_id = options
            .user_id
            .or_else(|| payload.get("user_id").and_then(Value::as_str).map(str::to_string));

        let optimistic = match options.optimistic {
            Some(update) => Some(self.apply(update).await),
            None => None,
        };

        let seq = state.meta.next_seq;
        state.meta.next_seq += 1;

        let op = Operation {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            payload,
            priority: options.priority,
            status: OperationStatus::Pending,
            seq,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.policy.max_retries),
            last_error: None,
            next_attempt_at: None,
            user_id,
            dedup_key,
            optimistic,
        };
        let id = op.id.clone();
        state.ops.push(op.clone());
        let meta = state.meta.clone();
        drop(state);

        self.persist_op(&op).await;
        self.persist_meta(&meta).await;

        log::debug!("Enqueued {} operation {} (priority {:?})", op_type, id, op.priority);
        Ok(id)
    }

    /// Next operation to attempt, marked SYNCING
    ///
    /// Only the oldest active operation of each (user, type) group is
    /// eligible; it must be PENDING, due, and not in `exclude`.
    pub async fn dequeue_next(&self, exclude: &HashSet<String>) -> Option<Operation> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let mut heads: HashMap<(Option<&str>, OperationType), usize> = HashMap::new();
        for (index, op) in state.ops.iter().enumerate() {
            if op.status != OperationStatus::Failed {
                heads.entry(op.ordering_group()).or_insert(index);
            }
        }

        let index = heads
            .into_values()
            .filter(|&index| {
                let op = &state.ops[index];
                op.status == OperationStatus::Pending && op.is_due(now) && !exclude.contains(&op.id)
            })
            .min_by_key(|&index| state.ops[index].drain_order())?;

        let op = &mut state.ops[index];
        op.status = OperationStatus::Syncing;
        op.updated_at = now;
        let snapshot = op.clone();
        drop(state);

        self.persist_op(&snapshot).await;
        Some(snapshot)
    }

    /// Remove a synced operation
    pub async fn mark_succeeded(&self, id: &str) -> Result<Operation, QueueError> {
        let mut state = self.state.lock().await;
        let index = state.position(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let op = state.ops.remove(index);
        drop(state);

        self.remove_record(id).await;
        log::debug!("Operation {} ({}) synced", id, op.op_type);
        Ok(op)
    }

    /// Record a failed attempt: reschedule with backoff, or go terminal
    ///
    /// Non-retryable errors are terminal immediately without consuming a
    /// retry. Terminal failure rolls back the optimistic update.
    pub async fn mark_failed(&self, id: &str, error: &OperationError) -> Result<FailureOutcome, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let index = state.position(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let op = &mut state.ops[index];

        op.last_error = Some(error.to_string());
        op.updated_at = now;

        if error.is_retryable() {
            op.retry_count += 1;
            if op.retry_count <= op.max_retries {
                let delay = self.policy.delay_for(op.retry_count);
                op.status = OperationStatus::Pending;
                op.next_attempt_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay));

                let attempt = op.retry_count;
                log::info!(
                    "Operation {} will retry in {:?} (retry {}/{}): {}",
                    id, delay, attempt, op.max_retries, error
                );
                let snapshot = op.clone();
                drop(state);

                self.persist_op(&snapshot).await;
                return Ok(FailureOutcome::Retrying { attempt, delay });
            }
        }

        op.status = OperationStatus::Failed;
        op.next_attempt_at = None;
        log::warn!(
            "Operation {} ({}) failed after {} retries: {}",
            id, op.op_type, op.retry_count, error
        );

        if let Some(update) = op.optimistic.take() {
            op.optimistic = Some(self.rollback(update).await);
        }
        let snapshot = state.ops[index].clone();
        drop(state);

        self.persist_op(&snapshot).await;
        Ok(FailureOutcome::Failed)
    }

    /// FAILED operations kept for inspection / manual retry
    pub async fn failed_operations(&self) -> Vec<Operation> {
        let state = self.state.lock().await;
        state
            .ops
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .cloned()
            .collect()
    }

    /// Move every FAILED operation back to PENDING with a fresh retry budget
    pub async fn retry_failed(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut revived = Vec::new();

        for op in state.ops.iter_mut().filter(|op| op.status == OperationStatus::Failed) {
            op.status = OperationStatus::Pending;
            op.retry_count = 0;
            op.next_attempt_at = None;
            op.last_error = None;
            op.updated_at = now;
            if let Some(update) = op.optimistic.take() {
                op.optimistic = Some(self.apply(update).await);
            }
            revived.push(op.clone());
        }
        drop(state);

        for op in &revived {
            self.persist_op(op).await;
        }
        if !revived.is_empty() {
            log::info!("Requeued {} failed operations", revived.len());
        }
        revived.len()
    }

    /// Drop one operation, undoing its optimistic effect
    pub async fn remove(&self, id: &str) -> Result<Operation, QueueError> {
        let mut state = self.state.lock().await;
        let index = state.position(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let mut op = state.ops.remove(index);
        if let Some(update) = op.optimistic.take() {
            op.optimistic = Some(self.rollback(update).await);
        }
        drop(state);

        self.remove_record(id).await;
        Ok(op)
    }

    /// Empty the queue. Optimistic cache effects are left in place.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        let ids: Vec<String> = state.ops.drain(..).map(|op| op.id).collect();
        drop(state);

        for id in &ids {
            self.remove_record(id).await;
        }
        log::info!("Operation queue cleared ({} operations)", ids.len());
    }

    /// Optimistic updates of PENDING operations targeting `cache_key`, in enqueue order
    pub async fn pending_transforms_for(&self, cache_key: &str) -> Vec<OptimisticUpdate> {
        let state = self.state.lock().await;
        state
            .ops
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .filter_map(|op| op.optimistic.clone())
            .filter(|update| update.cache_key == cache_key)
            .collect()
    }

    /// Re-apply PENDING transforms after `cache_key` was replaced with server data
    pub async fn reapply_pending(&self, cache_key: &str) -> usize {
        let mut state = self.state.lock().await;
        let mut touched = Vec::new();

        for op in state.ops.iter_mut().filter(|op| op.status == OperationStatus::Pending) {
            let targets_key = op.optimistic.as_ref().is_some_and(|u| u.cache_key == cache_key);
            if !targets_key {
                continue;
            }
            if let Some(update) = op.optimistic.take() {
                op.optimistic = Some(self.apply(update).await);
                touched.push(op.clone());
            }
        }
        drop(state);

        for op in &touched {
            self.persist_op(op).await;
        }
        touched.len()
    }

    pub async fn get(&self, id: &str) -> Option<Operation> {
        let state = self.state.lock().await;
        state.ops.iter().find(|op| op.id == id).cloned()
    }

    /// All operations in enqueue order
    pub async fn operations(&self) -> Vec<Operation> {
        self.state.lock().await.ops.clone()
    }

    /// Get queue statistics
    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let count = |status: OperationStatus| state.ops.iter().filter(|op| op.status == status).count();

        QueueStats {
            pending_count: count(OperationStatus::Pending),
            syncing_count: count(OperationStatus::Syncing),
            failed_count: count(OperationStatus::Failed),
            total_count: state.ops.len(),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.ops.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// PENDING or SYNCING operations exist
    pub async fn has_active(&self) -> bool {
        let state = self.state.lock().await;
        state.ops.iter().any(|op| op.status != OperationStatus::Failed)
    }

    pub fn status(&self) -> QueueStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<QueueStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn set_status(&self, status: QueueStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            log::debug!("Queue status: {} -> {}", current.as_str(), status.as_str());
            *current = status;
            true
        });
    }

    pub async fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.meta.last_sync_at
    }

    pub(crate) async fn record_sync(&self, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.meta.last_sync_at = Some(at);
        let meta = state.meta.clone();
        drop(state);

        self.persist_meta(&meta).await;
    }

    pub fn is_durability_degraded(&self) -> bool {
        self.durability_degraded.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Optimistic updates
    // ------------------------------------------------------------------------

    async fn apply(&self, mut update: OptimisticUpdate) -> OptimisticUpdate {
        let mut transform = update.transform.clone();
        let written = self
            .cache
            .update(&update.cache_key, |current| transform.apply(current))
            .await;

        update.transform = transform;
        update.applied = written.is_some();
        update
    }

    async fn rollback(&self, mut update: OptimisticUpdate) -> OptimisticUpdate {
        if update.applied {
            let transform = &update.transform;
            self.cache
                .update(&update.cache_key, |current| transform.rollback(current))
                .await;
            update.applied = false;
            log::debug!("Rolled back optimistic update on {}", update.cache_key);
        }
        update
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    async fn persist_op(&self, op: &Operation) {
        let key = format!("{}{}", OP_PREFIX, op.id);
        if let Err(e) = save_json(self.store.as_ref(), &key, op).await {
            self.degrade(format!("write operation {}: {}", op.id, e));
        }
    }

    async fn persist_meta(&self, meta: &QueueMeta) {
        if let Err(e) = save_json(self.store.as_ref(), META_KEY, meta).await {
            self.degrade(format!("write queue metadata: {}", e));
        }
    }

    async fn remove_record(&self, id: &str) {
        let key = format!("{}{}", OP_PREFIX, id);
        if let Err(e) = self.store.remove(&key).await {
            self.degrade(format!("remove operation {}: {}", id, e));
        }
    }

    /// In-memory state stays authoritative; durability is best effort from here
    fn degrade(&self, message: String) {
        self.durability_degraded.store(true, Ordering::Relaxed);
        log::warn!("Queue persistence failed: {}", message);
        let _ = self.events.send(SyncEvent::PersistenceDegraded { message });
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Operation rejected: {0}")]
    Rejected(#[from] OperationError),

    #[error("Operation not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// Tests
// ============================================================================
