//! Sync Coordinator - drains the operation queue against the handlers
//!
//! One pass at a time, one operation at a time. After a successful call the
//! server value is reconciled with the optimistic one, affected cache tags
//! are invalidated, and dependent resources are re-fetched.

use super::api::{Resource, ResourceFetcher};
use super::conflict::ConflictResolver;
use super::handlers::{HandlerRegistry, OperationHandler};
use super::models::{FailureOutcome, Operation, OperationError, QueueStatus, SyncEvent, SyncReport};
use super::optimistic::OptimisticUpdate;
use super::network::NetworkMonitor;
use super::queue::OperationQueue;
use crate::cache::{keys, CacheCoordinator, SetOptions};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Result of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Succeeded,
    Retrying,
    Failed,
}

pub struct SyncCoordinator {
    queue: Arc<OperationQueue>,
    registry: Arc<HandlerRegistry>,
    cache: Arc<CacheCoordinator>,
    network: Arc<NetworkMonitor>,
    fetcher: Arc<dyn ResourceFetcher>,
    resolver: ConflictResolver,
    events: broadcast::Sender<SyncEvent>,

    /// Held for the duration of a pass
    drain: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<OperationQueue>,
        registry: Arc<HandlerRegistry>,
        cache: Arc<CacheCoordinator>,
        network: Arc<NetworkMonitor>,
        fetcher: Arc<dyn ResourceFetcher>,
        resolver: ConflictResolver,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            queue,
            registry,
            cache,
            network,
            fetcher,
            resolver,
            events,
            drain: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.queue.status() == QueueStatus::Syncing
    }

    /// Run one drain pass. No-op when a pass is already running or offline.
    pub async fn start_sync(&self) -> SyncReport {
        let _pass = match self.drain.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::debug!("Sync pass already running, skipping");
                return SyncReport::skipped();
            }
        };

        if !self.network.is_online() {
            log::debug!("Offline, sync pass skipped");
            return SyncReport::skipped();
        }

        self.queue.set_status(QueueStatus::Syncing);
        log::info!("Sync pass started");

        let mut report = SyncReport::default();
        let mut attempted = HashSet::new();

        while let Some(op) = self.queue.dequeue_next(&attempted).await {
            attempted.insert(op.id.clone());
            report.attempted += 1;

            match self.process(&op).await {
                Attempt::Succeeded => report.succeeded += 1,
                Attempt::Retrying => report.retried += 1,
                Attempt::Failed => report.failed += 1,
            }

            if !self.network.is_online() {
                log::info!("Connectivity lost, ending sync pass early");
                break;
            }
        }

        let status = if report.failed > 0 {
            QueueStatus::Error
        } else {
            QueueStatus::Idle
        };
        self.queue.set_status(status);
        self.queue.record_sync(Utc::now()).await;

        log::info!(
            "Sync pass completed: attempted={}, succeeded={}, retried={}, failed={}",
            report.attempted, report.succeeded, report.retried, report.failed
        );
        self.emit(SyncEvent::PassCompleted(report.clone()));
        report
    }

    async fn process(&self, op: &Operation) -> Attempt {
        let handler = match self.registry.get(op.op_type) {
            Ok(handler) => handler.clone(),
            Err(error) => return self.fail(op, error).await,
        };

        // Never worth a network round trip
        if let Err(error) = handler.validate(&op.payload) {
            return self.fail(op, error).await;
        }

        log::debug!("Syncing {} operation {}", op.op_type, op.id);
        match handler.execute(&op.payload).await {
            Ok(server_value) => {
                self.network.report_success();
                self.complete(op, handler.as_ref(), server_value).await;
                Attempt::Succeeded
            }
            Err(e) => {
                let error = e.classify();
                if error.is_network() {
                    self.network.report_network_failure();
                }
                self.fail(op, error).await
            }
        }
    }

    async fn fail(&self, op: &Operation, error: OperationError) -> Attempt {
        match self.queue.mark_failed(&op.id, &error).await {
            Ok(FailureOutcome::Retrying { attempt, .. }) => {
                self.emit(SyncEvent::OperationRetrying {
                    id: op.id.clone(),
                    op_type: op.op_type,
                    attempt,
                    error,
                });
                Attempt::Retrying
            }
            Ok(FailureOutcome::Failed) => {
                self.emit(SyncEvent::OperationFailed {
                    id: op.id.clone(),
                    op_type: op.op_type,
                    error,
                });
                Attempt::Failed
            }
            Err(e) => {
                log::warn!("Could not record failure of {}: {}", op.id, e);
                Attempt::Failed
            }
        }
    }

    /// Success path: reconcile, invalidate, refresh
    async fn complete(&self, op: &Operation, handler: &dyn OperationHandler, server_value: Value) {
        if let Err(e) = self.queue.mark_succeeded(&op.id).await {
            log::warn!("Synced operation {} vanished from the queue: {}", op.id, e);
        }

        let entity_key = handler.entity_key(&op.payload);
        let local = match entity_key.as_deref() {
            Some(key) => self.local_value(key).await,
            None => None,
        };

        for tag in handler.invalidation_tags(&op.payload) {
            self.cache.invalidate_by_tag(&tag).await;
        }

        if let Some(key) = entity_key.as_deref() {
            if server_value.is_object() {
                let resolution = self.resolver.resolve(op.op_type, local.as_ref(), &server_value);
                if resolution.fell_back {
                    self.emit(SyncEvent::ConflictFallback {
                        op_type: op.op_type,
                        key: key.to_string(),
                    });
                }
                self.cache.set(key, resolution.value, SetOptions::default()).await;
                self.queue.reapply_pending(key).await;
            } else {
                log::debug!("No entity in response to {}, leaving {} to refresh", op.id, key);
            }
        }

        for key in handler.refresh_keys(&op.payload) {
            self.refresh(&key).await;
        }

        self.emit(SyncEvent::OperationSucceeded {
            id: op.id.clone(),
            op_type: op.op_type,
            server_value,
        });
    }

    /// Cached value with the effects of still-pending operations removed
    async fn local_value(&self, key: &str) -> Option<Value> {
        let cached = self.cache.get(key).await?;
        let pending = self.queue.pending_transforms_for(key).await;
        Some(without_pending(cached, &pending))
    }

    /// Re-fetch `key` if it was dropped, then rebase pending optimistic updates
    pub async fn refresh(&self, key: &str) {
        let profile = match keys::split(key) {
            Some((keys::REMAINING_COUNT, user_id)) => self.cache.get(&keys::user(user_id)).await,
            _ => None,
        };

        let Some(resource) = Resource::from_key(key, profile.as_ref()) else {
            log::debug!("No refresh source for {}, left for the next read", key);
            return;
        };

        let fetcher = self.fetcher.clone();
        let mut fetched = false;
        let result = self
            .cache
            .get_or_fetch(key, SetOptions::default(), || {
                fetched = true;
                async move { fetcher.fetch(&resource).await }
            })
            .await;

        match result {
            Ok(_) if fetched => {
                let rebased = self.queue.reapply_pending(key).await;
                log::debug!("Refreshed {} ({} pending updates re-applied)", key, rebased);
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("Refresh of {} failed: {}", key, e);
                if e.classify().is_network() {
                    self.network.report_network_failure();
                }
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Undo applied transforms, newest first
fn without_pending(value: Value, pending: &[OptimisticUpdate]) -> Value {
    pending
        .iter()
        .rev()
        .filter(|update| update.applied)
        .fold(value, |current, update| {
            update.transform.rollback(Some(&current)).unwrap_or(current)
        })
}
