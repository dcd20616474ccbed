//! Auto-Sync Scheduler
//!
//! One Tokio task with one interval drives every background check. Each
//! tick it probes connectivity when offline, sweeps expired cache entries,
//! and starts a sync pass when online, not already syncing, and work is
//! queued. An ONLINE transition wakes it immediately.
//!
//! Stopping the scheduler only prevents new passes; a running pass finishes.

use super::api::ResourceFetcher;
use super::coordinator::SyncCoordinator;
use super::models::{NetworkStatus, QueueStatus};
use super::network::NetworkMonitor;
use super::queue::OperationQueue;
use crate::cache::CacheCoordinator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MIN_INTERVAL: Duration = Duration::from_millis(10);
const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

/// Everything a tick touches
#[derive(Clone)]
pub struct SchedulerContext {
    pub coordinator: Arc<SyncCoordinator>,
    pub queue: Arc<OperationQueue>,
    pub cache: Arc<CacheCoordinator>,
    pub network: Arc<NetworkMonitor>,
    pub fetcher: Arc<dyn ResourceFetcher>,
}

/// Background scheduler for automatic sync passes
#[derive(Clone)]
pub struct AutoSyncScheduler {
    context: SchedulerContext,
    interval: Duration,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

impl AutoSyncScheduler {
    pub fn new(context: SchedulerContext, interval: Duration) -> Result<Self, SchedulerError> {
        if !(MIN_INTERVAL..=MAX_INTERVAL).contains(&interval) {
            return Err(SchedulerError::InvalidInterval(format!(
                "Interval must be {:?}-{:?}, got {:?}",
                MIN_INTERVAL, MAX_INTERVAL, interval
            )));
        }

        Ok(Self {
            context,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start background scheduler task
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let context = self.context.clone();
        let running = self.running.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            Self::scheduler_loop(context, running, interval).await;
        });

        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        log::info!("Auto-sync scheduler started (interval: {:?})", interval);
        Ok(())
    }

    /// Stop background scheduler task
    ///
    /// A pass already in flight is left to finish on its own task.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(handle) = self.task_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }

        log::info!("Auto-sync scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One scheduler check; also used by the loop
    pub async fn tick(context: &SchedulerContext) {
        if !context.network.is_online() {
            context.network.probe(context.fetcher.as_ref()).await;
        }

        context.cache.purge_expired().await;

        let idle = context.queue.status() != QueueStatus::Syncing;
        if context.network.is_online() && idle && context.queue.has_active().await {
            Self::spawn_pass(context);
        }
    }

    /// Passes run on their own task so `stop` never cuts one short
    fn spawn_pass(context: &SchedulerContext) {
        let coordinator = context.coordinator.clone();
        tokio::spawn(async move {
            let report = coordinator.start_sync().await;
            if report.failed > 0 {
                log::warn!("Background sync pass had {} terminal failures", report.failed);
            }
        });
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(context: SchedulerContext, running: Arc<AtomicBool>, period: Duration) {
        // First check one period after start; ONLINE transitions still wake early
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut network = context.network.subscribe();

        log::debug!("Scheduler loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *network.borrow_and_update();
                    if status != NetworkStatus::Online {
                        continue;
                    }
                    log::info!("Back online, triggering sync");
                }
            }

            if !running.load(Ordering::SeqCst) {
                break;
            }

            Self::tick(&context).await;
        }

        log::debug!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::store::MemoryStore;
    use crate::sync::api::{ApiError, Resource};
    use crate::sync::conflict::ConflictResolver;
    use crate::sync::handlers::HandlerRegistry;
    use crate::sync::queue::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::broadcast;

    struct NullFetcher;

    #[async_trait]
    impl ResourceFetcher for NullFetcher {
        async fn fetch(&self, _resource: &Resource) -> Result<Value, ApiError> {
            Ok(Value::Null)
        }

        async fn health(&self) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn context() -> SchedulerContext {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CacheCoordinator::new(store.clone(), CacheConfig::default()));
        let registry = Arc::new(HandlerRegistry::new(Vec::new()));
        let (events, _) = broadcast::channel(16);
        let queue = Arc::new(OperationQueue::new(
            store,
            registry.clone(),
            cache.clone(),
            RetryPolicy::default(),
            events.clone(),
        ));
        let network = Arc::new(NetworkMonitor::default());
        let fetcher: Arc<dyn ResourceFetcher> = Arc::new(NullFetcher);
        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            registry,
            cache.clone(),
            network.clone(),
            fetcher.clone(),
            ConflictResolver::default(),
            events,
        ));

        SchedulerContext {
            coordinator,
            queue,
            cache,
            network,
            fetcher,
        }
    }

    #[tokio::test]
    async fn test_scheduler_new() {
        let scheduler = AutoSyncScheduler::new(context(), Duration::from_secs(30)).unwrap();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.interval(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_invalid_interval() {
        let result = AutoSyncScheduler::new(context(), Duration::ZERO);
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));

        let result = AutoSyncScheduler::new(context(), Duration::from_secs(100_000));
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let scheduler = AutoSyncScheduler::new(context(), Duration::from_secs(30)).unwrap();

        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyRunning)));

        scheduler.stop().unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_stop_not_running() {
        let scheduler = AutoSyncScheduler::new(context(), Duration::from_secs(30)).unwrap();
        assert!(matches!(scheduler.stop(), Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_tick_probes_when_offline() {
        let context = context();
        context.network.report_network_failure();
        assert!(!context.network.is_online());

        AutoSyncScheduler::tick(&context).await;
        assert!(context.network.is_online());
    }
}
