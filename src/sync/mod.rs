//! Sync Module - Offline operation queue and state synchronization
//!
//! Lets the user answer questions and change settings while disconnected:
//! - Operations are queued durably with retry/backoff state
//! - Optimistic updates show the intent in the cache immediately
//! - The coordinator replays operations once connectivity returns
//! - Server responses are reconciled and dependent cache entries refreshed
//!
//! Architecture:
//! - Queue: priority + FIFO, per-(user, type) ordering, deduplication
//! - Handlers: one per operation type, registered once at construction
//! - Conflict Resolution: server-wins, timestamp-wins, or field merge

pub mod api;
pub mod conflict;
pub mod coordinator;
pub mod handlers;
pub mod models;
pub mod network;
pub mod optimistic;
pub mod queue;
pub mod scheduler;


// Re-export commonly used types
pub use api::{ApiError, QuizApiClient, Resource, ResourceFetcher};
pub use conflict::{ConflictResolver, ConflictStrategy, Resolution};
pub use coordinator::SyncCoordinator;
pub use handlers::{HandlerRegistry, OperationHandler};
pub use models::{
    EnqueueOptions, FailureOutcome, NetworkStatus, Operation, OperationError, OperationStatus, OperationType,
    Priority, QueueStats, QueueStatus, SyncEvent, SyncReport,
};
pub use network::NetworkMonitor;
pub use optimistic::{OptimisticUpdate, Transform};
pub use queue::{OperationQueue, QueueError, RetryPolicy};
pub use scheduler::{AutoSyncScheduler, SchedulerContext, SchedulerError};
