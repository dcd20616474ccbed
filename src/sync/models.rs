//! Sync Data Models
//!
//! Operations, queue/network status and the events the sync layer emits.

use super::optimistic::OptimisticUpdate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Operations
// ============================================================================

/// Kind of mutating intent; each kind has exactly one registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    SubmitAnswer,
    SubmitAnswersBatch,
    UpdateSettings,
    SetExamSettings,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubmitAnswer => "SUBMIT_ANSWER",
            Self::SubmitAnswersBatch => "SUBMIT_ANSWERS_BATCH",
            Self::UpdateSettings => "UPDATE_SETTINGS",
            Self::SetExamSettings => "SET_EXAM_SETTINGS",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "SUBMIT_ANSWER" => Ok(Self::SubmitAnswer),
            "SUBMIT_ANSWERS_BATCH" => Ok(Self::SubmitAnswersBatch),
            "UPDATE_SETTINGS" => Ok(Self::UpdateSettings),
            "SET_EXAM_SETTINGS" => Ok(Self::SetExamSettings),
            _ => Err(format!("Unknown operation type: {}", s)),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drain priority; higher drains first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Operation lifecycle; SUCCEEDED operations leave the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Failed,
}

/// A queued unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub op_type: OperationType,
    pub payload: Value,
    pub priority: Priority,
    pub status: OperationStatus,

    /// Monotonic enqueue counter; FIFO tiebreak within a priority
    pub seq: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,

    /// Earliest time the next attempt may start (`None` = now)
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub user_id: Option<String>,

    /// Coalescing identity within `op_type`
    pub dedup_key: Option<String>,

    pub optimistic: Option<OptimisticUpdate>,
}

impl Operation {
    /// Whether the backoff window has elapsed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_attempt_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Ordering group: same user + same type sync in enqueue order
    pub fn ordering_group(&self) -> (Option<&str>, OperationType) {
        (self.user_id.as_deref(), self.op_type)
    }

    /// Drain order: priority descending, then enqueue order
    pub fn drain_order(&self) -> (std::cmp::Reverse<Priority>, u64) {
        (std::cmp::Reverse(self.priority), self.seq)
    }
}

/// Caller options for `OperationQueue::enqueue`
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,

    /// Overrides the configured retry budget
    pub max_retries: Option<u32>,

    pub user_id: Option<String>,
    pub optimistic: Option<OptimisticUpdate>,
}

impl EnqueueOptions {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_optimistic(mut self, update: OptimisticUpdate) -> Self {
        self.optimistic = Some(update);
        self
    }
}

// ============================================================================
// Queue & Network State
// ============================================================================

/// Overall queue state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Idle,
    Syncing,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Idle => "idle",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: usize,
    pub syncing_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
}

// ============================================================================
// Errors & Results
// ============================================================================

/// Why an operation attempt did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationError {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("No handler registered for {op_type}")]
    UnknownHandler { op_type: OperationType },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("Invalid response from server: {message}")]
    InvalidResponse { message: String },
}

impl OperationError {
    /// Network and 5xx errors are retried; everything else is terminal
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Server { .. })
    }

    /// Connectivity evidence (as opposed to an HTTP error status)
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// What happened to an operation after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Rescheduled; `attempt` is the retry number about to be made
    Retrying {
        attempt: u32,
        delay: std::time::Duration,
    },
    /// Terminal; optimistic effects were rolled back
    Failed,
}

/// Notifications for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    OperationSucceeded {
        id: String,
        op_type: OperationType,
        server_value: Value,
    },
    OperationRetrying {
        id: String,
        op_type: OperationType,
        attempt: u32,
        error: OperationError,
    },
    OperationFailed {
        id: String,
        op_type: OperationType,
        error: OperationError,
    },
    /// The configured strategy could not decide and server data was used
    ConflictFallback { op_type: OperationType, key: String },
    PersistenceDegraded { message: String },
    PassCompleted(SyncReport),
}

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,

    /// Pass did not run (already syncing or offline)
    pub skipped: bool,
}

impl SyncReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}
