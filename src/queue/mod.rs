//! Durable task queue
//!
//! At-least-once delivery keyed by task id:
//! - `enqueue` of a task that is already queued or in flight is a no-op
//! - `dequeue` hands out a time-limited lease
//! - a lease that is neither acked nor failed before it expires is
//!   redelivered, including after a process restart

pub mod sqlite;

pub use sqlite::SqliteTaskQueue;

use crate::error::QueueError;
use crate::types::Task;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of deliveries per task (no automatic retry)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Default base delay between retries (multiplied by the attempt number)
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 30;

/// Default lease length before an unacknowledged task is redelivered
pub const DEFAULT_LEASE_SECS: u64 = 600;

/// Queue retry / redelivery policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub lease_duration: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Duration::from_secs(DEFAULT_RETRY_BACKOFF_SECS),
            lease_duration: Duration::from_secs(DEFAULT_LEASE_SECS),
        }
    }
}

/// A task handed to exactly one worker until acked, failed or expired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub task: Task,
    /// 1-based delivery count
    pub attempt: u32,
    pub(crate) token: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Already queued or in flight; nothing was added
    AlreadyPending,
    /// A previously failed task was armed again
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    RetryScheduled { next_attempt: u32, delay: Duration },
    /// No attempts left; the task stays failed
    Dead,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub failed: usize,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &Task) -> Result<EnqueueOutcome, QueueError>;

    /// Lease the oldest ready task, if any. Returns `None` once closed.
    async fn dequeue(&self) -> Result<Option<Lease>, QueueError>;

    /// Remove a successfully handled task.
    async fn ack(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Record a failed delivery and apply the retry policy.
    async fn fail(&self, lease: &Lease, reason: &str) -> Result<FailOutcome, QueueError>;

    /// Wait until new work may be available, the queue closes, or `max_wait` passes.
    async fn wait_for_work(&self, max_wait: Duration);

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Stop handing out leases and wake all waiters.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}
