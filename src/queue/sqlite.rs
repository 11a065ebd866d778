//! SQLite-backed task queue
//!
//! One row per task id. Rows move `queued -> in_flight -> (deleted | queued | failed)`.
//! The file survives restarts; leases held by a dead process expire and the
//! row becomes `queued` again.

use super::{EnqueueOutcome, FailOutcome, Lease, QueueConfig, QueueStats, TaskQueue};
use crate::error::QueueError;
use crate::types::Task;
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_queue (
    task_id TEXT PRIMARY KEY,
    subject_wallet TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    lease_token INTEGER,
    lease_expires_at INTEGER,
    available_at INTEGER NOT NULL,
    last_error TEXT,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_queue_ready ON task_queue(state, available_at);
"#;

const STATE_QUEUED: &str = "queued";
const STATE_IN_FLIGHT: &str = "in_flight";
const STATE_FAILED: &str = "failed";

pub struct SqliteTaskQueue {
    conn: Arc<Mutex<Connection>>,
    config: QueueConfig,
    notify: Notify,
    closed: AtomicBool,
}

impl SqliteTaskQueue {
    /// Open (or create) the queue file at `path`
    pub fn open(path: &Path, config: QueueConfig) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        info!("Task queue opened at {:?}", path);
        Ok(Self::from_connection(conn, config))
    }

    /// Create in-memory queue (for testing)
    pub fn in_memory(config: QueueConfig) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn, config))
    }

    fn from_connection(conn: Connection, config: QueueConfig) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Task ids currently queued or in flight, oldest first
    pub fn pending_task_ids(&self) -> Result<Vec<U256>, QueueError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id FROM task_queue WHERE state IN (?1, ?2) ORDER BY rowid ASC",
        )?;
        let ids = stmt
            .query_map(params![STATE_QUEUED, STATE_IN_FLIGHT], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        ids.iter().map(|s| parse_task_id(s)).collect()
    }

    /// Last recorded error of a failed task
    pub fn last_error(&self, task_id: U256) -> Result<Option<String>, QueueError> {
        let conn = self.conn.lock();
        let err = conn
            .query_row(
                "SELECT last_error FROM task_queue WHERE task_id = ?1",
                params![task_id.to_string()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(err.flatten())
    }

    /// Return expired leases to the queue. Returns how many were reclaimed.
    pub fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let conn = self.conn.lock();
        Self::reclaim_expired_locked(&conn, now_ms())
    }

    fn reclaim_expired_locked(conn: &Connection, now: i64) -> Result<usize, QueueError> {
        let n = conn.execute(
            "UPDATE task_queue
             SET state = ?1, lease_token = NULL, lease_expires_at = NULL, available_at = ?2
             WHERE state = ?3 AND lease_expires_at <= ?2",
            params![STATE_QUEUED, now, STATE_IN_FLIGHT],
        )?;
        if n > 0 {
            warn!("Reclaimed {} task(s) with expired leases", n);
        }
        Ok(n)
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, task: &Task) -> Result<EnqueueOutcome, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let outcome = {
            let conn = self.conn.lock();
            let now = now_ms();
            let task_id = task.task_id.to_string();

            let state: Option<String> = conn
                .query_row(
                    "SELECT state FROM task_queue WHERE task_id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?;

            match state.as_deref() {
                None => {
                    conn.execute(
                        "INSERT INTO task_queue (task_id, subject_wallet, state, attempts, available_at, enqueued_at)
                         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                        params![task_id, task.subject_wallet.to_string(), STATE_QUEUED, now],
                    )?;
                    EnqueueOutcome::Enqueued
                }
                Some(STATE_FAILED) => {
                    conn.execute(
                        "UPDATE task_queue
                         SET state = ?1, attempts = 0, available_at = ?2, subject_wallet = ?3
                         WHERE task_id = ?4",
                        params![STATE_QUEUED, now, task.subject_wallet.to_string(), task_id],
                    )?;
                    EnqueueOutcome::Requeued
                }
                Some(_) => EnqueueOutcome::AlreadyPending,
            }
        };

        if outcome != EnqueueOutcome::AlreadyPending {
            info!(task_id = %task.task_id, "Adding task ID:{} to queue.", task.task_id);
            self.notify.notify_one();
        } else {
            debug!(task_id = %task.task_id, "Task already pending in queue");
        }
        Ok(outcome)
    }

    async fn dequeue(&self) -> Result<Option<Lease>, QueueError> {
        if self.is_closed() {
            return Ok(None);
        }

        let conn = self.conn.lock();
        let now = now_ms();
        Self::reclaim_expired_locked(&conn, now)?;

        let row: Option<(String, String, u32)> = conn
            .query_row(
                "SELECT task_id, subject_wallet, attempts FROM task_queue
                 WHERE state = ?1 AND available_at <= ?2
                 ORDER BY available_at ASC, rowid ASC LIMIT 1",
                params![STATE_QUEUED, now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((task_id, wallet, attempts)) = row else {
            return Ok(None);
        };

        let token = i64::from(rand::random::<u32>());
        let expires_at = now.saturating_add(duration_ms(self.config.lease_duration));
        conn.execute(
            "UPDATE task_queue
             SET state = ?1, attempts = attempts + 1, lease_token = ?2, lease_expires_at = ?3
             WHERE task_id = ?4",
            params![STATE_IN_FLIGHT, token, expires_at, task_id],
        )?;

        let task = Task::new(parse_task_id(&task_id)?, parse_wallet(&task_id, &wallet)?);
        Ok(Some(Lease {
            task,
            attempt: attempts + 1,
            token,
        }))
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM task_queue WHERE task_id = ?1 AND lease_token = ?2",
            params![lease.task.task_id.to_string(), lease.token],
        )?;
        if n == 0 {
            return Err(QueueError::LeaseLost(lease.task.task_id.to_string()));
        }
        Ok(())
    }

    async fn fail(&self, lease: &Lease, reason: &str) -> Result<FailOutcome, QueueError> {
        let conn = self.conn.lock();
        let now = now_ms();
        let task_id = lease.task.task_id.to_string();

        let outcome = if lease.attempt < self.config.max_attempts {
            let delay = self.config.retry_backoff.saturating_mul(lease.attempt);
            let n = conn.execute(
                "UPDATE task_queue
                 SET state = ?1, lease_token = NULL, lease_expires_at = NULL, available_at = ?2, last_error = ?3
                 WHERE task_id = ?4 AND lease_token = ?5",
                params![
                    STATE_QUEUED,
                    now.saturating_add(duration_ms(delay)),
                    reason,
                    task_id,
                    lease.token
                ],
            )?;
            if n == 0 {
                return Err(QueueError::LeaseLost(task_id));
            }
            FailOutcome::RetryScheduled {
                next_attempt: lease.attempt + 1,
                delay,
            }
        } else {
            let n = conn.execute(
                "UPDATE task_queue
                 SET state = ?1, lease_token = NULL, lease_expires_at = NULL, last_error = ?2
                 WHERE task_id = ?3 AND lease_token = ?4",
                params![STATE_FAILED, reason, task_id, lease.token],
            )?;
            if n == 0 {
                return Err(QueueError::LeaseLost(task_id));
            }
            FailOutcome::Dead
        };

        Ok(outcome)
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        if self.is_closed() {
            return;
        }
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM task_queue GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let count = count as usize;
            match state.as_str() {
                STATE_QUEUED => stats.queued = count,
                STATE_IN_FLIGHT => stats.in_flight = count,
                STATE_FAILED => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closing task queue");
        }
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Milliseconds in `d`, clamped to the column range
fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn parse_task_id(s: &str) -> Result<U256, QueueError> {
    U256::from_str_radix(s, 10).map_err(|e| QueueError::Corrupt {
        task_id: s.to_string(),
        reason: e.to_string(),
    })
}

fn parse_wallet(task_id: &str, s: &str) -> Result<Address, QueueError> {
    Address::from_str(s).map_err(|e| QueueError::Corrupt {
        task_id: task_id.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u64) -> Task {
        Task::new(U256::from(id), Address::repeat_byte(id as u8))
    }

    fn queue() -> SqliteTaskQueue {
        SqliteTaskQueue::in_memory(QueueConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_while_pending() {
        let q = queue();
        assert_eq!(q.enqueue(&task(9)).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(q.enqueue(&task(9)).await.unwrap(), EnqueueOutcome::AlreadyPending);

        let lease = q.dequeue().await.unwrap().unwrap();
        assert_eq!(lease.task, task(9));
        // in flight: still a duplicate
        assert_eq!(q.enqueue(&task(9)).await.unwrap(), EnqueueOutcome::AlreadyPending);
        assert!(q.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_order_and_large_task_ids() {
        let q = queue();
        let big = Task::new(U256::MAX, Address::repeat_byte(0xaa));
        q.enqueue(&task(3)).await.unwrap();
        q.enqueue(&big).await.unwrap();
        q.enqueue(&task(1)).await.unwrap();

        assert_eq!(q.pending_task_ids().unwrap(), vec![U256::from(3), U256::MAX, U256::from(1)]);
        assert_eq!(q.dequeue().await.unwrap().unwrap().task, task(3));
        assert_eq!(q.dequeue().await.unwrap().unwrap().task, big);
        assert_eq!(q.dequeue().await.unwrap().unwrap().task, task(1));
    }

    #[tokio::test]
    async fn test_ack_removes_task() {
        let q = queue();
        q.enqueue(&task(1)).await.unwrap();
        let lease = q.dequeue().await.unwrap().unwrap();
        assert_eq!(lease.attempt, 1);
        q.ack(&lease).await.unwrap();
        assert_eq!(q.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_fail_without_retries_is_dead() {
        let q = queue();
        q.enqueue(&task(9)).await.unwrap();
        let lease = q.dequeue().await.unwrap().unwrap();

        assert_eq!(q.fail(&lease, "reverted").await.unwrap(), FailOutcome::Dead);
        assert!(q.dequeue().await.unwrap().is_none());
        assert_eq!(q.stats().await.unwrap().failed, 1);
        assert_eq!(q.last_error(U256::from(9)).unwrap().as_deref(), Some("reverted"));
    }

    #[tokio::test]
    async fn test_retry_policy_redelivers() {
        let q = SqliteTaskQueue::in_memory(QueueConfig {
            max_attempts: 2,
            retry_backoff: Duration::ZERO,
            ..Default::default()
        })
        .unwrap();
        q.enqueue(&task(5)).await.unwrap();

        let first = q.dequeue().await.unwrap().unwrap();
        assert_eq!(
            q.fail(&first, "rpc timeout").await.unwrap(),
            FailOutcome::RetryScheduled {
                next_attempt: 2,
                delay: Duration::ZERO
            }
        );

        let second = q.dequeue().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(q.fail(&second, "rpc timeout").await.unwrap(), FailOutcome::Dead);
    }

    #[tokio::test]
    async fn test_failed_task_can_be_requeued() {
        let q = queue();
        q.enqueue(&task(4)).await.unwrap();
        let lease = q.dequeue().await.unwrap().unwrap();
        q.fail(&lease, "boom").await.unwrap();

        assert_eq!(q.enqueue(&task(4)).await.unwrap(), EnqueueOutcome::Requeued);
        let again = q.dequeue().await.unwrap().unwrap();
        assert_eq!(again.attempt, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let q = SqliteTaskQueue::in_memory(QueueConfig {
            lease_duration: Duration::ZERO,
            ..Default::default()
        })
        .unwrap();
        q.enqueue(&task(2)).await.unwrap();

        let stale = q.dequeue().await.unwrap().unwrap();
        let fresh = q.dequeue().await.unwrap().unwrap();
        assert_eq!(fresh.task, stale.task);
        assert_eq!(fresh.attempt, 2);

        // the abandoned lease can no longer ack
        assert!(matches!(q.ack(&stale).await, Err(QueueError::LeaseLost(_))));
        q.ack(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_huge_lease_and_backoff_saturate() {
        let q = SqliteTaskQueue::in_memory(QueueConfig {
            max_attempts: 3,
            retry_backoff: Duration::MAX,
            lease_duration: Duration::MAX,
        })
        .unwrap();
        q.enqueue(&task(6)).await.unwrap();

        let lease = q.dequeue().await.unwrap().unwrap();
        // the lease is still held, not expired
        assert!(q.dequeue().await.unwrap().is_none());

        assert_eq!(
            q.fail(&lease, "rpc timeout").await.unwrap(),
            FailOutcome::RetryScheduled {
                next_attempt: 2,
                delay: Duration::MAX
            }
        );
        assert!(q.dequeue().await.unwrap().is_none());
        assert_eq!(q.pending_task_ids().unwrap(), vec![U256::from(6)]);
    }

    #[tokio::test]
    async fn test_closed_queue_stops_leasing() {
        let q = queue();
        q.enqueue(&task(1)).await.unwrap();
        q.close().await;

        assert!(q.is_closed());
        assert!(q.dequeue().await.unwrap().is_none());
        assert!(matches!(q.enqueue(&task(2)).await, Err(QueueError::Closed)));
        // returns immediately
        q.wait_for_work(Duration::from_secs(3600)).await;
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue").join("tasks.db");

        {
            let q = SqliteTaskQueue::open(&path, QueueConfig::default()).unwrap();
            q.enqueue(&task(9)).await.unwrap();
            q.enqueue(&task(11)).await.unwrap();
            q.close().await;
        }

        let q = SqliteTaskQueue::open(&path, QueueConfig::default()).unwrap();
        assert_eq!(q.pending_task_ids().unwrap(), vec![U256::from(9), U256::from(11)]);
    }
}
