//! Task lifecycle controller
//!
//! Wires discovery, filtering, queueing and the worker pool together.
//!
//! Flow:
//! 1. Pin the head block, start the live subscription, drain the backfill
//! 2. Check every discovered task for actionability concurrently and
//!    enqueue the survivors
//! 3. Workers lease tasks, re-check them, evaluate compliance, sign a fresh
//!    attestation and submit the response
//! 4. Success acks the task (`Resolved`); a failed submission is recorded
//!    in the queue (`Failed`) and is never re-enqueued from here

use crate::avs::{Actionability, ActionabilityFilter, AvsContract, SubmissionReceipt};
use crate::config::WorkerConfig;
use crate::error::{EventSourceError, QueueError, SubmissionError};
use crate::events::{EventSource, EventSourceConfig, LiveSubscription};
use crate::observability::{task_span, worker_span};
use crate::oracle::ComplianceOracleAggregator;
use crate::queue::{EnqueueOutcome, FailOutcome, Lease, TaskQueue};
use crate::signature::SignatureIssuer;
use crate::types::{Task, TaskCreatedEvent, TaskState};
use alloy_primitives::{B256, U256};
use futures::stream::{FuturesUnordered, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Upper bound on concurrent actionability checks during backfill
pub const BACKFILL_FILTER_CONCURRENCY: usize = 64;

// ============================================================================
// Task ledger
// ============================================================================

/// Finished tasks remembered by the ledger before the oldest is forgotten
pub const LEDGER_FINISHED_CAPACITY: usize = 1024;

/// Lifecycle state of the tasks this process is working on.
///
/// Dropped tasks are forgotten right away. Tasks that reached a terminal
/// state are kept only for the last `LEDGER_FINISHED_CAPACITY` of them.
#[derive(Clone)]
pub struct TaskLedger {
    inner: Arc<Mutex<LedgerInner>>,
}

struct LedgerInner {
    states: HashMap<U256, TaskState>,
    finished: VecDeque<U256>,
    finished_capacity: usize,
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::with_capacity(LEDGER_FINISHED_CAPACITY)
    }
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(finished_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerInner {
                states: HashMap::new(),
                finished: VecDeque::new(),
                finished_capacity,
            })),
        }
    }

    pub fn state(&self, task_id: U256) -> Option<TaskState> {
        self.inner.lock().states.get(&task_id).copied()
    }

    pub fn snapshot(&self) -> HashMap<U256, TaskState> {
        self.inner.lock().states.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().states.is_empty()
    }

    /// Task ids currently in `state`, sorted
    pub fn in_state(&self, state: TaskState) -> Vec<U256> {
        let mut ids: Vec<_> = self
            .inner
            .lock()
            .states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Start tracking a discovered task.
    ///
    /// Returns `false` when the task is already moving through the pipeline,
    /// in which case its state is left untouched.
    fn discovered(&self, task_id: U256) -> bool {
        let mut inner = self.inner.lock();
        let in_flight = inner
            .states
            .get(&task_id)
            .is_some_and(|state| !state.is_terminal());
        if in_flight {
            return false;
        }
        inner.states.insert(task_id, TaskState::Discovered);
        true
    }

    /// Stop tracking a task that was dropped before reaching the queue.
    fn forget(&self, task_id: U256) {
        self.inner.lock().states.remove(&task_id);
    }

    /// A leased task restarts from `Queued`, including queue retries.
    fn leased(&self, task_id: U256) {
        self.inner.lock().states.insert(task_id, TaskState::Queued);
    }

    fn advance(&self, task_id: U256, next: TaskState) {
        let mut inner = self.inner.lock();
        let previous = inner.states.insert(task_id, next);
        match previous {
            Some(prev) if !prev.can_transition_to(next) => {
                warn!(%task_id, "Unexpected task transition {} -> {}", prev, next);
            }
            Some(prev) => debug!(%task_id, "Task {} -> {}", prev, next),
            None => debug!(%task_id, "Task -> {}", next),
        }

        if next.is_terminal() {
            inner.finished.push_back(task_id);
            while inner.finished.len() > inner.finished_capacity {
                let Some(oldest) = inner.finished.pop_front() else {
                    break;
                };
                // A rediscovered or retried task is live again; keep it.
                if inner.states.get(&oldest).is_some_and(|s| s.is_terminal())
                    && !inner.finished.contains(&oldest)
                {
                    inner.states.remove(&oldest);
                }
            }
        }
    }
}

// ============================================================================
// Worker-side processing
// ============================================================================

/// How a leased task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Submitted { verdict: bool, tx_hash: B256 },
    /// Answered or completed before this worker got to it
    AlreadyHandled,
    Failed { reason: String, retry_scheduled: bool },
}

/// Everything a worker needs to resolve one lease.
pub struct TaskProcessor {
    avs: Arc<dyn AvsContract>,
    filter: ActionabilityFilter,
    aggregator: ComplianceOracleAggregator,
    issuer: SignatureIssuer,
    queue: Arc<dyn TaskQueue>,
    ledger: TaskLedger,
}

impl TaskProcessor {
    pub async fn process(&self, lease: Lease) -> TaskOutcome {
        let task_id = lease.task.task_id;
        self.process_inner(lease).instrument(task_span(task_id)).await
    }

    async fn process_inner(&self, lease: Lease) -> TaskOutcome {
        let task = lease.task;
        self.ledger.leased(task.task_id);
        info!(
            attempt = lease.attempt,
            "Processing task {} for wallet {}", task.task_id, task.subject_wallet
        );

        // The queue may hold tasks from before a restart; skip ones already answered.
        match self.filter.check(task.task_id).await {
            Ok(Actionability::AlreadyHandled { .. }) => {
                info!("Task {} was handled while queued, skipping", task.task_id);
                self.ledger.advance(task.task_id, TaskState::Resolved);
                if let Err(e) = self.queue.ack(&lease).await {
                    error!("Failed to ack task {}: {}", task.task_id, e);
                }
                return TaskOutcome::AlreadyHandled;
            }
            Ok(Actionability::RequiresAction(_)) => {}
            Err(e) => warn!(
                "Could not re-check task {} before submitting, continuing: {}",
                task.task_id, e
            ),
        }

        self.ledger.advance(task.task_id, TaskState::Verifying);
        let report = self.aggregator.evaluate_detailed(task.subject_wallet).await;
        let verdict = report.is_compliant();
        info!(
            "Task {} verdict for wallet {}: {}",
            task.task_id, task.subject_wallet, verdict
        );

        self.ledger.advance(task.task_id, TaskState::Submitting);
        match self.submit(&task, verdict).await {
            Ok(receipt) => {
                info!(
                    "Task {} response submitted in tx {}",
                    task.task_id, receipt.tx_hash
                );
                self.ledger.advance(task.task_id, TaskState::Resolved);
                if let Err(e) = self.queue.ack(&lease).await {
                    error!("Failed to ack task {}: {}", task.task_id, e);
                }
                TaskOutcome::Submitted {
                    verdict,
                    tx_hash: receipt.tx_hash,
                }
            }
            Err(e) => {
                let reason = e.to_string();
                error!("Task {} failed: {}", task.task_id, reason);
                self.ledger.advance(task.task_id, TaskState::Failed);

                let retry_scheduled = match self.queue.fail(&lease, &reason).await {
                    Ok(FailOutcome::RetryScheduled {
                        next_attempt,
                        delay,
                    }) => {
                        info!(
                            "Task {} will be retried by the queue (attempt {} in {:?})",
                            task.task_id, next_attempt, delay
                        );
                        true
                    }
                    Ok(FailOutcome::Dead) => false,
                    Err(e) => {
                        error!("Failed to record failure of task {}: {}", task.task_id, e);
                        false
                    }
                };

                TaskOutcome::Failed {
                    reason,
                    retry_scheduled,
                }
            }
        }
    }

    /// Sign a fresh attestation and submit it. Never reuses a previous one.
    async fn submit(&self, task: &Task, verdict: bool) -> Result<SubmissionReceipt, SubmissionError> {
        let attestation = self.issuer.sign_task_response(
            task.task_id,
            verdict,
            self.issuer.operator_address(),
            self.avs.address(),
        )?;
        debug!(
            salt = %attestation.salt,
            expiry = attestation.expiry,
            "Signed response for task {}", task.task_id
        );

        let receipt = self
            .avs
            .submit_response(task.task_id, verdict, &attestation)
            .await?;
        Ok(receipt)
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Counters for one discovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub discovered: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Enqueued,
    AlreadyPending,
    Skipped,
    Error,
}

impl AdmissionStats {
    fn record(&mut self, admission: Admission) {
        self.discovered += 1;
        match admission {
            Admission::Enqueued => self.enqueued += 1,
            Admission::AlreadyPending | Admission::Skipped => self.skipped += 1,
            Admission::Error => self.errors += 1,
        }
    }
}

pub struct TaskLifecycleController {
    events: EventSource,
    filter: ActionabilityFilter,
    queue: Arc<dyn TaskQueue>,
    processor: Arc<TaskProcessor>,
    workers: WorkerConfig,
    ledger: TaskLedger,
}

impl TaskLifecycleController {
    pub fn new(
        avs: Arc<dyn AvsContract>,
        aggregator: ComplianceOracleAggregator,
        issuer: SignatureIssuer,
        queue: Arc<dyn TaskQueue>,
        events: EventSourceConfig,
        workers: WorkerConfig,
    ) -> Self {
        let ledger = TaskLedger::new();
        let filter = ActionabilityFilter::new(Arc::clone(&avs), issuer.operator_address());
        let processor = Arc::new(TaskProcessor {
            avs: Arc::clone(&avs),
            filter: filter.clone(),
            aggregator,
            issuer,
            queue: Arc::clone(&queue),
            ledger: ledger.clone(),
        });

        Self {
            events: EventSource::new(avs, events),
            filter,
            queue,
            processor,
            workers,
            ledger,
        }
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Only a failed backfill or an unreadable head block returns an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EventSourceError> {
        let discovery = self.events.start().await?;
        info!("Task discovery started at head block {}", discovery.head);

        let (stop_tx, stop_rx) = watch::channel(false);
        let workers = self.spawn_workers(stop_rx);

        let mut live = discovery.live;
        let backfill = discovery
            .backfill
            .map(|item| async move {
                match item {
                    Ok(event) => Ok(self.admit(event).await),
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(BACKFILL_FILTER_CONCURRENCY)
            .try_fold(AdmissionStats::default(), |mut stats, admission| async move {
                stats.record(admission);
                Ok(stats)
            });

        let backfill_result = tokio::select! {
            r = backfill => Some(r),
            _ = wait_for_shutdown(&mut shutdown) => None,
        };

        let result = match backfill_result {
            Some(Ok(stats)) => {
                info!(
                    "Backfill done: {} discovered, {} enqueued, {} skipped, {} errors",
                    stats.discovered, stats.enqueued, stats.skipped, stats.errors
                );
                self.consume_live(&mut live, &mut shutdown).await;
                Ok(())
            }
            Some(Err(e)) => {
                error!("Backfill failed: {}", e);
                Err(e)
            }
            None => Ok(()),
        };

        info!("Shutting down task controller");
        live.unsubscribe().await;
        self.queue.close().await;
        let _ = stop_tx.send(true);
        self.join_workers(workers).await;
        info!("Task controller stopped");

        result
    }

    /// Wait up to the shutdown grace period for workers, then abort the rest.
    ///
    /// An aborted worker never acks its lease, so the queue redelivers the task.
    async fn join_workers(&self, mut workers: Vec<JoinHandle<()>>) {
        let grace = self.workers.shutdown_grace;
        let joined = tokio::time::timeout(grace, async {
            for handle in workers.iter_mut() {
                if let Err(e) = handle.await {
                    error!("Worker panicked: {}", e);
                }
            }
        })
        .await;

        if joined.is_err() {
            let busy: Vec<_> = workers.into_iter().filter(|h| !h.is_finished()).collect();
            warn!(
                "{} worker(s) still busy after {:?}, aborting; their tasks stay leased",
                busy.len(),
                grace
            );
            for handle in &busy {
                handle.abort();
            }
            for handle in busy {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!("Worker panicked: {}", e);
                    }
                }
            }
        }
    }

    /// Admit live events as they arrive; each check runs independently.
    async fn consume_live(
        &self,
        live: &mut LiveSubscription,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut admitting = FuturesUnordered::new();
        loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown) => break,
                Some(_) = admitting.next(), if !admitting.is_empty() => {}
                event = live.recv() => match event {
                    Some(event) => admitting.push(self.admit(event)),
                    None => {
                        error!("Live task subscription ended unexpectedly");
                        while admitting.next().await.is_some() {}
                        break;
                    }
                },
            }
        }
    }

    /// Filter one discovered task and enqueue it if it still needs an answer.
    ///
    /// Errors are logged and confined to this task.
    async fn admit(&self, event: TaskCreatedEvent) -> Admission {
        let task_id = event.task_id;
        async {
            debug!(block = event.block_number, "Discovered task {}", task_id);
            if !self.ledger.discovered(task_id) {
                debug!("Task {} is already in progress", task_id);
                return Admission::AlreadyPending;
            }

            let admission = self.filter_and_enqueue(task_id).await;
            if !matches!(admission, Admission::Enqueued | Admission::AlreadyPending) {
                self.ledger.forget(task_id);
            }
            admission
        }
        .instrument(task_span(task_id))
        .await
    }

    async fn filter_and_enqueue(&self, task_id: U256) -> Admission {
        let task = match self.filter.check(task_id).await {
            Ok(Actionability::RequiresAction(task)) => task,
            Ok(Actionability::AlreadyHandled {
                is_completed,
                is_answered,
            }) => {
                info!(
                    "Skipping task {} (completed: {}, answered: {})",
                    task_id, is_completed, is_answered
                );
                return Admission::Skipped;
            }
            Err(e) => {
                error!("Failed to check task {}: {}", task_id, e);
                return Admission::Error;
            }
        };
        self.ledger.advance(task_id, TaskState::Filtered);

        match self.queue.enqueue(&task).await {
            Ok(outcome) => {
                self.ledger.advance(task_id, TaskState::Queued);
                if outcome == EnqueueOutcome::AlreadyPending {
                    Admission::AlreadyPending
                } else {
                    Admission::Enqueued
                }
            }
            Err(QueueError::Closed) => {
                debug!("Queue closed, dropping task {}", task_id);
                Admission::Error
            }
            Err(e) => {
                error!("Failed to enqueue task {}: {}", task_id, e);
                Admission::Error
            }
        }
    }

    fn spawn_workers(&self, stop_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!("Starting {} queue worker(s)", self.workers.workers);
        (0..self.workers.workers)
            .map(|id| {
                let processor = Arc::clone(&self.processor);
                let queue = Arc::clone(&self.queue);
                let config = self.workers.clone();
                let stop_rx = stop_rx.clone();
                tokio::spawn(
                    worker_loop(id, processor, queue, config, stop_rx).instrument(worker_span(id)),
                )
            })
            .collect()
    }
}

async fn worker_loop(
    id: usize,
    processor: Arc<TaskProcessor>,
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    mut stop_rx: watch::Receiver<bool>,
) {
    debug!("Worker {} started", id);
    loop {
        if *stop_rx.borrow() {
            break;
        }

        match queue.dequeue().await {
            Ok(Some(lease)) => {
                processor.process(lease).await;
            }
            Ok(None) => {
                if queue.is_closed() {
                    break;
                }
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = queue.wait_for_work(config.idle_poll) => {}
                }
            }
            Err(QueueError::Closed) => break,
            Err(e) => {
                error!("Worker {} failed to dequeue: {}", id, e);
                tokio::time::sleep(config.idle_poll).await;
            }
        }
    }
    debug!("Worker {} stopped", id);
}

/// Resolves once shutdown is requested or the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContractError;
    use crate::oracle::ComplianceOracle;
    use crate::queue::{QueueConfig, SqliteTaskQueue};
    use crate::signature::SignedAttestation;
    use crate::types::TaskDetails;
    use alloy::signers::local::PrivateKeySigner;
    use alloy_primitives::Address;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct StubAvs {
        details: Mutex<HashMap<U256, TaskDetails>>,
        revert: Mutex<Vec<U256>>,
        submitted: Mutex<Vec<(U256, bool, SignedAttestation)>>,
    }

    impl StubAvs {
        fn open_task(&self, id: u64) {
            self.details.lock().insert(
                U256::from(id),
                TaskDetails {
                    is_completed: false,
                    is_answered: false,
                    user_address: Address::repeat_byte(id as u8),
                },
            );
        }

        fn answer(&self, id: u64) {
            if let Some(d) = self.details.lock().get_mut(&U256::from(id)) {
                d.is_answered = true;
            }
        }
    }

    #[async_trait]
    impl AvsContract for StubAvs {
        fn chain_id(&self) -> u64 {
            8453
        }

        fn address(&self) -> Address {
            Address::repeat_byte(0xaa)
        }

        async fn head_block(&self) -> Result<u64, ContractError> {
            Ok(100)
        }

        async fn task_created_events(
            &self,
            _from: u64,
            _to: u64,
        ) -> Result<Vec<TaskCreatedEvent>, ContractError> {
            Ok(Vec::new())
        }

        async fn task_details(
            &self,
            task_id: U256,
            _operator: Address,
        ) -> Result<TaskDetails, ContractError> {
            self.details
                .lock()
                .get(&task_id)
                .copied()
                .ok_or_else(|| ContractError::Rpc {
                    chain_id: 8453,
                    message: "unknown task".to_string(),
                })
        }

        async fn submit_response(
            &self,
            task_id: U256,
            verdict: bool,
            attestation: &SignedAttestation,
        ) -> Result<SubmissionReceipt, ContractError> {
            if self.revert.lock().contains(&task_id) {
                return Err(ContractError::Reverted {
                    tx_hash: format!("{}", B256::repeat_byte(0xee)),
                });
            }
            self.submitted
                .lock()
                .push((task_id, verdict, attestation.clone()));
            Ok(SubmissionReceipt {
                tx_hash: B256::repeat_byte(task_id.to::<u8>()),
                block_number: Some(101),
            })
        }
    }

    struct AlwaysCompliant;

    #[async_trait]
    impl ComplianceOracle for AlwaysCompliant {
        fn chain_id(&self) -> u64 {
            1
        }

        async fn is_authorized(&self, _wallet: Address) -> Result<bool, ContractError> {
            Ok(true)
        }
    }

    fn processor(avs: Arc<StubAvs>, queue: Arc<SqliteTaskQueue>) -> TaskProcessor {
        let signer: PrivateKeySigner =
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
                .parse()
                .unwrap();
        let operator = signer.address();
        let avs_dyn: Arc<dyn AvsContract> = avs;
        let oracles: Vec<Arc<dyn ComplianceOracle>> = vec![Arc::new(AlwaysCompliant)];
        TaskProcessor {
            avs: Arc::clone(&avs_dyn),
            filter: ActionabilityFilter::new(avs_dyn, operator),
            aggregator: ComplianceOracleAggregator::new(oracles, Duration::from_secs(1)).unwrap(),
            issuer: SignatureIssuer::new(signer),
            queue,
            ledger: TaskLedger::new(),
        }
    }

    async fn leased(queue: &SqliteTaskQueue, id: u64) -> Lease {
        queue
            .enqueue(&Task::new(U256::from(id), Address::repeat_byte(id as u8)))
            .await
            .unwrap();
        queue.dequeue().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_successful_submission_acks_task() {
        let avs = Arc::new(StubAvs::default());
        avs.open_task(5);
        let queue = Arc::new(SqliteTaskQueue::in_memory(QueueConfig::default()).unwrap());
        let p = processor(avs.clone(), queue.clone());

        let outcome = p.process(leased(&queue, 5).await).await;
        assert_eq!(
            outcome,
            TaskOutcome::Submitted {
                verdict: true,
                tx_hash: B256::repeat_byte(5),
            }
        );
        assert_eq!(p.ledger.state(U256::from(5)), Some(TaskState::Resolved));
        assert!(queue.pending_task_ids().unwrap().is_empty());

        let submitted = avs.submitted.lock();
        assert_eq!(submitted.len(), 1);
        let attestation = &submitted[0].2;
        assert_eq!(
            attestation.recover_signer().unwrap(),
            p.issuer.operator_address()
        );
    }

    #[tokio::test]
    async fn test_revert_marks_task_failed_without_requeue() {
        let avs = Arc::new(StubAvs::default());
        avs.open_task(9);
        avs.revert.lock().push(U256::from(9));
        let queue = Arc::new(SqliteTaskQueue::in_memory(QueueConfig::default()).unwrap());
        let p = processor(avs.clone(), queue.clone());

        let outcome = p.process(leased(&queue, 9).await).await;
        assert!(matches!(
            outcome,
            TaskOutcome::Failed {
                retry_scheduled: false,
                ..
            }
        ));
        assert_eq!(p.ledger.state(U256::from(9)), Some(TaskState::Failed));
        assert!(queue.pending_task_ids().unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().failed, 1);
        assert!(queue
            .last_error(U256::from(9))
            .unwrap()
            .unwrap()
            .contains("reverted"));
    }

    #[tokio::test]
    async fn test_task_answered_while_queued_is_not_submitted() {
        let avs = Arc::new(StubAvs::default());
        avs.open_task(3);
        let queue = Arc::new(SqliteTaskQueue::in_memory(QueueConfig::default()).unwrap());
        let p = processor(avs.clone(), queue.clone());

        let lease = leased(&queue, 3).await;
        avs.answer(3);

        assert_eq!(p.process(lease).await, TaskOutcome::AlreadyHandled);
        assert!(avs.submitted.lock().is_empty());
        assert!(queue.pending_task_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_retry_after_revert_submits_on_next_attempt() {
        let avs = Arc::new(StubAvs::default());
        avs.open_task(4);
        let config = QueueConfig {
            max_attempts: 2,
            retry_backoff: Duration::ZERO,
            ..QueueConfig::default()
        };
        let queue = Arc::new(SqliteTaskQueue::in_memory(config).unwrap());
        let p = processor(avs.clone(), queue.clone());

        avs.revert.lock().push(U256::from(4));
        let outcome = p.process(leased(&queue, 4).await).await;
        assert!(matches!(
            outcome,
            TaskOutcome::Failed {
                retry_scheduled: true,
                ..
            }
        ));

        avs.revert.lock().clear();
        let lease = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(lease.attempt, 2);
        assert!(matches!(
            p.process(lease).await,
            TaskOutcome::Submitted { .. }
        ));
        assert_eq!(avs.submitted.lock().len(), 1);
    }

    #[test]
    fn test_ledger_tracks_latest_state() {
        let ledger = TaskLedger::new();
        let id = U256::from(1);
        ledger.discovered(id);
        ledger.advance(id, TaskState::Filtered);
        ledger.advance(id, TaskState::Queued);
        assert_eq!(ledger.state(id), Some(TaskState::Queued));
        assert_eq!(ledger.in_state(TaskState::Queued), vec![id]);
        assert!(ledger.in_state(TaskState::Resolved).is_empty());
    }

    #[test]
    fn test_rediscovery_leaves_in_flight_task_alone() {
        let ledger = TaskLedger::new();
        let id = U256::from(2);
        assert!(ledger.discovered(id));
        ledger.advance(id, TaskState::Filtered);
        ledger.advance(id, TaskState::Queued);
        ledger.advance(id, TaskState::Verifying);

        assert!(!ledger.discovered(id));
        assert_eq!(ledger.state(id), Some(TaskState::Verifying));

        ledger.advance(id, TaskState::Submitting);
        ledger.advance(id, TaskState::Failed);
        assert!(ledger.discovered(id));
        assert_eq!(ledger.state(id), Some(TaskState::Discovered));
    }

    #[test]
    fn test_ledger_forgets_dropped_and_oldest_finished_tasks() {
        let ledger = TaskLedger::with_capacity(2);
        for n in 1..=4u64 {
            let id = U256::from(n);
            ledger.discovered(id);
            ledger.advance(id, TaskState::Filtered);
            ledger.advance(id, TaskState::Queued);
            ledger.advance(id, TaskState::Resolved);
        }
        assert_eq!(ledger.in_state(TaskState::Resolved), vec![U256::from(3), U256::from(4)]);

        let dropped = U256::from(9);
        ledger.discovered(dropped);
        ledger.forget(dropped);
        assert_eq!(ledger.state(dropped), None);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_live_task_survives_eviction_of_its_old_terminal_entry() {
        let ledger = TaskLedger::with_capacity(1);
        let retried = U256::from(1);
        ledger.leased(retried);
        ledger.advance(retried, TaskState::Verifying);
        ledger.advance(retried, TaskState::Submitting);
        ledger.advance(retried, TaskState::Failed);
        // redelivered by the queue
        ledger.leased(retried);

        let other = U256::from(2);
        ledger.leased(other);
        ledger.advance(other, TaskState::Resolved);

        assert_eq!(ledger.state(retried), Some(TaskState::Queued));
        assert_eq!(ledger.state(other), Some(TaskState::Resolved));
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_returns_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(&mut rx))
            .await
            .unwrap();
    }
}
