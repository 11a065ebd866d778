//! Task discovery from the AVS chain
//!
//! Discovery has two halves that share one boundary block, the head `H`
//! observed when discovery starts:
//! - backfill: `TaskCreated` logs in `[from_block, H]`, fetched lazily in
//!   bounded block ranges; any RPC error is fatal
//! - live: a background poller that starts at `H + 1` and keeps a cursor
//!   of the next unscanned block; RPC errors back off and resume from the
//!   cursor, so a reconnect replays instead of skipping
//!
//! The live poller is started before the backfill is consumed, and the two
//! ranges are disjoint, so no event is missed or delivered twice.

use crate::avs::AvsContract;
use crate::error::{ContractError, EventSourceError};
use crate::types::{StartBlock, TaskCreatedEvent};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for task discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSourceConfig {
    pub from_block: StartBlock,
    /// Head polling interval for the live subscription
    pub poll_interval: Duration,
    /// Largest block span requested in one `eth_getLogs` call
    pub max_block_range: u64,
    /// Live event channel capacity (backpressure point)
    pub channel_capacity: usize,
    /// Upper bound of the retry delay after RPC failures
    pub max_retry_backoff: Duration,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            from_block: StartBlock::Latest,
            poll_interval: Duration::from_secs(4),
            max_block_range: 10_000,
            channel_capacity: 256,
            max_retry_backoff: Duration::from_secs(60),
        }
    }
}

/// Result of starting discovery
pub struct Discovery {
    /// Head block observed at start; last block covered by the backfill
    pub head: u64,
    pub backfill: BoxStream<'static, Result<TaskCreatedEvent, EventSourceError>>,
    pub live: LiveSubscription,
}

/// Handle to the running live poller
pub struct LiveSubscription {
    events: mpsc::Receiver<TaskCreatedEvent>,
    next_block: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LiveSubscription {
    /// Next live event; `None` once the poller has stopped.
    pub async fn recv(&mut self) -> Option<TaskCreatedEvent> {
        self.events.recv().await
    }

    /// First block not yet scanned by the poller
    pub fn next_block(&self) -> u64 {
        self.next_block.load(Ordering::SeqCst)
    }

    /// Stop polling and wait for the poller to exit.
    pub async fn unsubscribe(self) {
        let _ = self.shutdown_tx.send(true);
        drop(self.events);
        let _ = self.handle.await;
        info!("Unsubscribed from AVS task events");
    }
}

pub struct EventSource {
    avs: Arc<dyn AvsContract>,
    config: EventSourceConfig,
}

impl EventSource {
    pub fn new(avs: Arc<dyn AvsContract>, config: EventSourceConfig) -> Self {
        Self { avs, config }
    }

    pub fn config(&self) -> &EventSourceConfig {
        &self.config
    }

    /// Pin the boundary block, start the live poller, and return the lazy backfill.
    pub async fn start(&self) -> Result<Discovery, EventSourceError> {
        let head = self
            .avs
            .head_block()
            .await
            .map_err(EventSourceError::Head)?;

        let backfill_range = backfill_range(self.config.from_block, head);
        let live_start = match self.config.from_block {
            StartBlock::Number(n) if n > head => n,
            _ => head + 1,
        };

        let live = self.subscribe(live_start);

        let backfill = match backfill_range {
            Some((from, to)) => {
                info!("Getting historical events from block {} to {}", from, to);
                self.backfill(from, to)
            }
            None => stream::empty().boxed(),
        };

        Ok(Discovery {
            head,
            backfill,
            live,
        })
    }

    /// Lazily fetch `TaskCreated` events in `[from, to]`.
    pub fn backfill(
        &self,
        from: u64,
        to: u64,
    ) -> BoxStream<'static, Result<TaskCreatedEvent, EventSourceError>> {
        let avs = Arc::clone(&self.avs);
        let chunks = block_chunks(from, to, self.config.max_block_range);

        stream::iter(chunks)
            .then(move |(start, end)| {
                let avs = Arc::clone(&avs);
                async move {
                    debug!("Fetching TaskCreated logs for blocks {}..={}", start, end);
                    avs.task_created_events(start, end)
                        .await
                        .map_err(EventSourceError::Backfill)
                }
            })
            .map_ok(|events| stream::iter(events.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    /// Start polling for events from `start_block` onwards.
    pub fn subscribe(&self, start_block: u64) -> LiveSubscription {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let next_block = Arc::new(AtomicU64::new(start_block));

        info!(
            "Listening to AVS tasks on chain {} ({}) from block {}",
            self.avs.chain_id(),
            self.avs.address(),
            start_block
        );

        let handle = tokio::spawn(live_loop(
            Arc::clone(&self.avs),
            self.config.clone(),
            Arc::clone(&next_block),
            tx,
            shutdown_rx,
        ));

        LiveSubscription {
            events: rx,
            next_block,
            shutdown_tx,
            handle,
        }
    }
}

/// Inclusive range covered by the backfill, if any
pub fn backfill_range(from: StartBlock, head: u64) -> Option<(u64, u64)> {
    match from {
        StartBlock::Latest => Some((head, head)),
        StartBlock::Number(n) if n <= head => Some((n, head)),
        StartBlock::Number(_) => None,
    }
}

/// Split `[from, to]` into inclusive spans of at most `max_span` blocks.
pub fn block_chunks(from: u64, to: u64, max_span: u64) -> Vec<(u64, u64)> {
    let max_span = max_span.max(1);
    let mut chunks = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(max_span - 1).min(to);
        chunks.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    chunks
}

enum PollOutcome {
    Continue,
    ReceiverGone,
}

async fn live_loop(
    avs: Arc<dyn AvsContract>,
    config: EventSourceConfig,
    next_block: Arc<AtomicU64>,
    tx: mpsc::Sender<TaskCreatedEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut delay = Duration::ZERO;
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let poll = poll_once(avs.as_ref(), &config, &next_block, &tx);
        let result = tokio::select! {
            _ = shutdown_rx.changed() => break,
            r = poll => r,
        };

        match result {
            Ok(PollOutcome::Continue) => {
                if consecutive_failures > 0 {
                    info!(
                        "Live subscription recovered at block {} after {} failure(s)",
                        next_block.load(Ordering::SeqCst),
                        consecutive_failures
                    );
                }
                consecutive_failures = 0;
                delay = config.poll_interval;
            }
            Ok(PollOutcome::ReceiverGone) => break,
            Err(e) => {
                consecutive_failures += 1;
                delay = retry_delay(&config, consecutive_failures);
                warn!(
                    "Live subscription error: {} (attempt {}). Resubscribing from block {} in {:?}",
                    e,
                    consecutive_failures,
                    next_block.load(Ordering::SeqCst),
                    delay
                );
            }
        }
    }

    debug!("Live poller stopped");
}

/// Scan every block from the cursor up to the current head.
///
/// The cursor moves past a span only after all its events were delivered.
async fn poll_once(
    avs: &dyn AvsContract,
    config: &EventSourceConfig,
    next_block: &AtomicU64,
    tx: &mpsc::Sender<TaskCreatedEvent>,
) -> Result<PollOutcome, ContractError> {
    let head = avs.head_block().await?;
    let from = next_block.load(Ordering::SeqCst);
    if from > head {
        return Ok(PollOutcome::Continue);
    }

    for (start, end) in block_chunks(from, head, config.max_block_range) {
        let events = avs.task_created_events(start, end).await?;
        for event in events {
            debug!(task_id = %event.task_id, block = event.block_number, "Live TaskCreated event");
            if tx.send(event).await.is_err() {
                return Ok(PollOutcome::ReceiverGone);
            }
        }
        next_block.store(end + 1, Ordering::SeqCst);
    }

    Ok(PollOutcome::Continue)
}

fn retry_delay(config: &EventSourceConfig, failures: u32) -> Duration {
    let base = config.poll_interval.max(Duration::from_millis(100));
    let factor = 1u32 << failures.min(6);
    base.saturating_mul(factor).min(config.max_retry_backoff)
}
