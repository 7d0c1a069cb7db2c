//! Buffered, at-least-once queue lanes.
//!
//! A lane collects messages into batches (full batch or batching window
//! elapsed, whichever comes first), hands each batch to its [`BatchHandler`]
//! and settles every message individually from the reported outcome:
//!
//! * acknowledged messages are gone;
//! * failed messages whose receive count reached `max_receive_count` move
//!   verbatim to the dead-letter lane, the others are re-enqueued;
//! * messages older than the retention period are dropped before dispatch.
//!
//! A timed-out invocation fails its whole batch. A lane stops once every
//! [`LaneSender`] is dropped and the in-flight invocations have settled, and
//! it releases its dead-letter sender on the way out so shutdown cascades.

use crate::config::LaneConfig;
use crate::envelope::TopicMessage;
use crate::handler::BatchHandler;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{self, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors raised when handing a message to a lane
#[derive(Error, Debug)]
pub enum LaneError {
    #[error("Lane {0} is closed")]
    Closed(String),
}

/// A message buffered in a lane
#[derive(Debug, Clone)]
pub struct LaneMessage {
    pub message: TopicMessage,
    /// Times this message has been handed to the lane's consumer
    pub receive_count: u32,
    enqueued_at: Instant,
}

impl LaneMessage {
    pub fn new(message: TopicMessage) -> Self {
        Self {
            message,
            receive_count: 0,
            enqueued_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.message.message_id
    }
}

/// Producer side of a lane
#[derive(Debug, Clone)]
pub struct LaneSender {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<LaneMessage>,
}

impl LaneSender {
    /// Enqueue a message
    pub fn send(&self, message: TopicMessage) -> Result<(), LaneError> {
        self.tx
            .send(LaneMessage::new(message))
            .map_err(|_| LaneError::Closed(self.name.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Counters describing what a lane did over its lifetime
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaneStats {
    pub batches: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub expired: u64,
    /// Failed messages lost because no dead-letter lane could take them
    pub dropped: u64,
}

#[derive(Default)]
struct LaneCounters {
    batches: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    expired: AtomicU64,
    dropped: AtomicU64,
}

impl LaneCounters {
    fn snapshot(&self) -> LaneStats {
        LaneStats {
            batches: self.batches.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the lane loop and its in-flight invocations
struct LaneContext {
    name: Arc<str>,
    config: LaneConfig,
    requeue: mpsc::WeakUnboundedSender<LaneMessage>,
    dead_letter: Option<LaneSender>,
    counters: LaneCounters,
}

impl LaneContext {
    fn settle(&self, mut message: LaneMessage) {
        if message.receive_count < self.config.max_receive_count {
            if let Some(tx) = self.requeue.upgrade() {
                if tx.send(message.clone()).is_ok() {
                    self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        lane = %self.name,
                        message_id = %message.id(),
                        receive_count = message.receive_count,
                        "Message re-enqueued"
                    );
                    return;
                }
            }
            warn!(
                lane = %self.name,
                message_id = %message.id(),
                "Lane is closing, escalating instead of re-enqueueing"
            );
        }

        match &self.dead_letter {
            Some(dead_letter) => {
                // The dead-letter lane counts its own receives
                message.receive_count = 0;
                message.enqueued_at = Instant::now();
                let message_id = message.id();

                if dead_letter.tx.send(message).is_ok() {
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("lane.messages.dead_lettered", "lane" => self.name.to_string())
                        .increment(1);
                    warn!(
                        lane = %self.name,
                        dead_letter_lane = %dead_letter.name(),
                        message_id = %message_id,
                        "Message moved to dead-letter lane"
                    );
                } else {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    error!(
                        lane = %self.name,
                        message_id = %message_id,
                        "Dead-letter lane closed, message dropped"
                    );
                }
            }
            None => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    lane = %self.name,
                    message_id = %message.id(),
                    receive_count = message.receive_count,
                    "Message failed on a lane without dead-letter target, dropped"
                );
            }
        }
    }
}

/// Consumer side of a lane
pub struct QueueLane {
    name: Arc<str>,
    config: LaneConfig,
    rx: mpsc::UnboundedReceiver<LaneMessage>,
    requeue: mpsc::WeakUnboundedSender<LaneMessage>,
    dead_letter: Option<LaneSender>,
}

impl QueueLane {
    /// Create a lane and the sender feeding it
    pub fn new(name: impl Into<String>, config: LaneConfig) -> (LaneSender, Self) {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = mpsc::unbounded_channel();
        let requeue = tx.downgrade();

        let sender = LaneSender {
            name: name.clone(),
            tx,
        };
        let lane = Self {
            name,
            config,
            rx,
            requeue,
            dead_letter: None,
        };

        (sender, lane)
    }

    /// Escalate exhausted messages to another lane
    pub fn with_dead_letter(mut self, dead_letter: LaneSender) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume the lane until every sender is dropped
    #[instrument(skip_all, fields(lane = %self.name))]
    pub async fn run(mut self, handler: Arc<dyn BatchHandler>) -> LaneStats {
        info!(
            batch_size = self.config.batch_size,
            batching_window_secs = self.config.batching_window_secs,
            max_receive_count = self.config.max_receive_count,
            max_concurrency = ?self.config.max_concurrency,
            "Starting queue lane"
        );

        let semaphore = self
            .config
            .max_concurrency
            .map(|permits| Arc::new(Semaphore::new(permits)));
        let invocations = TaskTracker::new();
        let context = Arc::new(LaneContext {
            name: self.name.clone(),
            config: self.config.clone(),
            requeue: self.requeue.clone(),
            dead_letter: self.dead_letter.take(),
            counters: LaneCounters::default(),
        });

        while let Some(batch) = self.next_batch().await {
            let batch = self.discard_expired(batch, &context);
            if batch.is_empty() {
                continue;
            }

            // Waiting here stops batch formation while the lane is saturated
            let permit = match &semaphore {
                Some(semaphore) => match semaphore.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                None => None,
            };

            let context = context.clone();
            let handler = handler.clone();
            invocations.spawn(async move {
                let _permit = permit;
                invoke(&context, handler.as_ref(), batch).await;
            });
        }

        invocations.close();
        invocations.wait().await;

        let stats = context.counters.snapshot();
        info!(?stats, "Queue lane stopped");
        stats
    }

    async fn next_batch(&mut self) -> Option<Vec<LaneMessage>> {
        let first = self.rx.recv().await?;
        let deadline = Instant::now() + self.config.batching_window();

        let mut batch = Vec::with_capacity(self.config.batch_size);
        batch.push(first);

        while batch.len() < self.config.batch_size {
            match time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(message)) => batch.push(message),
                Ok(None) | Err(_) => break,
            }
        }

        Some(batch)
    }

    fn discard_expired(&self, batch: Vec<LaneMessage>, context: &LaneContext) -> Vec<LaneMessage> {
        let retention = self.config.retention();

        batch
            .into_iter()
            .filter(|message| {
                if message.enqueued_at.elapsed() < retention {
                    return true;
                }
                context.counters.expired.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("lane.messages.expired", "lane" => self.name.to_string())
                    .increment(1);
                warn!(
                    message_id = %message.id(),
                    retention_secs = self.config.retention_secs,
                    "Message exceeded retention and was dropped"
                );
                false
            })
            .collect()
    }
}

async fn invoke(context: &LaneContext, handler: &dyn BatchHandler, mut batch: Vec<LaneMessage>) {
    for message in &mut batch {
        message.receive_count += 1;
    }
    context.counters.batches.fetch_add(1, Ordering::Relaxed);

    let started = Instant::now();
    let failed: HashSet<Uuid> =
        match time::timeout(context.config.timeout(), handler.handle_batch(&batch)).await {
            Ok(outcome) => outcome.failed.into_iter().collect(),
            Err(_) => {
                error!(
                    lane = %context.name,
                    batch_size = batch.len(),
                    timeout_secs = context.config.timeout_secs,
                    "Batch invocation timed out"
                );
                batch.iter().map(LaneMessage::id).collect()
            }
        };

    metrics::histogram!("lane.invocation.duration_seconds", "lane" => context.name.to_string())
        .record(started.elapsed().as_secs_f64());

    debug!(
        lane = %context.name,
        batch_size = batch.len(),
        failed = failed.len(),
        "Batch settled"
    );

    for message in batch {
        if failed.contains(&message.id()) {
            context.counters.failed.fetch_add(1, Ordering::Relaxed);
            context.settle(message);
        } else {
            context.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        }
    }
}
