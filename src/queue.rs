//! Durable topic queue worker
//!
//! Storage lives in [`crate::data::Database`] (`enqueue`, `peek`,
//! `reschedule`, `dequeue`). This module runs exactly one consumer per topic,
//! so a peeked item is never seen by a second worker in the same process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::data::{Database, QueueItem};
use crate::metrics::QUEUE_DEPTH;
use crate::shutdown::sleep_or_cancel;

/// What to do with an item after processing it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Remove the item
    Done,
    /// Make the item visible again after `delay`, optionally with a new payload
    Retry {
        delay: chrono::Duration,
        payload: Option<Vec<u8>>,
    },
}

/// Consumer of one queue topic
#[async_trait]
pub trait QueueProcessor: Send + Sync {
    async fn process(&self, item: &QueueItem) -> QueueOutcome;
}

/// Timing of a queue worker
#[derive(Debug, Clone, Copy)]
pub struct WorkerTiming {
    /// Sleep when nothing is visible
    pub poll_interval: Duration,
    /// Sleep after each processed item
    pub pacing: Duration,
}

/// Consume `topic` until `shutdown` is cancelled.
///
/// The item in flight is always finished; cancellation is only observed
/// between items.
pub async fn run_worker(
    db: Arc<Database>,
    topic: String,
    processor: Arc<dyn QueueProcessor>,
    timing: WorkerTiming,
    shutdown: CancellationToken,
) {
    tracing::info!(%topic, "Queue worker started");

    while !shutdown.is_cancelled() {
        let item = match db.peek(&topic).await {
            Ok(item) => item,
            Err(error) => {
                tracing::error!(%topic, %error, "Failed to peek queue");
                None
            }
        };

        let Some(item) = item else {
            if !sleep_or_cancel(timing.poll_interval, &shutdown).await {
                break;
            }
            continue;
        };

        let outcome = processor.process(&item).await;
        if let Err(error) = apply_outcome(&db, &item, outcome).await {
            tracing::error!(%topic, item = item.id, %error, "Failed to settle queue item");
        }

        if let Ok(depth) = db.queue_len(&topic).await {
            QUEUE_DEPTH.with_label_values(&[topic.as_str()]).set(depth);
        }

        if !sleep_or_cancel(timing.pacing, &shutdown).await {
            break;
        }
    }

    tracing::info!(%topic, "Queue worker stopped");
}

async fn apply_outcome(
    db: &Database,
    item: &QueueItem,
    outcome: QueueOutcome,
) -> crate::error::Result<()> {
    match outcome {
        QueueOutcome::Done => db.dequeue(item).await,
        QueueOutcome::Retry { delay, payload } => {
            db.reschedule(item, delay, payload.as_deref()).await
        }
    }
}
