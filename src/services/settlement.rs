use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::models::usage::UsageLogEntry;

/// Batch size ceiling for one settlement POST.
const MAX_BATCH: usize = 100;
/// Flush cadence when the batch stays under the ceiling.
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);
/// Redeliveries before an entry is dropped.
const MAX_REDELIVERIES: u32 = 3;
/// Pause after a failed POST so a dead authority is not hammered.
const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// A queued usage record plus its delivery attempt count.
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub entry: UsageLogEntry,
    pub attempt: u32,
}

/// Producer handle for the in-process usage queue. Ownership of an entry
/// transfers to the queue on enqueue; the consumer destroys it on a
/// successful settlement POST.
#[derive(Clone)]
pub struct UsageQueue {
    tx: mpsc::UnboundedSender<QueuedEntry>,
}

impl UsageQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueuedEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue failures never fail the response path: log and drop.
    pub fn enqueue(&self, entry: UsageLogEntry) {
        let request_id = entry.request_id.clone();
        if self
            .tx
            .send(QueuedEntry { entry, attempt: 0 })
            .is_err()
        {
            tracing::error!(request_id = %request_id, "Usage queue closed; dropping usage record");
        }
    }

    fn requeue(&self, queued: QueuedEntry) {
        let request_id = queued.entry.request_id.clone();
        if self.tx.send(queued).is_err() {
            tracing::error!(request_id = %request_id, "Usage queue closed; dropping redelivery");
        }
    }
}

#[derive(Debug, Deserialize)]
struct SettleResponse {
    #[serde(rename = "processedCount")]
    processed_count: Option<u64>,
}

/// Drain the usage queue in batches and settle them against the authority.
/// At-least-once: a failed POST nacks the whole batch back onto the queue
/// with bumped attempt counts, up to `MAX_REDELIVERIES`.
pub async fn run_consumer(
    mut rx: mpsc::UnboundedReceiver<QueuedEntry>,
    queue: UsageQueue,
    http_client: reqwest::Client,
    backend_url: String,
    internal_secret: String,
) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut batch: Vec<QueuedEntry> = Vec::new();

    loop {
        let flushed = tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(queued) => {
                    batch.push(queued);
                    if batch.len() >= MAX_BATCH {
                        Some(flush_batch(&mut batch, &queue, &http_client, &backend_url, &internal_secret).await)
                    } else {
                        None
                    }
                }
                None => {
                    // All producers gone: final flush and exit
                    flush_batch(&mut batch, &queue, &http_client, &backend_url, &internal_secret).await;
                    return;
                }
            },
            _ = interval.tick() => {
                if batch.is_empty() {
                    None
                } else {
                    Some(flush_batch(&mut batch, &queue, &http_client, &backend_url, &internal_secret).await)
                }
            }
        };

        if flushed == Some(false) {
            tokio::time::sleep(RETRY_PAUSE).await;
        }
    }
}

/// POST one batch. Returns true on ack (batch cleared), false on nack
/// (batch redelivered). An empty batch is a no-op success.
async fn flush_batch(
    batch: &mut Vec<QueuedEntry>,
    queue: &UsageQueue,
    http_client: &reqwest::Client,
    backend_url: &str,
    internal_secret: &str,
) -> bool {
    if batch.is_empty() {
        return true;
    }

    let entries: Vec<&UsageLogEntry> = batch.iter().map(|q| &q.entry).collect();
    let count = entries.len();
    let result = http_client
        .post(format!("{backend_url}/internal/usage/settle"))
        .bearer_auth(internal_secret)
        .json(&serde_json::json!({ "entries": entries }))
        .send()
        .await;

    let acked = match result {
        Ok(resp) if resp.status().is_success() => {
            let processed = resp
                .json::<SettleResponse>()
                .await
                .ok()
                .and_then(|r| r.processed_count)
                .unwrap_or(count as u64);
            tracing::info!("Settled {} usage records ({} processed)", count, processed);
            true
        }
        Ok(resp) => {
            tracing::warn!(
                "Settlement POST returned status {}; redelivering {} records",
                resp.status(),
                count
            );
            false
        }
        Err(e) => {
            tracing::warn!("Settlement POST failed: {}; redelivering {} records", e, count);
            false
        }
    };

    if acked {
        batch.clear();
        return true;
    }

    for mut queued in batch.drain(..) {
        if queued.attempt >= MAX_REDELIVERIES {
            tracing::error!(
                request_id = %queued.entry.request_id,
                "Dropping usage record after {} redeliveries",
                queued.attempt
            );
            continue;
        }
        queued.attempt += 1;
        queue.requeue(queued);
    }
    false
}
