//! Batched offset commits for manual-commit clients.
//!
//! Acknowledged records travel through a capacity-1 channel to the [`CommitBatcher`] task,
//! which commits them in bulk when the batch fills up, when the commit interval ticks, and
//! once more on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ConsumerError, ErrorReporter};
use crate::metrics_consts::{
    COMMIT_FLUSHES_COUNTER, COMMIT_FLUSH_SIZE_HISTOGRAM, RECORDS_ACKNOWLEDGED_COUNTER,
};
use crate::record::Record;
use crate::transport::Transport;

// A synchronization point rather than a buffer: acknowledging callers wait once the
// batcher falls behind.
const COMMIT_QUEUE_CAPACITY: usize = 1;

pub(crate) fn commit_queue() -> (Acknowledger, mpsc::Receiver<Record>) {
    let (tx, rx) = mpsc::channel(COMMIT_QUEUE_CAPACITY);
    (Acknowledger { tx }, rx)
}

/// Cloneable handle for acknowledging processed records.
///
/// Handlers can capture one to acknowledge the record they were given. Acknowledging
/// waits while the commit batcher is busy, and fails with [`ConsumerError::ClientClosed`]
/// once the batcher has shut down.
#[derive(Clone, Debug)]
pub struct Acknowledger {
    tx: mpsc::Sender<Record>,
}

impl Acknowledger {
    pub async fn acknowledge(&self, record: Record) -> Result<(), ConsumerError> {
        self.tx
            .send(record)
            .await
            .map_err(|_| ConsumerError::ClientClosed)?;
        metrics::counter!(RECORDS_ACKNOWLEDGED_COUNTER).increment(1);
        Ok(())
    }

    /// Acknowledge `records` in order, stopping at the first failure.
    pub async fn acknowledge_all<I>(&self, records: I) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = Record>,
    {
        for record in records {
            self.acknowledge(record).await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Interval,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

pub(crate) struct CommitBatcher {
    rx: mpsc::Receiver<Record>,
    batch_size: usize,
    interval: Duration,
    shutdown: CancellationToken,
    pending: PendingCommits,
}

impl CommitBatcher {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        rx: mpsc::Receiver<Record>,
        batch_size: usize,
        interval: Duration,
        shutdown: CancellationToken,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            rx,
            batch_size: batch_size.max(1),
            interval,
            shutdown,
            pending: PendingCommits {
                transport,
                reporter,
                records: Vec::with_capacity(batch_size),
            },
        }
    }

    pub(crate) async fn run(self) {
        let CommitBatcher {
            mut rx,
            batch_size,
            interval,
            shutdown,
            mut pending,
        } = self;

        info!(
            batch_size = batch_size,
            interval_ms = interval.as_millis() as u64,
            "Starting commit batcher"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            // a busy queue always wins the biased select, so check shutdown explicitly
            if shutdown.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;

                received = rx.recv() => match received {
                    Some(record) => {
                        pending.records.push(record);
                        if pending.records.len() >= batch_size {
                            pending.flush(FlushTrigger::Size).await;
                        }
                    }
                    None => break,
                },

                _ = ticker.tick() => {
                    pending.flush(FlushTrigger::Interval).await;
                }

                _ = shutdown.cancelled() => break,
            }
        }

        // Acknowledgements that already made it into the queue are part of the final flush;
        // later ones fail with ClientClosed.
        rx.close();
        while let Ok(record) = rx.try_recv() {
            pending.records.push(record);
        }
        pending.flush(FlushTrigger::Shutdown).await;

        info!("Commit batcher stopped");
    }
}

struct PendingCommits {
    transport: Arc<dyn Transport>,
    reporter: ErrorReporter,
    records: Vec<Record>,
}

impl PendingCommits {
    async fn flush(&mut self, trigger: FlushTrigger) {
        if self.records.is_empty() {
            return;
        }

        // Failed flushes are not retried, the buffer is cleared either way.
        let records = std::mem::take(&mut self.records);
        let count = records.len();
        metrics::histogram!(COMMIT_FLUSH_SIZE_HISTOGRAM).record(count as f64);

        match self.transport.commit_offsets(&records).await {
            Ok(()) => {
                metrics::counter!(
                    COMMIT_FLUSHES_COUNTER,
                    "status" => "success",
                    "trigger" => trigger.as_str()
                )
                .increment(1);
                debug!(count = count, trigger = trigger.as_str(), "Committed offsets");
            }
            Err(source) => {
                metrics::counter!(
                    COMMIT_FLUSHES_COUNTER,
                    "status" => "failure",
                    "trigger" => trigger.as_str()
                )
                .increment(1);
                self.reporter
                    .report(ConsumerError::Commit { count, source });
            }
        }
    }
}
