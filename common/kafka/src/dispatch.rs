use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ConsumerError, ErrorReporter};
use crate::metrics_consts::{
    HANDLER_DURATION_HISTOGRAM, POLL_ERRORS_COUNTER, RECORDS_DISPATCHED_COUNTER,
    RECORDS_POLLED_COUNTER,
};
use crate::record::Record;
use crate::registry::SubscriptionRegistry;
use crate::transport::Transport;

/// The background poll loop: fetch a batch, hand each record to its topic's handler, repeat.
pub(crate) struct Dispatcher {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) max_records: usize,
    pub(crate) poll_timeout: Duration,
    pub(crate) handler_timeout: Option<Duration>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) reporter: ErrorReporter,
}

impl Dispatcher {
    pub(crate) async fn run(self) {
        info!(
            max_records = self.max_records,
            poll_timeout_ms = self.poll_timeout.as_millis() as u64,
            "Starting background consumer"
        );

        loop {
            // Shutdown is only observed between batches, a running poll or handler is never cut short.
            if self.shutdown.is_cancelled() {
                info!("Shutdown signal received, stopping background consumer");
                break;
            }

            let batch = self
                .transport
                .poll_batch(self.max_records, Some(self.poll_timeout))
                .await;

            if batch.closed {
                info!("Transport closed, stopping background consumer");
                break;
            }

            if !batch.errors.is_empty() {
                for error in batch.errors {
                    let kind = if error.is_info() { "info" } else { "warn" };
                    metrics::counter!(POLL_ERRORS_COUNTER, "kind" => kind).increment(1);
                    self.reporter.report(ConsumerError::Poll(error));
                }
                continue;
            }

            if batch.records.is_empty() {
                continue;
            }
            metrics::counter!(RECORDS_POLLED_COUNTER).increment(batch.records.len() as u64);

            for record in batch.records {
                self.dispatch(record).await;
            }
        }

        info!("Background consumer stopped");
    }

    async fn dispatch(&self, record: Record) {
        // the registry lock is only held for the lookup
        let Some(handler) = self.registry.lookup(record.topic()) else {
            debug!(
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset(),
                "No handler registered for topic, skipping record"
            );
            metrics::counter!(RECORDS_DISPATCHED_COUNTER, "status" => "unhandled").increment(1);
            return;
        };

        let topic = record.topic().to_owned();
        let partition = record.partition();
        let offset = record.offset();
        let started = Instant::now();

        let result = match self.handler_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, handler.handle(record)).await {
                Ok(result) => result.map_err(|source| ConsumerError::Handler {
                    topic: topic.clone(),
                    partition,
                    offset,
                    source,
                }),
                Err(_) => Err(ConsumerError::HandlerTimeout {
                    topic: topic.clone(),
                    partition,
                    offset,
                    timeout,
                }),
            },
            None => handler
                .handle(record)
                .await
                .map_err(|source| ConsumerError::Handler {
                    topic: topic.clone(),
                    partition,
                    offset,
                    source,
                }),
        };

        metrics::histogram!(HANDLER_DURATION_HISTOGRAM, "topic" => topic)
            .record(started.elapsed().as_secs_f64());

        let status = match &result {
            Ok(()) => "success",
            Err(ConsumerError::HandlerTimeout { .. }) => "timeout",
            Err(_) => "failure",
        };
        metrics::counter!(RECORDS_DISPATCHED_COUNTER, "status" => status).increment(1);

        if let Err(e) = result {
            self.reporter.report(e);
        }
    }
}
