use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::record::{PollBatch, Record};
use crate::transport::Transport;

/// Routes librdkafka logs and group events into `tracing`.
pub struct ConsumerLogContext;

impl ClientContext for ConsumerLogContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!(facility = fac, "librdkafka: {log_message}"),
            RDKafkaLogLevel::Warning => warn!(facility = fac, "librdkafka: {log_message}"),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(facility = fac, "librdkafka: {log_message}")
            }
            RDKafkaLogLevel::Debug => debug!(facility = fac, "librdkafka: {log_message}"),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        warn!(error = %error, reason = reason, "librdkafka client error");
    }
}

impl ConsumerContext for ConsumerLogContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "Pre-rebalance: assign")
            }
            Rebalance::Revoke(partitions) => {
                info!(partitions = partitions.count(), "Pre-rebalance: revoke")
            }
            Rebalance::Error(e) => warn!(error = %e, "Pre-rebalance error"),
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "Post-rebalance: assigned")
            }
            Rebalance::Revoke(partitions) => {
                info!(partitions = partitions.count(), "Post-rebalance: revoked")
            }
            Rebalance::Error(e) => warn!(error = %e, "Post-rebalance error"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "Offsets committed"),
            Err(e) => warn!(error = %e, partitions = offsets.count(), "Offset commit failed"),
        }
    }
}

type KafkaConsumer = StreamConsumer<ConsumerLogContext>;

// How long close waits for in-flight polls and commits to release the consumer.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// [`Transport`] backed by an rdkafka [`StreamConsumer`].
///
/// rdkafka replaces the whole subscription on every `subscribe` call, so the transport keeps
/// the current topic set and re-subscribes to all of it whenever a topic is added or removed.
///
/// Pending polls hold their own reference to the consumer, so `close` cancels `shutdown` to
/// wake them with a closed batch before it drops the consumer.
pub struct KafkaTransport {
    consumer: RwLock<Option<Arc<KafkaConsumer>>>,
    topics: Mutex<BTreeSet<String>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl KafkaTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let consumer: KafkaConsumer = config.create_with_context(ConsumerLogContext)?;

        Ok(Self {
            consumer: RwLock::new(Some(Arc::new(consumer))),
            topics: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    fn consumer(&self) -> Option<Arc<KafkaConsumer>> {
        self.consumer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn resubscribe(&self, topics: &BTreeSet<String>) -> Result<(), TransportError> {
        let consumer = self.consumer().ok_or(TransportError::Closed)?;
        if topics.is_empty() {
            consumer.unsubscribe();
            return Ok(());
        }

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&names)?;
        Ok(())
    }

    /// Push one receive result into `batch`, returning whether polling should go on.
    fn push_result(batch: &mut PollBatch, result: KafkaResult<BorrowedMessage<'_>>) -> bool {
        match result {
            Ok(message) => {
                batch.records.push(record_from_message(&message));
                true
            }
            Err(KafkaError::Canceled) => {
                batch.closed = true;
                false
            }
            Err(e) => {
                batch.errors.push(e.into());
                false
            }
        }
    }
}

fn record_from_message(message: &BorrowedMessage<'_>) -> Record {
    let mut record = Record::new(message.topic(), message.partition(), message.offset());

    if let Some(key) = message.key() {
        record = record.with_key(key);
    }
    if let Some(payload) = message.payload() {
        record = record.with_value(payload);
    }
    if let Some(timestamp) = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
    {
        record = record.with_timestamp(timestamp);
    }
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            record = record.with_header(header.key, header.value.map(<[u8]>::to_vec));
        }
    }

    record
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn poll_batch(&self, max_records: usize, deadline: Option<Duration>) -> PollBatch {
        if self.closed.load(Ordering::SeqCst) {
            return PollBatch::closed();
        }
        let Some(consumer) = self.consumer() else {
            return PollBatch::closed();
        };

        let max_records = max_records.max(1);
        let mut batch = PollBatch::new_with_size_hint(max_records);

        let first = match deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return PollBatch::closed(),
                received = tokio::time::timeout(deadline, consumer.recv()) => match received {
                    Ok(result) => result,
                    Err(_) => return batch,
                },
            },
            None => tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return PollBatch::closed(),
                result = consumer.recv() => result,
            },
        };
        if !Self::push_result(&mut batch, first) {
            return batch;
        }

        // Only take what librdkafka already has buffered, never wait for more.
        while batch.records.len() < max_records {
            match consumer.recv().now_or_never() {
                Some(result) => {
                    if !Self::push_result(&mut batch, result) {
                        break;
                    }
                }
                None => break,
            }
        }

        batch
    }

    async fn commit_offsets(&self, records: &[Record]) -> Result<(), TransportError> {
        if records.is_empty() {
            return Ok(());
        }
        let consumer = self.consumer().ok_or(TransportError::Closed)?;

        let mut next_offsets: BTreeMap<(&str, i32), i64> = BTreeMap::new();
        for record in records {
            let next = next_offsets
                .entry((record.topic(), record.partition()))
                .or_insert(record.next_offset());
            *next = (*next).max(record.next_offset());
        }

        let mut list = TopicPartitionList::new();
        for ((topic, partition), offset) in next_offsets {
            list.add_partition_offset(topic, partition, Offset::Offset(offset))?;
        }

        consumer.commit(&list, CommitMode::Sync)?;
        Ok(())
    }

    fn subscribe_topic(&self, topic: &str) -> Result<(), TransportError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if !topics.insert(topic.to_owned()) {
            return Ok(());
        }

        if let Err(e) = self.resubscribe(&topics) {
            topics.remove(topic);
            return Err(e);
        }
        Ok(())
    }

    fn unsubscribe_topic(&self, topic: &str) -> Result<(), TransportError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if !topics.remove(topic) {
            return Ok(());
        }

        if let Err(e) = self.resubscribe(&topics) {
            topics.insert(topic.to_owned());
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self, allow_rebalance: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let consumer = self
            .consumer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(consumer) = consumer else {
            return;
        };

        if allow_rebalance {
            // Leaving the subscription lets the group revoke our partitions before we go.
            consumer.unsubscribe();
        }

        let released = tokio::time::timeout(RELEASE_TIMEOUT, async {
            while Arc::strong_count(&consumer) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        if released.is_err() {
            warn!("Kafka consumer still in use, closing when the last user drops it");
        }

        // Dropping the last reference runs the blocking librdkafka consumer close.
        if let Err(e) = tokio::task::spawn_blocking(move || drop(consumer)).await {
            error!(error = %e, "Failed to close Kafka consumer");
        }
        info!(allow_rebalance = allow_rebalance, "Kafka transport closed");
    }

    async fn ping(&self, timeout: Duration) -> Result<(), TransportError> {
        let consumer = self.consumer().ok_or(TransportError::Closed)?;

        let brokers = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| TransportError::Other(format!("metadata fetch task failed: {e}")))??;

        debug!(brokers = brokers, "Kafka ping succeeded");
        Ok(())
    }
}
