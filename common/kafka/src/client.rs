use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, info};

use crate::commit::{commit_queue, Acknowledger, CommitBatcher};
use crate::config::{ClientOptions, PING_TIMEOUT};
use crate::dispatch::Dispatcher;
use crate::error::{ConsumerError, ErrorReporter};
use crate::record::{PollBatch, Record};
use crate::registry::{MessageHandler, SubscriptionRegistry};
use crate::transport::{KafkaTransport, Transport};

/// A Kafka consumer client.
///
/// Records are consumed either by the background consumer started with
/// [`Client::start_consumer`], which dispatches them to the handlers registered per topic, or
/// on demand with [`Client::poll_once`] / [`Client::fetch_batch`]. The two modes are mutually
/// exclusive.
///
/// With manual commit enabled, processed records are handed back through
/// [`Client::acknowledge`] and committed in batches by a background task. Every record
/// acknowledged before [`Client::close`] is called is committed before it returns.
pub struct Client {
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    acknowledger: Option<Acknowledger>,
    shutdown: CancellationToken,
    reporter: ErrorReporter,
    max_fetch_count: usize,
    poll_timeout: Duration,
    handler_timeout: Option<Duration>,
    consumer_running: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Connect to the brokers described by `options`.
    pub async fn connect(options: ClientOptions) -> Result<Self, ConsumerError> {
        options.validate()?;
        let transport =
            KafkaTransport::new(&options.kafka_config()).map_err(ConsumerError::Connect)?;

        Self::with_transport(Arc::new(transport), options).await
    }

    /// Build a client on top of an existing transport.
    ///
    /// The transport is pinged first and closed again if the client cannot be set up.
    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        options: ClientOptions,
    ) -> Result<Self, ConsumerError> {
        options.validate()?;

        if let Err(e) = transport.ping(PING_TIMEOUT).await {
            transport.close(false).await;
            return Err(ConsumerError::Connect(e));
        }

        let registry = match options.subscriptions {
            Some(subscriptions) => {
                for topic in subscriptions.keys() {
                    if let Err(source) = transport.subscribe_topic(topic) {
                        transport.close(false).await;
                        return Err(ConsumerError::Subscription {
                            topic: topic.clone(),
                            source,
                        });
                    }
                }
                SubscriptionRegistry::with_static(subscriptions)
            }
            None => SubscriptionRegistry::dynamic(),
        };

        let shutdown = CancellationToken::new();
        let reporter = ErrorReporter::new(options.on_error);
        let mut tasks = vec![];

        let acknowledger = if options.manual_commit {
            let batch_size = options
                .commit_batch_size
                .unwrap_or(options.max_fetch_count);
            let (acknowledger, rx) = commit_queue();
            let batcher = CommitBatcher::new(
                transport.clone(),
                rx,
                batch_size,
                options.commit_interval,
                shutdown.clone(),
                reporter.clone(),
            );
            tasks.push(tokio::spawn(batcher.run()));
            Some(acknowledger)
        } else {
            None
        };

        info!(
            client_id = %options.client_id,
            seeds = %options.seeds.join(","),
            manual_commit = options.manual_commit,
            static_subscriptions = registry.is_static(),
            "Kafka consumer client created"
        );

        Ok(Self {
            transport,
            registry: Arc::new(registry),
            acknowledger,
            shutdown,
            reporter,
            max_fetch_count: options.max_fetch_count,
            poll_timeout: options.poll_timeout,
            handler_timeout: options.handler_timeout,
            consumer_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        })
    }

    /// Register `handler` for `topic` and start consuming it.
    ///
    /// Replaces any handler already registered for the topic. A no-op for clients built with
    /// a static subscription set.
    pub fn add_subscription<H>(&self, topic: &str, handler: H) -> Result<(), ConsumerError>
    where
        H: MessageHandler + 'static,
    {
        self.ensure_open()?;
        self.registry
            .add(self.transport.as_ref(), topic, Arc::new(handler))
    }

    /// Stop consuming `topic` and drop its handler.
    ///
    /// Records fetched before this returns may still be handed to the old handler.
    pub fn remove_subscription(&self, topic: &str) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        self.registry.remove(self.transport.as_ref(), topic)
    }

    /// Start consuming `topic` without a handler, for clients built with a static
    /// subscription set. A no-op for clients managing topics through subscriptions.
    pub fn add_consume_topic(&self, topic: &str) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        if !self.registry.is_static() {
            debug!(topic = topic, "Dynamic subscriptions, ignoring add_consume_topic");
            return Ok(());
        }

        self.transport
            .subscribe_topic(topic)
            .map_err(|source| ConsumerError::Subscription {
                topic: topic.to_owned(),
                source,
            })
    }

    pub fn remove_consume_topic(&self, topic: &str) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        if !self.registry.is_static() {
            debug!(topic = topic, "Dynamic subscriptions, ignoring remove_consume_topic");
            return Ok(());
        }

        self.transport
            .unsubscribe_topic(topic)
            .map_err(|source| ConsumerError::Subscription {
                topic: topic.to_owned(),
                source,
            })
    }

    /// Topics that currently have a handler, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.registry.topics()
    }

    /// Start the background consumer.
    ///
    /// Handlers run one at a time on the consumer task. A handler must not call
    /// [`Client::close`] itself, since `close` waits for that task to finish.
    ///
    /// A [`Client::poll_once`] or [`Client::fetch_batch`] call already waiting on the
    /// transport is not interrupted. It keeps polling alongside the background consumer, and
    /// whichever poll the transport answers first gets the records. Let pending synchronous
    /// fetches return, or give them a deadline, before starting the consumer.
    pub fn start_consumer(&self) -> Result<(), ConsumerError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumerError::ClientClosed);
        }
        if self.consumer_running.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::BackgroundConsumerActive);
        }

        let dispatcher = Dispatcher {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            max_records: self.max_fetch_count,
            poll_timeout: self.poll_timeout,
            handler_timeout: self.handler_timeout,
            shutdown: self.shutdown.clone(),
            reporter: self.reporter.clone(),
        };
        tasks.push(tokio::spawn(dispatcher.run()));

        Ok(())
    }

    pub fn is_consumer_running(&self) -> bool {
        self.consumer_running.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the background tasks, commit everything acknowledged so far and close the
    /// transport, letting a consumer-group rebalance complete.
    ///
    /// Only the first call does anything; later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Closing Kafka consumer client");
        self.shutdown.cancel();

        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Kafka consumer task failed");
            }
        }

        self.transport.close(true).await;
        info!("Kafka consumer client closed");
    }

    /// Resolves once [`Client::close`] has started shutting the client down.
    pub fn shutdown_signal(&self) -> WaitForCancellationFutureOwned {
        self.shutdown.clone().cancelled_owned()
    }

    /// Queue `records` for commit, in order.
    ///
    /// Waits while the commit batcher is busy. Fails with `ManualCommitDisabled` unless the
    /// client was built with manual commit, and with `ClientClosed` once the client is
    /// shutting down.
    pub async fn acknowledge<I>(&self, records: I) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = Record>,
    {
        let acknowledger = self
            .acknowledger
            .as_ref()
            .ok_or(ConsumerError::ManualCommitDisabled)?;
        self.ensure_open()?;

        acknowledger.acknowledge_all(records).await
    }

    /// A handle handlers can capture to acknowledge records, if manual commit is enabled.
    pub fn acknowledger(&self) -> Option<Acknowledger> {
        self.acknowledger.clone()
    }

    /// Fetch one batch and call `f` for each record, waiting until the transport returns
    /// records, an error, or closure.
    pub async fn poll_once<F>(&self, f: F) -> Result<(), ConsumerError>
    where
        F: FnMut(Record),
    {
        let records = self.fetch(None).await?;
        records.into_iter().for_each(f);
        Ok(())
    }

    /// Like [`Client::poll_once`], but gives up after `deadline` with no records.
    pub async fn poll_once_with_deadline<F>(
        &self,
        deadline: Duration,
        f: F,
    ) -> Result<(), ConsumerError>
    where
        F: FnMut(Record),
    {
        let records = self.fetch(Some(deadline)).await?;
        records.into_iter().for_each(f);
        Ok(())
    }

    /// Fetch one batch of up to `max_fetch_count` records, waiting for at least one.
    ///
    /// Fails with `ClientClosed` if the client is closed while the call waits. The check
    /// against a running background consumer happens only on entry, see
    /// [`Client::start_consumer`].
    pub async fn fetch_batch(&self) -> Result<Vec<Record>, ConsumerError> {
        self.fetch(None).await
    }

    pub async fn fetch_batch_with_deadline(
        &self,
        deadline: Duration,
    ) -> Result<Vec<Record>, ConsumerError> {
        self.fetch(Some(deadline)).await
    }

    async fn fetch(&self, deadline: Option<Duration>) -> Result<Vec<Record>, ConsumerError> {
        if self.consumer_running.load(Ordering::SeqCst) {
            return Err(ConsumerError::BackgroundConsumerActive);
        }
        self.ensure_open()?;

        let PollBatch {
            records,
            errors,
            closed,
        } = self
            .transport
            .poll_batch(self.max_fetch_count, deadline)
            .await;

        if closed {
            return Err(ConsumerError::ClientClosed);
        }
        if let Some(first) = errors.into_iter().next() {
            return Err(ConsumerError::Poll(first));
        }

        Ok(records)
    }

    fn ensure_open(&self) -> Result<(), ConsumerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumerError::ClientClosed);
        }
        Ok(())
    }
}
