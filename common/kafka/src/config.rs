use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::{ConsumerError, ErrorSink};
use crate::registry::{MessageHandler, Subscriptions};

pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Defaults to the pod host name
    pub kafka_client_id: Option<String>,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(default = "kafka-consumer")]
    pub kafka_consumer_group: String,

    // Comma separated
    #[envconfig(default = "")]
    pub kafka_consumer_topics: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "true")]
    pub kafka_consumer_manual_commit: bool,

    #[envconfig(default = "1")]
    pub kafka_consumer_max_fetch_count: usize,

    // Defaults to the max fetch count
    pub kafka_consumer_commit_batch_size: Option<usize>,

    #[envconfig(default = "100")]
    pub kafka_consumer_commit_interval_ms: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub kafka_consumer_poll_timeout_ms: EnvMsDuration,

    pub kafka_consumer_handler_timeout_ms: Option<EnvMsDuration>,
}

impl ConsumerConfig {
    pub fn topics(&self) -> Vec<String> {
        self.kafka_consumer_topics
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect()
    }

    pub fn to_client_options(&self, kafka: &KafkaConfig) -> Result<ClientOptions, ConsumerError> {
        let mut options = ClientOptions::new()
            .with_seeds(kafka.kafka_hosts.split(',').map(str::trim))
            .with_group(&self.kafka_consumer_group)
            .with_tls(kafka.kafka_tls)
            .with_max_fetch_count(self.kafka_consumer_max_fetch_count)
            .with_commit_interval(self.kafka_consumer_commit_interval_ms.0)
            .with_poll_timeout(self.kafka_consumer_poll_timeout_ms.0)
            .with_offset_reset(self.kafka_consumer_offset_reset.parse()?);

        if let Some(client_id) = &kafka.kafka_client_id {
            options = options.with_client_id(client_id);
        }
        if self.kafka_consumer_manual_commit {
            options = options.with_manual_commit();
        }
        if let Some(batch_size) = self.kafka_consumer_commit_batch_size {
            options = options.with_commit_batch_size(batch_size);
        }
        if let Some(timeout) = self.kafka_consumer_handler_timeout_ms {
            options = options.with_handler_timeout(timeout.0);
        }

        options.validate()?;
        Ok(options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => Err(ConsumerError::InvalidConfig(format!(
                "unknown offset reset policy: {other}"
            ))),
        }
    }
}

/// Options for building a [`Client`](crate::client::Client).
///
/// Defaults match the behaviour services expect out of the box: one record per poll,
/// auto commit, a 100ms commit interval for manual commit and a 1s background poll deadline.
#[derive(Clone)]
pub struct ClientOptions {
    pub(crate) seeds: Vec<String>,
    pub(crate) client_id: String,
    pub(crate) group: Option<String>,
    pub(crate) max_fetch_count: usize,
    pub(crate) commit_batch_size: Option<usize>,
    pub(crate) commit_interval: Duration,
    pub(crate) poll_timeout: Duration,
    pub(crate) manual_commit: bool,
    pub(crate) offset_reset: OffsetReset,
    pub(crate) tls: bool,
    pub(crate) subscriptions: Option<Subscriptions>,
    pub(crate) on_error: Option<ErrorSink>,
    pub(crate) handler_timeout: Option<Duration>,
    pub(crate) overrides: Vec<(String, String)>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self {
            seeds: vec!["localhost:9092".to_string()],
            client_id: default_client_id(),
            group: None,
            max_fetch_count: 1,
            commit_batch_size: None,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            manual_commit: false,
            offset_reset: OffsetReset::Earliest,
            tls: false,
            subscriptions: None,
            on_error: None,
            handler_timeout: None,
            overrides: vec![],
        }
    }

    pub fn with_seeds<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = client_id.to_owned();
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_owned());
        self
    }

    /// Maximum number of records fetched per poll.
    pub fn with_max_fetch_count(mut self, max: usize) -> Self {
        self.max_fetch_count = max;
        self
    }

    /// Number of acknowledged records that triggers an immediate commit.
    pub fn with_commit_batch_size(mut self, size: usize) -> Self {
        self.commit_batch_size = Some(size);
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    /// How long a single background poll waits for records before checking for shutdown.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Disable auto commit; acknowledged records are committed in batches instead.
    pub fn with_manual_commit(mut self) -> Self {
        self.manual_commit = true;
        self
    }

    pub fn with_offset_reset(mut self, policy: OffsetReset) -> Self {
        self.offset_reset = policy;
        self
    }

    pub fn reset_offsets_to_end(self) -> Self {
        self.with_offset_reset(OffsetReset::Latest)
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// Use a fixed subscription set. `add_subscription`/`remove_subscription` become no-ops
    /// and topics are managed with `add_consume_topic`/`remove_consume_topic` instead.
    /// An empty set gives a client whose topics are managed entirely by hand.
    pub fn with_subscriptions(mut self, subscriptions: Subscriptions) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    /// Add one entry to the fixed subscription set.
    pub fn with_subscription<H>(mut self, topic: &str, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        self.subscriptions
            .get_or_insert_with(HashMap::new)
            .insert(topic.to_owned(), Arc::new(handler));
        self
    }

    /// Receive errors from the background tasks, which are otherwise only logged.
    pub fn with_on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConsumerError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Abandon handlers that run longer than `timeout` and report a `HandlerTimeout`.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Add any custom librdkafka configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.overrides.push((key.to_owned(), value.to_owned()));
        self
    }

    pub fn max_fetch_count(&self) -> usize {
        self.max_fetch_count
    }

    pub fn commit_batch_size(&self) -> usize {
        self.commit_batch_size.unwrap_or(self.max_fetch_count)
    }

    pub fn is_manual_commit(&self) -> bool {
        self.manual_commit
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.seeds.is_empty() || self.seeds.iter().any(|s| s.is_empty()) {
            return Err(ConsumerError::InvalidConfig(
                "at least one non-empty seed broker is required".to_string(),
            ));
        }
        if self.max_fetch_count == 0 {
            return Err(ConsumerError::InvalidConfig(
                "max fetch count must be at least 1".to_string(),
            ));
        }
        if self.commit_batch_size() == 0 {
            return Err(ConsumerError::InvalidConfig(
                "commit batch size must be at least 1".to_string(),
            ));
        }
        if self.commit_interval.is_zero() {
            return Err(ConsumerError::InvalidConfig(
                "commit interval must be greater than zero".to_string(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConsumerError::InvalidConfig(
                "poll timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the librdkafka configuration for these options.
    pub fn kafka_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", self.seeds.join(","))
            .set("client.id", &self.client_id)
            .set(
                "group.id",
                self.group.as_deref().unwrap_or(self.client_id.as_str()),
            )
            .set("enable.auto.commit", (!self.manual_commit).to_string())
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", self.offset_reset.as_str())
            .set("socket.timeout.ms", "10000");

        if self.tls {
            config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        for (key, value) in &self.overrides {
            config.set(key, value);
        }

        config
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("seeds", &self.seeds)
            .field("client_id", &self.client_id)
            .field("group", &self.group)
            .field("max_fetch_count", &self.max_fetch_count)
            .field("commit_batch_size", &self.commit_batch_size())
            .field("commit_interval", &self.commit_interval)
            .field("poll_timeout", &self.poll_timeout)
            .field("manual_commit", &self.manual_commit)
            .field("offset_reset", &self.offset_reset)
            .field("tls", &self.tls)
            .field(
                "subscriptions",
                &self.subscriptions.as_ref().map(|s| s.len()),
            )
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

fn default_client_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "kafka-consumer".to_string())
}
