use std::sync::Arc;
use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("transport closed")]
    Closed,
    #[error("consumer group session lost: {0}")]
    GroupSession(String),
    #[error("data loss detected on {topic}/{partition}: {detail}")]
    DataLoss {
        topic: String,
        partition: i32,
        detail: String,
    },
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the consumer can keep polling after this error.
    pub fn can_continue(&self) -> bool {
        match self {
            TransportError::Kafka(e) => match e {
                KafkaError::MessageConsumption(_) => true,
                KafkaError::MessageConsumptionFatal(_) => false,
                KafkaError::Global(RDKafkaErrorCode::Authentication) => false,
                KafkaError::Global(_) => true,
                _ => false,
            },
            TransportError::DataLoss { .. } => true,
            TransportError::Closed | TransportError::GroupSession(_) | TransportError::Other(_) => {
                false
            }
        }
    }

    /// Informational errors are expected during normal operation and are logged, not alerted on.
    pub fn is_info(&self) -> bool {
        match self {
            TransportError::Kafka(KafkaError::MessageConsumption(code)) => matches!(
                code,
                RDKafkaErrorCode::PartitionEOF | RDKafkaErrorCode::OperationTimedOut
            ),
            TransportError::DataLoss { .. } => true,
            _ => false,
        }
    }
}

/// Broad classes of [`ConsumerError`], used to decide how an error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transport is permanently closed.
    Terminal,
    /// A poll returned errors; the background loop keeps going.
    TransientPoll,
    /// A commit flush failed; the flushed records are not retried.
    CommitFlush,
    /// The call was invalid in the client's current state and had no side effect.
    Usage,
    /// The transport rejected a subscribe or unsubscribe; the handler set was left as it was.
    Subscription,
    /// A message handler failed or timed out.
    Handler,
    /// The client could not be configured or connected.
    Setup,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("background consumer active")]
    BackgroundConsumerActive,
    #[error("client closed")]
    ClientClosed,
    #[error("manual commit is not enabled")]
    ManualCommitDisabled,
    #[error("error polling records: {0}")]
    Poll(#[source] TransportError),
    #[error("failed to commit {count} records: {source}")]
    Commit {
        count: usize,
        #[source]
        source: TransportError,
    },
    #[error("failed to update subscription for topic {topic}: {source}")]
    Subscription {
        topic: String,
        #[source]
        source: TransportError,
    },
    #[error("handler for {topic}/{partition} failed at offset {offset}: {source:#}")]
    Handler {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: anyhow::Error,
    },
    #[error("handler for {topic}/{partition} exceeded {timeout:?} at offset {offset}")]
    HandlerTimeout {
        topic: String,
        partition: i32,
        offset: i64,
        timeout: Duration,
    },
    #[error("failed to connect to Kafka: {0}")]
    Connect(#[source] TransportError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConsumerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumerError::ClientClosed => ErrorKind::Terminal,
            ConsumerError::Poll(TransportError::Closed) => ErrorKind::Terminal,
            ConsumerError::Poll(_) => ErrorKind::TransientPoll,
            ConsumerError::Commit { .. } => ErrorKind::CommitFlush,
            ConsumerError::BackgroundConsumerActive | ConsumerError::ManualCommitDisabled => {
                ErrorKind::Usage
            }
            ConsumerError::Subscription { .. } => ErrorKind::Subscription,
            ConsumerError::Handler { .. } | ConsumerError::HandlerTimeout { .. } => {
                ErrorKind::Handler
            }
            ConsumerError::Connect(_) | ConsumerError::InvalidConfig(_) => ErrorKind::Setup,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind() == ErrorKind::Terminal
    }
}

/// Callback receiving errors raised by background tasks, which have no caller to return to.
pub type ErrorSink = Arc<dyn Fn(&ConsumerError) + Send + Sync>;

/// Logs background errors and forwards them to the configured [`ErrorSink`].
#[derive(Clone, Default)]
pub(crate) struct ErrorReporter {
    sink: Option<ErrorSink>,
}

impl ErrorReporter {
    pub(crate) fn new(sink: Option<ErrorSink>) -> Self {
        Self { sink }
    }

    pub(crate) fn report(&self, err: ConsumerError) {
        match &err {
            ConsumerError::Poll(source) if source.is_info() => {
                info!(error = %err, "Kafka consumer notice");
            }
            ConsumerError::Poll(_) => warn!(error = %err, "Error polling records"),
            ConsumerError::Commit { count, .. } => {
                error!(error = %err, count = count, "Error committing offsets");
            }
            _ => error!(error = %err, "Kafka consumer error"),
        }

        if let Some(sink) = &self.sink {
            sink(&err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_partition_eof_is_informational() {
        let err = TransportError::Kafka(KafkaError::MessageConsumption(
            RDKafkaErrorCode::PartitionEOF,
        ));
        assert!(err.is_info());
        assert!(err.can_continue());
    }

    #[test]
    fn test_fatal_consumption_error_cannot_continue() {
        let err = TransportError::Kafka(KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ));
        assert!(!err.is_info());
        assert!(!err.can_continue());
    }

    #[test]
    fn test_authentication_failure_cannot_continue() {
        let err = TransportError::Kafka(KafkaError::Global(RDKafkaErrorCode::Authentication));
        assert!(!err.can_continue());

        let err = TransportError::Kafka(KafkaError::Global(RDKafkaErrorCode::AllBrokersDown));
        assert!(err.can_continue());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(ConsumerError::ClientClosed.kind(), ErrorKind::Terminal);
        assert!(ConsumerError::Poll(TransportError::Closed).is_terminal());
        assert_eq!(
            ConsumerError::Poll(TransportError::Other("boom".into())).kind(),
            ErrorKind::TransientPoll
        );
        assert_eq!(
            ConsumerError::BackgroundConsumerActive.kind(),
            ErrorKind::Usage
        );
        assert_eq!(
            ConsumerError::Commit {
                count: 2,
                source: TransportError::Closed
            }
            .kind(),
            ErrorKind::CommitFlush
        );
        assert_eq!(
            ConsumerError::Subscription {
                topic: "orders".into(),
                source: TransportError::Other("broker down".into())
            }
            .kind(),
            ErrorKind::Subscription
        );
    }

    #[test]
    fn test_reporter_forwards_to_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let reporter = ErrorReporter::new(Some(Arc::new(move |e: &ConsumerError| {
            sink_seen.lock().unwrap().push(e.kind());
        })));

        reporter.report(ConsumerError::Poll(TransportError::Other("boom".into())));
        reporter.report(ConsumerError::ClientClosed);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ErrorKind::TransientPoll, ErrorKind::Terminal]
        );
    }
}
