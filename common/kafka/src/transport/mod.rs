use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::record::{PollBatch, Record};

pub mod kafka;

pub use kafka::{ConsumerLogContext, KafkaTransport};

/// The broker client primitives the consumer pipeline is built on.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fetch up to `max_records` records.
    ///
    /// With a deadline, an empty batch is returned once it elapses. Without one, the call
    /// waits until at least one record, an error, or closure is available.
    async fn poll_batch(&self, max_records: usize, deadline: Option<Duration>) -> PollBatch;

    /// Commit the offsets of `records`, which are passed in acknowledgement order.
    async fn commit_offsets(&self, records: &[Record]) -> Result<(), TransportError>;

    fn subscribe_topic(&self, topic: &str) -> Result<(), TransportError>;

    fn unsubscribe_topic(&self, topic: &str) -> Result<(), TransportError>;

    /// Close the transport. With `allow_rebalance`, group membership is given up cleanly
    /// so an in-progress rebalance can complete.
    async fn close(&self, allow_rebalance: bool);

    async fn ping(&self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }
}
