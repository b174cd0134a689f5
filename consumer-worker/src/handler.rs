use async_trait::async_trait;
use common_kafka::{Acknowledger, MessageHandler, Record};
use tracing::debug;

pub const RECORDS_PROCESSED_COUNTER: &str = "consumer_worker_records_processed_total";

/// Logs every record it receives and, for manual-commit clients, acknowledges it.
pub struct RecordLogger {
    acknowledger: Option<Acknowledger>,
}

impl RecordLogger {
    pub fn new(acknowledger: Option<Acknowledger>) -> Self {
        Self { acknowledger }
    }
}

#[async_trait]
impl MessageHandler for RecordLogger {
    async fn handle(&self, record: Record) -> anyhow::Result<()> {
        debug!(
            topic = record.topic(),
            partition = record.partition(),
            offset = record.offset(),
            key_bytes = record.key().map_or(0, <[u8]>::len),
            value_bytes = record.value().map_or(0, <[u8]>::len),
            headers = record.headers().len(),
            "Received record"
        );
        metrics::counter!(RECORDS_PROCESSED_COUNTER, "topic" => record.topic().to_owned())
            .increment(1);

        if let Some(acknowledger) = &self.acknowledger {
            acknowledger.acknowledge(record).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use common_kafka::test_utils::{records, wait_until, MockTransport};
    use common_kafka::{Client, ClientOptions};

    use super::*;

    #[tokio::test]
    async fn test_records_are_acknowledged_and_committed() {
        let transport = Arc::new(MockTransport::new());
        let client = Client::with_transport(
            transport.clone(),
            ClientOptions::new()
                .with_manual_commit()
                .with_max_fetch_count(2)
                .with_poll_timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        client
            .add_subscription("orders", RecordLogger::new(client.acknowledger()))
            .unwrap();
        client.start_consumer().unwrap();
        transport.push_records(records("orders", 4));

        assert!(
            wait_until(Duration::from_secs(2), || transport.committed_offsets().len() == 4).await
        );
        client.close().await;

        assert_eq!(transport.committed_offsets(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_auto_commit_client_only_logs() {
        let handler = RecordLogger::new(None);

        assert!(handler.handle(Record::new("orders", 0, 0)).await.is_ok());
    }
}
