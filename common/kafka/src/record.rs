use chrono::{DateTime, Utc};

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// An owned snapshot of one fetched Kafka message.
///
/// Records are produced by a [`Transport`](crate::transport::Transport) and are never
/// mutated afterwards; they move from the transport to a handler and, when acknowledged,
/// into the commit queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    timestamp: Option<DateTime<Utc>>,
    headers: Vec<RecordHeader>,
}

impl Record {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: None,
            timestamp: None,
            headers: vec![],
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        self.headers.push(RecordHeader {
            key: key.into(),
            value,
        });
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn headers(&self) -> &[RecordHeader] {
        &self.headers
    }

    /// The offset a consumer group should resume from once this record is committed.
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}

/// The result of one transport poll.
///
/// `closed` is terminal: once a transport reports it, no later poll can return records.
#[derive(Debug, Default)]
pub struct PollBatch {
    pub records: Vec<Record>,
    pub errors: Vec<TransportError>,
    pub closed: bool,
}

impl PollBatch {
    pub fn new_with_size_hint(hint: usize) -> Self {
        Self {
            records: Vec::with_capacity(hint),
            errors: vec![],
            closed: false,
        }
    }

    pub fn closed() -> Self {
        Self {
            closed: true,
            ..Self::default()
        }
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn from_error(error: TransportError) -> Self {
        Self {
            errors: vec![error],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty() && !self.closed
    }
}
