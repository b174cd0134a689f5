// ==== Poll metrics ====
/// Counter for records returned by transport polls
pub const RECORDS_POLLED_COUNTER: &str = "kafka_consumer_records_polled_total";

/// Counter for errors returned by transport polls (with kind label: info/warn)
pub const POLL_ERRORS_COUNTER: &str = "kafka_consumer_poll_errors_total";

// ==== Dispatch metrics ====
/// Counter for records handed to handlers (with status label: success/failure/timeout/unhandled)
pub const RECORDS_DISPATCHED_COUNTER: &str = "kafka_consumer_records_dispatched_total";

/// Histogram for handler duration, in seconds
pub const HANDLER_DURATION_HISTOGRAM: &str = "kafka_consumer_handler_duration_seconds";

// ==== Commit metrics ====
/// Counter for commit flushes (with status label: success/failure, and trigger label: size/interval/shutdown)
pub const COMMIT_FLUSHES_COUNTER: &str = "kafka_consumer_commit_flushes_total";

/// Histogram for the number of records in one commit flush
pub const COMMIT_FLUSH_SIZE_HISTOGRAM: &str = "kafka_consumer_commit_flush_size";

/// Counter for records acknowledged into the commit queue
pub const RECORDS_ACKNOWLEDGED_COUNTER: &str = "kafka_consumer_records_acknowledged_total";
