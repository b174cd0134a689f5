//! Kafka consumer client with per-topic handlers and batched offset commits.
//!
//! A [`Client`] either runs a background consumer that hands every fetched record to the
//! [`MessageHandler`] registered for its topic, or is polled on demand. With manual commit
//! enabled, processed records are acknowledged back to the client and committed in batches,
//! and [`Client::close`] commits everything acknowledged before it was called.
//!
//! ## Error logging
//!
//! Errors from the background tasks have no caller to return to. They are logged and passed
//! to the callback installed with [`ClientOptions::with_on_error`]. When logging handler
//! errors yourself, use `{e:#}` so the whole `anyhow` chain is visible.

pub mod client;
pub mod clients;
pub mod commit;
pub mod config;
mod dispatch;
pub mod error;
pub mod metrics_consts;
pub mod record;
pub mod registry;
pub mod test_utils;
pub mod transport;

pub use client::Client;
pub use clients::{ClientRegistry, ClientRegistryError};
pub use commit::Acknowledger;
pub use config::{ClientOptions, ConsumerConfig, KafkaConfig, OffsetReset};
pub use error::{ConsumerError, ErrorKind, ErrorSink, TransportError};
pub use record::{PollBatch, Record, RecordHeader};
pub use registry::{MessageHandler, Subscriptions};
pub use transport::{KafkaTransport, Transport};
