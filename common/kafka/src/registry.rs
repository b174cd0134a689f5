//! Topic to handler mapping shared by the dispatch loop and the public subscription API.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ConsumerError;
use crate::record::Record;
use crate::transport::Transport;

/// Business logic invoked for every record fetched on a subscribed topic.
///
/// Handlers run one at a time on the dispatch task, in the order the transport delivered
/// the records. A handler that never returns stalls the consumer, including its shutdown.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, record: Record) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, record: Record) -> anyhow::Result<()> {
        (self)(record).await
    }
}

pub type Subscriptions = HashMap<String, Arc<dyn MessageHandler>>;

pub struct SubscriptionRegistry {
    handlers: RwLock<Subscriptions>,
    // fixed set given at construction, add/remove are no-ops
    is_static: bool,
}

impl SubscriptionRegistry {
    pub fn dynamic() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            is_static: false,
        }
    }

    pub fn with_static(subscriptions: Subscriptions) -> Self {
        Self {
            handlers: RwLock::new(subscriptions),
            is_static: true,
        }
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Register `handler` for `topic` and subscribe the transport to it.
    ///
    /// The transport call happens while the write lock is held, so the dispatch loop can
    /// never observe a subscribed topic without its handler.
    pub fn add(
        &self,
        transport: &dyn Transport,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ConsumerError> {
        if self.is_static {
            debug!(topic = topic, "Static subscriptions, ignoring add_subscription");
            return Ok(());
        }

        let mut handlers = self.write();
        let previous = handlers.insert(topic.to_owned(), handler);
        if let Err(source) = transport.subscribe_topic(topic) {
            match previous {
                Some(previous) => handlers.insert(topic.to_owned(), previous),
                None => handlers.remove(topic),
            };
            return Err(ConsumerError::Subscription {
                topic: topic.to_owned(),
                source,
            });
        }

        info!(topic = topic, "Added subscription");
        Ok(())
    }

    /// Drop the handler for `topic` and unsubscribe the transport from it.
    ///
    /// Records fetched before this returns may still reach the old handler if the dispatch
    /// loop already looked it up; records fetched afterwards never do.
    pub fn remove(&self, transport: &dyn Transport, topic: &str) -> Result<(), ConsumerError> {
        if self.is_static {
            debug!(topic = topic, "Static subscriptions, ignoring remove_subscription");
            return Ok(());
        }

        let mut handlers = self.write();
        let Some(previous) = handlers.remove(topic) else {
            return Ok(());
        };
        if let Err(source) = transport.unsubscribe_topic(topic) {
            // still consumed, so keep it handled
            handlers.insert(topic.to_owned(), previous);
            return Err(ConsumerError::Subscription {
                topic: topic.to_owned(),
                source,
            });
        }

        info!(topic = topic, "Removed subscription");
        Ok(())
    }

    pub fn lookup(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        self.read().get(topic).cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A panicking handler never runs under this lock, so a poisoned map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, Subscriptions> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Subscriptions> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, TransportError};
    use crate::test_utils::{noop_handler, MockTransport};

    #[test]
    fn test_add_subscribes_transport() {
        let transport = MockTransport::new();
        let registry = SubscriptionRegistry::dynamic();

        registry.add(&transport, "orders", noop_handler()).unwrap();

        assert!(registry.lookup("orders").is_some());
        assert_eq!(transport.subscribed_topics(), vec!["orders".to_string()]);
    }

    #[test]
    fn test_remove_unsubscribes_transport() {
        let transport = MockTransport::new();
        let registry = SubscriptionRegistry::dynamic();

        registry.add(&transport, "orders", noop_handler()).unwrap();
        registry.add(&transport, "payments", noop_handler()).unwrap();
        registry.remove(&transport, "orders").unwrap();

        assert!(registry.lookup("orders").is_none());
        assert_eq!(registry.topics(), vec!["payments".to_string()]);
        assert_eq!(transport.subscribed_topics(), vec!["payments".to_string()]);
    }

    #[test]
    fn test_remove_unknown_topic_is_noop() {
        let transport = MockTransport::new();
        let registry = SubscriptionRegistry::dynamic();

        registry.remove(&transport, "missing").unwrap();

        assert_eq!(transport.unsubscribe_calls(), 0);
    }

    #[test]
    fn test_failed_subscribe_rolls_back_handler() {
        let transport = MockTransport::new();
        transport.fail_next_subscribe(TransportError::Other("broker down".into()));
        let registry = SubscriptionRegistry::dynamic();

        let err = registry
            .add(&transport, "orders", noop_handler())
            .unwrap_err();

        assert!(matches!(err, ConsumerError::Subscription { ref topic, .. } if topic == "orders"));
        assert!(registry.lookup("orders").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_unsubscribe_keeps_handler() {
        let transport = MockTransport::new();
        let registry = SubscriptionRegistry::dynamic();
        registry.add(&transport, "orders", noop_handler()).unwrap();
        transport.fail_next_unsubscribe(TransportError::Other("broker down".into()));

        let err = registry.remove(&transport, "orders").unwrap_err();

        assert!(matches!(err, ConsumerError::Subscription { ref topic, .. } if topic == "orders"));
        assert_eq!(err.kind(), ErrorKind::Subscription);
        assert!(registry.lookup("orders").is_some());
        assert_eq!(registry.topics(), vec!["orders".to_string()]);
        assert_eq!(transport.subscribed_topics(), vec!["orders".to_string()]);

        // a later retry succeeds and drops both sides
        registry.remove(&transport, "orders").unwrap();
        assert!(registry.is_empty());
        assert!(transport.subscribed_topics().is_empty());
    }

    #[test]
    fn test_static_registry_ignores_mutation() {
        let transport = MockTransport::new();
        let mut subscriptions = Subscriptions::new();
        subscriptions.insert("orders".to_string(), noop_handler());
        let registry = SubscriptionRegistry::with_static(subscriptions);

        registry.add(&transport, "payments", noop_handler()).unwrap();
        registry.remove(&transport, "orders").unwrap();

        assert_eq!(registry.topics(), vec!["orders".to_string()]);
        assert!(transport.subscribed_topics().is_empty());
        assert_eq!(transport.unsubscribe_calls(), 0);
    }

    #[tokio::test]
    async fn test_closure_handlers_are_message_handlers() {
        let registry = SubscriptionRegistry::dynamic();
        let transport = MockTransport::new();
        let handler: Arc<dyn MessageHandler> = Arc::new(|record: Record| async move {
            anyhow::ensure!(record.offset() >= 0, "negative offset");
            anyhow::Ok(())
        });

        registry.add(&transport, "orders", handler).unwrap();

        let handler = registry.lookup("orders").unwrap();
        assert!(handler.handle(Record::new("orders", 0, 1)).await.is_ok());
        assert!(handler.handle(Record::new("orders", 0, -1)).await.is_err());
    }
}
