use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::signal::unix::SignalKind;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::Client;
use crate::error::ConsumerError;

#[derive(Debug, Error)]
pub enum ClientRegistryError {
    #[error("{pending} of {total} clients still closing after {timeout:?}")]
    CloseTimeout {
        pending: usize,
        total: usize,
        timeout: Duration,
    },
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

/// Named consumer clients owned by the host process.
///
/// Hosts keep one registry, look clients up by name, and close all of them together on
/// shutdown.
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Arc<Client>>>,
    close_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(close_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            close_timeout,
        }
    }

    /// Store `client` under `name`, returning the client it replaced.
    ///
    /// The replaced client is not closed.
    pub async fn insert(&self, name: &str, client: Client) -> Option<Arc<Client>> {
        self.clients
            .lock()
            .await
            .insert(name.to_owned(), Arc::new(client))
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Client>> {
        self.clients.lock().await.get(name).cloned()
    }

    /// Return the client stored under `name`, or store the one built by `f`.
    pub async fn get_or_insert_with<F>(&self, name: &str, f: F) -> Arc<Client>
    where
        F: FnOnce() -> Client,
    {
        self.clients
            .lock()
            .await
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(f()))
            .clone()
    }

    /// Return the client stored under `name`, or connect one with `f` and store it.
    ///
    /// The registry stays locked while `f` runs, so concurrent callers for the same name
    /// never connect twice.
    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        name: &str,
        f: F,
    ) -> Result<Arc<Client>, ConsumerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Client, ConsumerError>>,
    {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(name) {
            return Ok(client.clone());
        }

        let client = Arc::new(f().await?);
        clients.insert(name.to_owned(), client.clone());
        info!(name = name, "Registered Kafka consumer client");
        Ok(client)
    }

    /// Remove the client stored under `name` without closing it.
    pub async fn remove(&self, name: &str) -> Option<Arc<Client>> {
        self.clients.lock().await.remove(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every registered client concurrently and empty the registry.
    pub async fn close_all(&self) -> Result<(), ClientRegistryError> {
        let clients: Vec<(String, Arc<Client>)> = self.clients.lock().await.drain().collect();
        let total = clients.len();
        if total == 0 {
            return Ok(());
        }

        info!(clients = total, "Closing Kafka consumer clients");
        let mut closing: FuturesUnordered<_> = clients
            .into_iter()
            .map(|(name, client)| async move {
                client.close().await;
                name
            })
            .collect();

        let mut closed = 0;
        let finished = tokio::time::timeout(self.close_timeout, async {
            while let Some(name) = closing.next().await {
                closed += 1;
                info!(name = %name, "Kafka consumer client closed");
            }
        })
        .await;

        if finished.is_err() {
            let pending = total - closed;
            warn!(
                pending = pending,
                timeout_ms = self.close_timeout.as_millis() as u64,
                "Timed out closing Kafka consumer clients"
            );
            return Err(ClientRegistryError::CloseTimeout {
                pending,
                total,
                timeout: self.close_timeout,
            });
        }

        Ok(())
    }

    /// Wait for SIGINT or SIGTERM, then close every client.
    pub async fn run_until_signal(&self) -> Result<(), ClientRegistryError> {
        wait_for_shutdown_signal().await?;
        self.close_all().await
    }
}

async fn wait_for_shutdown_signal() -> Result<(), ClientRegistryError> {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}
