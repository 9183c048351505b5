//! Shared state for the push node.

use std::sync::Arc;
use std::time::Instant;

use push_store::Backends;

use crate::config::NodeConfig;
use crate::error::ServerResult;
use crate::notifier::Notifier;
use crate::registry::ClientRegistry;
use crate::retry::{RetryHandle, RetryQueue};

/// State shared by every connection task and the router.
#[derive(Debug)]
pub struct NodeState {
    /// Node configuration.
    config: Arc<NodeConfig>,
    /// Registry, storage and endpoint backends.
    backends: Backends,
    /// Locally connected clients.
    clients: Arc<ClientRegistry>,
    /// Background writer for best-effort mutations.
    retry: RetryHandle,
    /// Peer node client.
    notifier: Notifier,
    /// Node start time.
    start_time: Instant,
}

impl NodeState {
    /// Create the node state and start its retry worker.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer HTTP client cannot be built.
    pub fn new(config: NodeConfig, backends: Backends) -> ServerResult<Self> {
        let retry = RetryQueue::spawn(backends.clone(), config.retry);
        Ok(Self::with_parts(config, backends, retry, Notifier::new()?))
    }

    /// Assemble the node state from prepared parts.
    #[must_use]
    pub fn with_parts(
        config: NodeConfig,
        backends: Backends,
        retry: RetryHandle,
        notifier: Notifier,
    ) -> Self {
        Self {
            config: Arc::new(config),
            backends,
            clients: Arc::new(ClientRegistry::new()),
            retry,
            notifier,
            start_time: Instant::now(),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Get the backends.
    #[must_use]
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Get the client registry.
    #[must_use]
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Get the retry queue handle.
    #[must_use]
    pub fn retry(&self) -> &RetryHandle {
        &self.retry
    }

    /// Get the peer notifier.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// The URL peers use to reach this node's router.
    #[must_use]
    pub fn router_url(&self) -> &str {
        &self.config.router_url
    }

    /// Seconds since the node started.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
