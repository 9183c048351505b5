//! Outbound node-to-node HTTP calls.
//!
//! Both calls are best effort. Connection failures are expected when a peer
//! has gone away and are logged at debug; anything else is logged at warn.
//! Nothing is retried.

use std::time::Duration;

use push_proto::Uaid;
use reqwest::{Client, Method};
use tracing::{debug, warn};

use crate::error::{ServerError, ServerResult};

/// Default timeout for a peer request.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for peer router endpoints.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: Client,
}

impl Notifier {
    /// Create a notifier with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> ServerResult<Self> {
        Self::with_timeout(DEFAULT_PEER_TIMEOUT)
    }

    /// Create a notifier with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(timeout: Duration) -> ServerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServerError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// URL that tells `node` to drop its connection for `uaid`, if that
    /// connection started at `connected_at`.
    #[must_use]
    pub fn drop_stale_url(node: &str, uaid: Uaid, connected_at: i64) -> String {
        format!("{}/notif/{uaid}/{connected_at}", node.trim_end_matches('/'))
    }

    /// URL that tells `node` to check storage for `uaid`.
    #[must_use]
    pub fn notify_check_url(node: &str, uaid: Uaid) -> String {
        format!("{}/notif/{uaid}", node.trim_end_matches('/'))
    }

    /// Ask a peer to close a connection this node has superseded.
    pub async fn drop_stale(&self, node: &str, uaid: Uaid, connected_at: i64) {
        let url = Self::drop_stale_url(node, uaid, connected_at);
        self.send(Method::DELETE, &url, uaid).await;
    }

    /// Ask a peer to check storage for new notifications.
    pub async fn notify_check(&self, node: &str, uaid: Uaid) {
        let url = Self::notify_check_url(node, uaid);
        self.send(Method::PUT, &url, uaid).await;
    }

    async fn send(&self, method: Method, url: &str, uaid: Uaid) {
        match self.client.request(method.clone(), url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(uaid = %uaid, method = %method, url = %url, status = %resp.status(), "Peer notified");
            }
            Ok(resp) => {
                warn!(uaid = %uaid, method = %method, url = %url, status = %resp.status(), "Peer rejected request");
            }
            Err(e) if e.is_connect() => {
                debug!(uaid = %uaid, method = %method, url = %url, error = %e, "Peer unreachable");
            }
            Err(e) => {
                warn!(uaid = %uaid, method = %method, url = %url, error = %e, "Peer request failed");
            }
        }
    }
}
