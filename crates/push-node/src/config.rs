//! Node configuration.
//!
//! Configuration for the push node, including:
//! - Client websocket and router HTTP listeners
//! - The router URL this node advertises in the registry
//! - Ping and fetch pacing
//! - Background retry policy for best-effort backend writes

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Minimum spacing between ping replies.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(9);

/// Delay before a paused or undrained connection retries a storage fetch.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Webpush fetch page size.
pub const DEFAULT_FETCH_LIMIT: usize = 10;

/// Default maximum websocket message size: 64KB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Durations are written as integer milliseconds in config files.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Policy for retrying best-effort backend mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay after the first failure.
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Upper bound on the delay between attempts.
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
    /// Attempts before giving up. 0 retries forever.
    pub max_attempts: u32,
    /// Consecutive failures, across all mutations, that open the breaker.
    /// 0 disables the breaker.
    pub breaker_threshold: u32,
    /// How long an open breaker holds back new attempts.
    #[serde(rename = "breaker_cooldown_ms", with = "duration_ms")]
    pub breaker_cooldown: Duration,
    /// Mutations executed concurrently.
    pub concurrency: usize,
}

impl RetryConfig {
    /// Create a retry configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            max_attempts: 0,
            breaker_threshold: 20,
            breaker_cooldown: Duration::from_secs(5),
            concurrency: 64,
        }
    }

    /// Set the backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the maximum number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the circuit breaker threshold and cooldown.
    #[must_use]
    pub const fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker_threshold = threshold;
        self.breaker_cooldown = cooldown;
        self
    }

    /// Set the worker concurrency.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Delay before the attempt following failed attempt number `attempt`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Check if another attempt is allowed after `attempt` failures.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for one push node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address clients connect their websockets to.
    pub bind_addr: SocketAddr,
    /// Address of the private node-to-node HTTP listener.
    pub router_bind_addr: SocketAddr,
    /// Base URL peers use to reach this node's router. Written to the
    /// registry as the node id.
    pub router_url: String,
    /// Base URL of the public endpoint service, used to mint push endpoints.
    pub endpoint_url: String,
    /// Minimum spacing between ping replies.
    #[serde(rename = "ping_interval_ms", with = "duration_ms")]
    pub ping_interval: Duration,
    /// Delay before retrying a fetch that could not run.
    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,
    /// Webpush fetch page size.
    pub fetch_limit: usize,
    /// Maximum number of concurrent client connections.
    pub max_connections: usize,
    /// Maximum accepted client frame size in bytes.
    pub max_message_size: usize,
    /// Retry policy for best-effort backend writes.
    pub retry: RetryConfig,
}

impl NodeConfig {
    /// Create a configuration listening on the given client address.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            router_bind_addr: SocketAddr::new(bind_addr.ip(), bind_addr.port().wrapping_add(1)),
            router_url: "http://localhost:8081".to_string(),
            endpoint_url: "http://localhost:8082".to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
            fetch_limit: DEFAULT_FETCH_LIMIT,
            max_connections: 10_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            retry: RetryConfig::new(),
        }
    }

    /// Set the router listener address.
    #[must_use]
    pub const fn with_router_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.router_bind_addr = addr;
        self
    }

    /// Set the advertised router URL.
    #[must_use]
    pub fn with_router_url(mut self, url: impl Into<String>) -> Self {
        self.router_url = url.into();
        self
    }

    /// Set the endpoint base URL.
    #[must_use]
    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = url.into();
        self
    }

    /// Set the ping interval.
    #[must_use]
    pub const fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the fetch retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the webpush fetch page size.
    #[must_use]
    pub const fn with_fetch_limit(mut self, limit: usize) -> Self {
        self.fetch_limit = limit;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the maximum client frame size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ServerError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> ServerResult<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| ServerError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> ServerResult<()> {
        for (name, url) in [
            ("router_url", &self.router_url),
            ("endpoint_url", &self.endpoint_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ServerError::Config(format!(
                    "{name} must be an http(s) URL, got '{url}'"
                )));
            }
        }

        if self.fetch_limit == 0 {
            return Err(ServerError::Config("fetch_limit must be positive".into()));
        }

        if self.max_connections == 0 {
            return Err(ServerError::Config(
                "max_connections must be positive".into(),
            ));
        }

        if self.retry.concurrency == 0 {
            return Err(ServerError::Config(
                "retry.concurrency must be positive".into(),
            ));
        }

        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ServerError::Config(
                "retry.initial_backoff_ms cannot exceed retry.max_backoff_ms".into(),
            ));
        }

        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(([0, 0, 0, 0], 8080).into())
    }
}
