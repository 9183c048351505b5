//! Background retry queue for best-effort backend writes.
//!
//! Deletes and cleanup writes must never block a client reply, and must not
//! be lost when the connection that requested them goes away. Connections
//! submit a [`Mutation`] through a [`RetryHandle`]; a process-wide worker
//! executes it with exponential backoff, bounded by [`RetryConfig`], behind a
//! circuit breaker shared by all mutations.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use push_store::{Backends, Mutation};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;

/// Final result of a submitted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The backend applied the mutation.
    Applied,
    /// Attempts were exhausted, or the worker stopped first.
    GaveUp,
}

#[derive(Debug)]
struct Job {
    mutation: Mutation,
    done: Option<oneshot::Sender<RetryOutcome>>,
}

/// Submits mutations to the retry worker.
#[derive(Debug, Clone)]
pub struct RetryHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl RetryHandle {
    /// Submit a mutation without waiting for it.
    pub fn submit(&self, mutation: Mutation) {
        self.enqueue(mutation, None);
    }

    /// Submit a mutation and get a future for its outcome. Dropping the
    /// future does not cancel the mutation.
    pub fn submit_and_wait(
        &self,
        mutation: Mutation,
    ) -> impl std::future::Future<Output = RetryOutcome> + Send + 'static {
        let (done, rx) = oneshot::channel();
        self.enqueue(mutation, Some(done));
        async move { rx.await.unwrap_or(RetryOutcome::GaveUp) }
    }

    fn enqueue(&self, mutation: Mutation, done: Option<oneshot::Sender<RetryOutcome>>) {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(Job { mutation, done }) {
            error!(mutation = %job.mutation, "Retry worker has stopped, dropping mutation");
            if let Some(done) = job.done {
                let _ = done.send(RetryOutcome::GaveUp);
            }
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Circuit breaker shared by all retried mutations.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `threshold` consecutive failures.
    /// A threshold of 0 disables it.
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Reset after a success.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.open_until.take().is_some() {
            info!("Backend recovered, closing retry circuit breaker");
        }
        state.consecutive_failures = 0;
    }

    /// Count a failure, opening the breaker at the threshold.
    pub fn record_failure(&self) {
        if self.threshold == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.threshold {
            let reopened = state.open_until.is_none();
            state.open_until = Some(Instant::now() + self.cooldown);
            if reopened {
                warn!(
                    failures = state.consecutive_failures,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "Opening retry circuit breaker"
                );
            }
        }
    }

    /// Time left until attempts may proceed, or `None` when closed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .open_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    /// Check if the breaker is currently holding attempts back.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.remaining().is_some()
    }

    async fn wait_until_closed(&self) {
        while let Some(left) = self.remaining() {
            tokio::time::sleep(left).await;
        }
    }
}

/// The retry worker. Runs until every [`RetryHandle`] is dropped.
#[derive(Debug)]
pub struct RetryQueue {
    rx: mpsc::UnboundedReceiver<Job>,
    backends: Backends,
    config: RetryConfig,
    breaker: Arc<CircuitBreaker>,
}

impl RetryQueue {
    /// Create a worker and the handle that feeds it.
    #[must_use]
    pub fn new(backends: Backends, config: RetryConfig) -> (Self, RetryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_threshold,
            config.breaker_cooldown,
        ));
        (
            Self {
                rx,
                backends,
                config,
                breaker,
            },
            RetryHandle { tx },
        )
    }

    /// Create a worker and spawn it on the current runtime.
    #[must_use]
    pub fn spawn(backends: Backends, config: RetryConfig) -> RetryHandle {
        let (queue, handle) = Self::new(backends, config);
        tokio::spawn(queue.run());
        handle
    }

    /// Process submitted mutations, at most `config.concurrency` at a time.
    pub async fn run(mut self) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        while let Some(job) = self.rx.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let backends = self.backends.clone();
            let breaker = self.breaker.clone();
            let config = self.config;
            tokio::spawn(async move {
                let outcome = execute(&backends, &config, &breaker, &job.mutation).await;
                drop(permit);
                if let Some(done) = job.done {
                    let _ = done.send(outcome);
                }
            });
        }
        debug!("Retry worker stopped");
    }
}

async fn execute(
    backends: &Backends,
    config: &RetryConfig,
    breaker: &CircuitBreaker,
    mutation: &Mutation,
) -> RetryOutcome {
    let mut attempt: u32 = 0;
    loop {
        if breaker.is_open() {
            debug!(mutation = %mutation, "Retry circuit breaker open, waiting");
        }
        breaker.wait_until_closed().await;
        attempt = attempt.saturating_add(1);

        match backends.apply(mutation).await {
            Ok(()) => {
                breaker.record_success();
                if attempt > 1 {
                    debug!(mutation = %mutation, attempts = attempt, "Mutation applied after retry");
                }
                return RetryOutcome::Applied;
            }
            Err(e) => {
                breaker.record_failure();
                if !config.should_retry(attempt) {
                    error!(mutation = %mutation, attempts = attempt, error = %e, "Giving up on mutation");
                    return RetryOutcome::GaveUp;
                }
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    mutation = %mutation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Mutation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
