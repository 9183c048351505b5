//! Producer flow control for a client connection.
//!
//! While paused, the connection stops reading frames from its socket. Frames
//! already buffered by the transport are kept and read after `resume`.
//! Router handlers read the flag from other tasks to decide whether the
//! client is busy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Flags {
    paused: AtomicBool,
    stopped: AtomicBool,
}

/// Shared pause/stop switch. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct FlowController {
    flags: Arc<Flags>,
}

impl FlowController {
    /// Create a running (unpaused) controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop consuming client frames.
    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::Release);
    }

    /// Resume consuming client frames. Has no effect once stopped.
    pub fn resume(&self) {
        if !self.is_stopped() {
            self.flags.paused.store(false, Ordering::Release);
        }
    }

    /// Stop for good. Used on teardown.
    pub fn stop(&self) {
        self.flags.stopped.store(true, Ordering::Release);
        self.flags.paused.store(true, Ordering::Release);
    }

    /// Check if frame intake is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::Acquire)
    }

    /// Check if the connection is shutting down.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.flags.stopped.load(Ordering::Acquire)
    }
}
