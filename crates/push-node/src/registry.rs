//! Process-wide registry of locally connected clients.
//!
//! The registry is the authority on "is this uaid connected here". It holds
//! a [`ConnectionHandle`] per uaid; the connection itself runs in its own
//! task and is reached through the handle's command channel.

use std::collections::HashMap;

use parking_lot::RwLock;
use push_proto::{Notification, Uaid};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::flow::FlowController;

/// Requests delivered to a running connection from outside its task.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Deliver a notification directly, without storage.
    Deliver(Notification),
    /// Run a storage check now.
    CheckStorage,
    /// Run a storage check once the connection is no longer busy.
    FlagCheck,
    /// Close the connection.
    Close,
}

/// Sender half of a connection's command channel.
pub type CommandSender = mpsc::UnboundedSender<Command>;

/// Cloneable reference to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    uaid: Uaid,
    connected_at: i64,
    flow: FlowController,
    commands: CommandSender,
}

impl ConnectionHandle {
    /// Create a handle.
    #[must_use]
    pub fn new(
        id: Uuid,
        uaid: Uaid,
        connected_at: i64,
        flow: FlowController,
        commands: CommandSender,
    ) -> Self {
        Self {
            id,
            uaid,
            connected_at,
            flow,
            commands,
        }
    }

    /// Unique id of the underlying connection.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The client.
    #[must_use]
    pub const fn uaid(&self) -> Uaid {
        self.uaid
    }

    /// Connection time in milliseconds since the epoch.
    #[must_use]
    pub const fn connected_at(&self) -> i64 {
        self.connected_at
    }

    /// Check if the connection is busy and not reading frames.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.flow.is_paused()
    }

    /// Send a command. Returns false if the connection has already ended.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Ask the connection to close.
    pub fn close(&self) {
        if !self.send(Command::Close) {
            debug!(uaid = %self.uaid, connection_id = %self.id, "Close requested for finished connection");
        }
    }
}

/// Outcome of [`ClientRegistry::claim`].
#[derive(Debug)]
pub enum Claim {
    /// The handle is now registered. `displaced` is the older connection it
    /// replaced, which the caller must close.
    Claimed {
        /// Replaced connection, if any.
        displaced: Option<ConnectionHandle>,
    },
    /// A local connection at least as new already holds the uaid.
    Superseded,
}

/// Map of uaid → live local connection.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<Uaid, ConnectionHandle>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for its uaid.
    ///
    /// A strictly newer `connected_at` replaces the current holder; on a tie
    /// the current holder stays.
    pub fn claim(&self, handle: ConnectionHandle) -> Claim {
        let mut clients = self.clients.write();
        if let Some(existing) = clients.get(&handle.uaid) {
            if handle.connected_at <= existing.connected_at {
                return Claim::Superseded;
            }
        }
        let displaced = clients.insert(handle.uaid, handle);
        Claim::Claimed { displaced }
    }

    /// Remove the entry for `uaid` only if it belongs to `connection_id`.
    pub fn remove_if_current(&self, uaid: Uaid, connection_id: Uuid) -> bool {
        let mut clients = self.clients.write();
        if clients.get(&uaid).is_some_and(|h| h.id == connection_id) {
            clients.remove(&uaid);
            true
        } else {
            false
        }
    }

    /// Look up the live connection for a uaid.
    #[must_use]
    pub fn get(&self, uaid: Uaid) -> Option<ConnectionHandle> {
        self.clients.read().get(&uaid).cloned()
    }

    /// Number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Check if no clients are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}
