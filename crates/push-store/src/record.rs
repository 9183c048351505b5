//! Registry records.

use push_proto::{ProtocolMode, Uaid};
use serde::{Deserialize, Serialize};

/// Durable registry entry binding a uaid to the node holding its connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    /// The client.
    pub uaid: Uaid,
    /// Router URL of the node the client is connected to.
    pub node_id: String,
    /// Connection time in milliseconds since the epoch.
    pub connected_at: i64,
    /// Protocol mode of the connection.
    pub router_type: ProtocolMode,
}

impl RegistryRecord {
    /// Create a new record.
    #[must_use]
    pub fn new(
        uaid: Uaid,
        node_id: impl Into<String>,
        connected_at: i64,
        router_type: ProtocolMode,
    ) -> Self {
        Self {
            uaid,
            node_id: node_id.into(),
            connected_at,
            router_type,
        }
    }
}

/// Outcome of [`Router::register_user`](crate::Router::register_user).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// False when a newer connection already holds the registry entry.
    pub registered: bool,
    /// The entry that was replaced, if any.
    pub previous: Option<RegistryRecord>,
}

impl Registration {
    /// A successful registration.
    #[must_use]
    pub const fn registered(previous: Option<RegistryRecord>) -> Self {
        Self {
            registered: true,
            previous,
        }
    }

    /// A rejected registration.
    #[must_use]
    pub const fn rejected() -> Self {
        Self {
            registered: false,
            previous: None,
        }
    }
}
