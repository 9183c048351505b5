//! # push-node
//!
//! Push notification connection node.
//!
//! The node holds long-lived client websockets, delivers stored and directly
//! routed notifications to them, tracks acknowledgements, and coordinates
//! with peer nodes when a client moves between nodes.
//!
//! ## Architecture
//!
//! ```text
//!                 websocket                      HTTP (private)
//! ┌────────┐   ┌──────────────┐   ┌────────────┐   ┌─────────────┐
//! │ client │◄─►│  Connection  │◄──│  Client    │◄──│   router    │◄── peer nodes
//! └────────┘   │ (one task)   │   │  Registry  │   │  handlers   │
//!              │  + strategy  │   └────────────┘   └─────────────┘
//!              └──────┬───────┘
//!                     │ fetch / register / ack deletes
//!              ┌──────▼───────┐   ┌────────────┐
//!              │   Backends   │◄──│ RetryQueue │
//!              └──────────────┘   └────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use push_node::{NodeConfig, NodeState, PushServer};
//! use push_store::{Backends, MemoryBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = NodeConfig::new("0.0.0.0:8080".parse()?)
//!         .with_router_url("http://10.0.0.5:8081");
//!     let backends = Backends::in_memory(Arc::new(MemoryBackend::new()), &config.endpoint_url);
//!     let state = Arc::new(NodeState::new(config, backends)?);
//!
//!     PushServer::new(state).serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Client Protocol
//!
//! One JSON object per text frame:
//!
//! - **hello**: handshake, binds a uaid and a protocol mode
//! - **register** / **unregister**: manage channels
//! - **ack**: acknowledge delivered notifications
//! - `{}`: ping, answered at most once per ping interval

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod error;
pub mod flow;
pub mod notifier;
pub mod registry;
pub mod retry;
pub mod router;
pub mod server;
pub mod state;
pub mod strategy;

pub use config::{NodeConfig, RetryConfig};
pub use connection::{Connection, ConnectionState, Outbound};
pub use error::{ServerError, ServerResult};
pub use flow::FlowController;
pub use notifier::Notifier;
pub use registry::{Claim, ClientRegistry, Command, ConnectionHandle};
pub use retry::{CircuitBreaker, RetryHandle, RetryOutcome, RetryQueue};
pub use router::create_router;
pub use server::PushServer;
pub use state::NodeState;
pub use strategy::{DeliveryStrategy, SimplePushStrategy, WebPushStrategy};
