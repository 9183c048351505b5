//! # push-store
//!
//! The storage and registry contract the push connection node depends on.
//!
//! The node never talks to a database directly. It consumes four narrow
//! traits:
//!
//! - [`Router`]: the durable uaid → node registry
//! - [`SimpleStorage`]: one version per channel (simplepush)
//! - [`MessageStore`]: individually addressable messages (webpush)
//! - [`EndpointMinter`]: push endpoint URLs for new channels
//!
//! [`MemoryBackend`] implements the storage traits in process, for the
//! standalone binary and for tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod record;

pub use backend::{
    BackendFuture, Backends, EndpointMinter, MessageStore, Mutation, Router, SimpleStorage,
};
pub use endpoint::PathEndpointMinter;
pub use error::{BackendError, BackendResult};
pub use memory::{MemoryBackend, Operation};
pub use record::{Registration, RegistryRecord};
