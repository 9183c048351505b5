//! Backend traits consumed by the connection node.
//!
//! Every operation is asynchronous and object safe: futures are boxed and
//! `Send` so callers can spawn them onto the runtime and keep the trait
//! objects behind `Arc<dyn ...>`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use push_proto::{ChannelId, Notification, SimpleUpdate, Uaid};

use crate::endpoint::PathEndpointMinter;
use crate::error::BackendResult;
use crate::memory::MemoryBackend;
use crate::record::{Registration, RegistryRecord};

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

/// Durable uaid → node registry.
pub trait Router: Send + Sync + fmt::Debug {
    /// Record that `record.uaid` is now connected to `record.node_id`.
    ///
    /// The write is conditional: it succeeds only when no entry exists or the
    /// stored entry has an older `connected_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn register_user(&self, record: RegistryRecord) -> BackendFuture<'_, Registration>;

    /// Look up the registry entry for a uaid.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn get_uaid(&self, uaid: Uaid) -> BackendFuture<'_, Option<RegistryRecord>>;
}

/// Simplepush storage: one monotonic version per channel.
pub trait SimpleStorage: Send + Sync + fmt::Debug {
    /// All stored channel versions for a uaid.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn fetch_notifications(&self, uaid: Uaid) -> BackendFuture<'_, Vec<SimpleUpdate>>;

    /// Store a version, keeping the higher of the stored and given versions.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn save_notification(
        &self,
        uaid: Uaid,
        channel_id: ChannelId,
        version: u64,
    ) -> BackendFuture<'_, ()>;

    /// Delete a stored version. With `Some(version)`, a newer stored version
    /// is left in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn delete_notification(
        &self,
        uaid: Uaid,
        channel_id: ChannelId,
        version: Option<u64>,
    ) -> BackendFuture<'_, ()>;
}

/// Webpush message storage.
pub trait MessageStore: Send + Sync + fmt::Debug {
    /// Record a channel as registered for a uaid.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn register_channel(&self, uaid: Uaid, channel_id: ChannelId) -> BackendFuture<'_, ()>;

    /// Remove a channel registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn unregister_channel(&self, uaid: Uaid, channel_id: ChannelId) -> BackendFuture<'_, ()>;

    /// Fetch up to `limit` unexpired stored messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn fetch_messages(&self, uaid: Uaid, limit: usize) -> BackendFuture<'_, Vec<Notification>>;

    /// Persist a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn store_message(&self, uaid: Uaid, notification: Notification) -> BackendFuture<'_, ()>;

    /// Delete one stored message.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn delete_message(
        &self,
        uaid: Uaid,
        channel_id: ChannelId,
        message_id: String,
    ) -> BackendFuture<'_, ()>;

    /// Delete every stored message of a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn delete_messages_for_channel(
        &self,
        uaid: Uaid,
        channel_id: ChannelId,
    ) -> BackendFuture<'_, ()>;
}

/// Mints the public push endpoint for a channel.
pub trait EndpointMinter: Send + Sync + fmt::Debug {
    /// Build the endpoint URL application servers will push to.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be produced.
    fn make_endpoint(&self, uaid: Uaid, channel_id: ChannelId) -> BackendFuture<'_, String>;
}

/// A best-effort backend write, described as data so it can be queued and
/// retried without holding on to the connection that requested it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Persist a simplepush version.
    SaveNotification {
        /// Owner.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
        /// Version to store.
        version: u64,
    },
    /// Delete a simplepush version.
    DeleteNotification {
        /// Owner.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
        /// Upper bound of the version to delete, or any version.
        version: Option<u64>,
    },
    /// Persist a webpush message.
    StoreMessage {
        /// Owner.
        uaid: Uaid,
        /// Message to store.
        notification: Notification,
    },
    /// Delete one webpush message.
    DeleteMessage {
        /// Owner.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
        /// Message id.
        message_id: String,
    },
    /// Remove a webpush channel registration.
    UnregisterChannel {
        /// Owner.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
    },
    /// Delete all stored webpush messages of a channel.
    DeleteMessagesForChannel {
        /// Owner.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
    },
}

impl Mutation {
    /// The uaid this mutation belongs to.
    #[must_use]
    pub const fn uaid(&self) -> Uaid {
        match self {
            Self::SaveNotification { uaid, .. }
            | Self::DeleteNotification { uaid, .. }
            | Self::StoreMessage { uaid, .. }
            | Self::DeleteMessage { uaid, .. }
            | Self::UnregisterChannel { uaid, .. }
            | Self::DeleteMessagesForChannel { uaid, .. } => *uaid,
        }
    }

    /// Short operation name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SaveNotification { .. } => "save_notification",
            Self::DeleteNotification { .. } => "delete_notification",
            Self::StoreMessage { .. } => "store_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::UnregisterChannel { .. } => "unregister_channel",
            Self::DeleteMessagesForChannel { .. } => "delete_messages_for_channel",
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.uaid())
    }
}

/// The set of backends one node talks to.
#[derive(Debug, Clone)]
pub struct Backends {
    /// Uaid registry.
    pub router: Arc<dyn Router>,
    /// Simplepush storage.
    pub storage: Arc<dyn SimpleStorage>,
    /// Webpush storage.
    pub messages: Arc<dyn MessageStore>,
    /// Endpoint minting.
    pub endpoints: Arc<dyn EndpointMinter>,
}

impl Backends {
    /// Create a backend set from its parts.
    #[must_use]
    pub fn new(
        router: Arc<dyn Router>,
        storage: Arc<dyn SimpleStorage>,
        messages: Arc<dyn MessageStore>,
        endpoints: Arc<dyn EndpointMinter>,
    ) -> Self {
        Self {
            router,
            storage,
            messages,
            endpoints,
        }
    }

    /// Use one in-process [`MemoryBackend`] for registry and storage.
    #[must_use]
    pub fn in_memory(backend: Arc<MemoryBackend>, endpoint_url: impl Into<String>) -> Self {
        Self {
            router: backend.clone(),
            storage: backend.clone(),
            messages: backend,
            endpoints: Arc::new(PathEndpointMinter::new(endpoint_url)),
        }
    }

    /// Execute a queued mutation.
    ///
    /// # Errors
    ///
    /// Returns the backend's error unchanged.
    pub async fn apply(&self, mutation: &Mutation) -> BackendResult<()> {
        match mutation.clone() {
            Mutation::SaveNotification {
                uaid,
                channel_id,
                version,
            } => self.storage.save_notification(uaid, channel_id, version).await,
            Mutation::DeleteNotification {
                uaid,
                channel_id,
                version,
            } => self.storage.delete_notification(uaid, channel_id, version).await,
            Mutation::StoreMessage { uaid, notification } => {
                self.messages.store_message(uaid, notification).await
            }
            Mutation::DeleteMessage {
                uaid,
                channel_id,
                message_id,
            } => {
                self.messages
                    .delete_message(uaid, channel_id, message_id)
                    .await
            }
            Mutation::UnregisterChannel { uaid, channel_id } => {
                self.messages.unregister_channel(uaid, channel_id).await
            }
            Mutation::DeleteMessagesForChannel { uaid, channel_id } => {
                self.messages
                    .delete_messages_for_channel(uaid, channel_id)
                    .await
            }
        }
    }
}
