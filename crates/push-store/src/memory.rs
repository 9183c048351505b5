//! In-process backend.
//!
//! Holds the registry and both notification stores in memory. Every call is
//! recorded in an operation log, and tests can inject transient failures or
//! hold deletes open to observe in-flight behavior.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use push_proto::{ChannelId, Notification, SimpleUpdate, Uaid};
use tokio::sync::watch;
use tracing::debug;

use crate::backend::{BackendFuture, MessageStore, Router, SimpleStorage};
use crate::error::{BackendError, BackendResult};
use crate::record::{Registration, RegistryRecord};

/// A backend call, as recorded in the operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// `register_user`.
    RegisterUser {
        /// Uaid.
        uaid: Uaid,
        /// Connection time of the registering connection.
        connected_at: i64,
    },
    /// `get_uaid`.
    GetUaid(Uaid),
    /// `fetch_notifications`.
    FetchNotifications(Uaid),
    /// `save_notification`.
    SaveNotification {
        /// Uaid.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
        /// Version.
        version: u64,
    },
    /// `delete_notification`.
    DeleteNotification {
        /// Uaid.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
        /// Version bound.
        version: Option<u64>,
    },
    /// `register_channel`.
    RegisterChannel {
        /// Uaid.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
    },
    /// `unregister_channel`.
    UnregisterChannel {
        /// Uaid.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
    },
    /// `fetch_messages`.
    FetchMessages(Uaid),
    /// `store_message`.
    StoreMessage {
        /// Uaid.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
        /// Message id.
        message_id: String,
    },
    /// `delete_message`.
    DeleteMessage {
        /// Uaid.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
        /// Message id.
        message_id: String,
    },
    /// `delete_messages_for_channel`.
    DeleteMessagesForChannel {
        /// Uaid.
        uaid: Uaid,
        /// Channel.
        channel_id: ChannelId,
    },
}

impl Operation {
    /// Check if this is one of the delete calls.
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(
            self,
            Self::DeleteNotification { .. }
                | Self::DeleteMessage { .. }
                | Self::DeleteMessagesForChannel { .. }
        )
    }
}

#[derive(Debug)]
struct StoredMessage {
    notification: Notification,
    stored_at: Instant,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.notification
            .ttl
            .is_some_and(|ttl| now >= self.stored_at + Duration::from_secs(ttl))
    }
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<Uaid, RegistryRecord>,
    versions: HashMap<Uaid, HashMap<ChannelId, u64>>,
    channels: HashMap<Uaid, HashSet<ChannelId>>,
    messages: HashMap<Uaid, Vec<StoredMessage>>,
    operations: Vec<Operation>,
    pending_failures: u32,
}

impl Inner {
    fn begin(&mut self, op: Operation) -> BackendResult<()> {
        debug!(operation = ?op, "memory backend call");
        self.operations.push(op);
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(BackendError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

/// In-memory implementation of [`Router`], [`SimpleStorage`] and
/// [`MessageStore`].
#[derive(Debug)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    deletes_held: watch::Sender<bool>,
    fetches_held: watch::Sender<bool>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        let (deletes_held, _) = watch::channel(false);
        let (fetches_held, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner::default()),
            deletes_held,
            fetches_held,
        }
    }

    /// Make the next `count` calls fail with [`BackendError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.inner.lock().pending_failures = count;
    }

    /// While held, delete calls are logged but do not complete.
    pub fn hold_deletes(&self, held: bool) {
        self.deletes_held.send_replace(held);
    }

    /// While held, fetch calls are logged but do not complete.
    pub fn hold_fetches(&self, held: bool) {
        self.fetches_held.send_replace(held);
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        self.inner.lock().operations.clone()
    }

    /// Number of delete calls made so far.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.inner
            .lock()
            .operations
            .iter()
            .filter(|op| op.is_delete())
            .count()
    }

    /// Current registry entry for a uaid, bypassing the operation log.
    #[must_use]
    pub fn record(&self, uaid: Uaid) -> Option<RegistryRecord> {
        self.inner.lock().users.get(&uaid).cloned()
    }

    /// Seed a registry entry, bypassing the conditional write.
    pub fn insert_record(&self, record: RegistryRecord) {
        self.inner.lock().users.insert(record.uaid, record);
    }

    /// Number of stored messages for a uaid, including expired ones.
    #[must_use]
    pub fn stored_message_count(&self, uaid: Uaid) -> usize {
        self.inner.lock().messages.get(&uaid).map_or(0, Vec::len)
    }

    async fn wait_for_deletes(&self) {
        released(&self.deletes_held).await;
    }

    async fn wait_for_fetches(&self) {
        released(&self.fetches_held).await;
    }
}

async fn released(gate: &watch::Sender<bool>) {
    let mut rx = gate.subscribe();
    // The sender lives as long as the backend, so this only ends once released.
    let _ = rx.wait_for(|held| !*held).await;
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Router for MemoryBackend {
    fn register_user(&self, record: RegistryRecord) -> BackendFuture<'_, Registration> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.begin(Operation::RegisterUser {
                uaid: record.uaid,
                connected_at: record.connected_at,
            })?;

            let newer_exists = inner
                .users
                .get(&record.uaid)
                .is_some_and(|existing| existing.connected_at >= record.connected_at);
            if newer_exists {
                return Ok(Registration::rejected());
            }

            let previous = inner.users.insert(record.uaid, record);
            Ok(Registration::registered(previous))
        })
    }

    fn get_uaid(&self, uaid: Uaid) -> BackendFuture<'_, Option<RegistryRecord>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.begin(Operation::GetUaid(uaid))?;
            Ok(inner.users.get(&uaid).cloned())
        })
    }
}

impl SimpleStorage for MemoryBackend {
    fn fetch_notifications(&self, uaid: Uaid) -> BackendFuture<'_, Vec<SimpleUpdate>> {
        Box::pin(async move {
            self.inner
                .lock()
                .begin(Operation::FetchNotifications(uaid))?;
            self.wait_for_fetches().await;

            let inner = self.inner.lock();
            let mut updates: Vec<SimpleUpdate> = inner
                .versions
                .get(&uaid)
                .map(|channels| {
                    channels
                        .iter()
                        .map(|(chid, version)| SimpleUpdate::new(*chid, *version))
                        .collect()
                })
                .unwrap_or_default();
            updates.sort_by_key(|u| u.channel_id);
            Ok(updates)
        })
    }

    fn save_notification(
        &self,
        uaid: Uaid,
        channel_id: ChannelId,
        version: u64,
    ) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.begin(Operation::SaveNotification {
                uaid,
                channel_id,
                version,
            })?;
            let stored = inner
                .versions
                .entry(uaid)
                .or_default()
                .entry(channel_id)
                .or_insert(version);
            *stored = (*stored).max(version);
            Ok(())
        })
    }

    fn delete_notification(
        &self,
        uaid: Uaid,
        channel_id: ChannelId,
        version: Option<u64>,
    ) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            self.inner.lock().begin(Operation::DeleteNotification {
                uaid,
                channel_id,
                version,
            })?;
            self.wait_for_deletes().await;

            let mut inner = self.inner.lock();
            if let Some(channels) = inner.versions.get_mut(&uaid) {
                let removable = channels
                    .get(&channel_id)
                    .is_some_and(|stored| version.is_none_or(|v| *stored <= v));
                if removable {
                    channels.remove(&channel_id);
                }
            }
            Ok(())
        })
    }
}

impl MessageStore for MemoryBackend {
    fn register_channel(&self, uaid: Uaid, channel_id: ChannelId) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.begin(Operation::RegisterChannel { uaid, channel_id })?;
            inner.channels.entry(uaid).or_default().insert(channel_id);
            Ok(())
        })
    }

    fn unregister_channel(&self, uaid: Uaid, channel_id: ChannelId) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.begin(Operation::UnregisterChannel { uaid, channel_id })?;
            if let Some(channels) = inner.channels.get_mut(&uaid) {
                channels.remove(&channel_id);
            }
            Ok(())
        })
    }

    fn fetch_messages(&self, uaid: Uaid, limit: usize) -> BackendFuture<'_, Vec<Notification>> {
        Box::pin(async move {
            self.inner.lock().begin(Operation::FetchMessages(uaid))?;
            self.wait_for_fetches().await;

            let inner = self.inner.lock();
            let now = Instant::now();
            let page = inner
                .messages
                .get(&uaid)
                .map(|stored| {
                    stored
                        .iter()
                        .filter(|m| !m.is_expired(now))
                        .take(limit)
                        .map(|m| m.notification.clone())
                        .collect()
                })
                .unwrap_or_default();
            Ok(page)
        })
    }

    fn store_message(&self, uaid: Uaid, notification: Notification) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.begin(Operation::StoreMessage {
                uaid,
                channel_id: notification.channel_id,
                message_id: notification.version.as_message_id(),
            })?;
            inner.messages.entry(uaid).or_default().push(StoredMessage {
                notification,
                stored_at: Instant::now(),
            });
            Ok(())
        })
    }

    fn delete_message(
        &self,
        uaid: Uaid,
        channel_id: ChannelId,
        message_id: String,
    ) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            self.inner.lock().begin(Operation::DeleteMessage {
                uaid,
                channel_id,
                message_id: message_id.clone(),
            })?;
            self.wait_for_deletes().await;

            let mut inner = self.inner.lock();
            if let Some(stored) = inner.messages.get_mut(&uaid) {
                stored.retain(|m| {
                    m.notification.channel_id != channel_id
                        || m.notification.version.as_message_id() != message_id
                });
            }
            Ok(())
        })
    }

    fn delete_messages_for_channel(
        &self,
        uaid: Uaid,
        channel_id: ChannelId,
    ) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            self.inner
                .lock()
                .begin(Operation::DeleteMessagesForChannel { uaid, channel_id })?;
            self.wait_for_deletes().await;

            let mut inner = self.inner.lock();
            if let Some(stored) = inner.messages.get_mut(&uaid) {
                stored.retain(|m| m.notification.channel_id != channel_id);
            }
            Ok(())
        })
    }
}
