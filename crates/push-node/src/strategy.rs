//! Per-mode delivery and acknowledgement tracking.
//!
//! A connection picks one [`DeliveryStrategy`] at hello time and keeps it for
//! its lifetime. Strategies own the `updates_sent` (delivered from storage,
//! awaiting ack) and `direct_updates` (delivered straight from a peer,
//! not stored) maps and decide what to send, what to drop and which backend
//! writes an ack requires.
//!
//! A stored notification is only forgotten once its backend delete is
//! confirmed through [`DeliveryStrategy::confirm_delete`]. The backend has no
//! range delete, so forgetting it earlier would let the next fetch deliver it
//! again.

use std::collections::HashMap;
use std::fmt;
use std::future;

use push_proto::{
    ChannelId, Notification, ProtocolMode, ServerMessage, SimpleUpdate, Uaid, Version,
};
use push_store::{BackendFuture, Backends, Mutation};
use tracing::{debug, warn};

/// Result of a storage fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// Simplepush channel versions.
    Simple(Vec<SimpleUpdate>),
    /// One page of webpush messages.
    Messages(Vec<Notification>),
}

/// Frames produced from a fetch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    /// Frames to send, in order.
    pub frames: Vec<ServerMessage>,
    /// True when storage may hold further pages.
    pub more: bool,
}

/// Mode-specific delivery behavior behind one connection interface.
pub trait DeliveryStrategy: Send + fmt::Debug {
    /// The protocol mode this strategy implements.
    fn mode(&self) -> ProtocolMode;

    /// Start a storage fetch.
    fn fetch(&self, backends: Backends, uaid: Uaid, limit: usize)
    -> BackendFuture<'static, Fetched>;

    /// Record a fetch result and build the frames to deliver.
    fn accept_fetched(&mut self, fetched: Fetched) -> Batch;

    /// Deliver a notification handed over by a peer node. Returns `None` when
    /// the notification is stale.
    fn deliver_direct(&mut self, notification: Notification) -> Option<ServerMessage>;

    /// Resolve one ack entry. Returns the backend delete to run, if any.
    fn ack(&mut self, uaid: Uaid, channel_id: ChannelId, version: &Version) -> Option<Mutation>;

    /// Forget the entry a completed ack delete referred to.
    fn confirm_delete(&mut self, mutation: &Mutation);

    /// True while delivered stored notifications are still unacknowledged and
    /// storage must not be fetched again.
    fn awaiting_acks(&self) -> bool;

    /// Drop all tracked state for a channel.
    fn clear_channel(&mut self, channel_id: ChannelId);

    /// Backend cleanup for an unregistered channel.
    fn unregister_mutations(&self, uaid: Uaid, channel_id: ChannelId) -> Vec<Mutation>;

    /// Backend setup for a newly registered channel.
    fn prepare_channel(
        &self,
        backends: Backends,
        uaid: Uaid,
        channel_id: ChannelId,
    ) -> BackendFuture<'static, ()>;

    /// Drain undelivered-to-storage direct updates as save mutations.
    fn take_direct_updates(&mut self, uaid: Uaid) -> Vec<Mutation>;
}

/// Create the strategy for a protocol mode.
#[must_use]
pub fn for_mode(mode: ProtocolMode) -> Box<dyn DeliveryStrategy> {
    match mode {
        ProtocolMode::SimplePush => Box::new(SimplePushStrategy::new()),
        ProtocolMode::WebPush => Box::new(WebPushStrategy::new()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SentVersion {
    version: u64,
    deleting: bool,
}

/// Simplepush: one monotonic version per channel.
#[derive(Debug, Default)]
pub struct SimplePushStrategy {
    updates_sent: HashMap<ChannelId, SentVersion>,
    direct_updates: HashMap<ChannelId, u64>,
}

impl SimplePushStrategy {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Version delivered from storage and not yet forgotten.
    #[must_use]
    pub fn sent_version(&self, channel_id: ChannelId) -> Option<u64> {
        self.updates_sent.get(&channel_id).map(|s| s.version)
    }

    /// Version delivered directly and not yet acknowledged.
    #[must_use]
    pub fn direct_version(&self, channel_id: ChannelId) -> Option<u64> {
        self.direct_updates.get(&channel_id).copied()
    }

    /// Whether an update at `version` is already covered by what was sent.
    fn is_stale(&self, channel_id: ChannelId, version: u64) -> bool {
        self.sent_version(channel_id).is_some_and(|v| v >= version)
            || self.direct_version(channel_id).is_some_and(|v| v >= version)
    }
}

impl DeliveryStrategy for SimplePushStrategy {
    fn mode(&self) -> ProtocolMode {
        ProtocolMode::SimplePush
    }

    fn fetch(
        &self,
        backends: Backends,
        uaid: Uaid,
        _limit: usize,
    ) -> BackendFuture<'static, Fetched> {
        Box::pin(async move {
            backends
                .storage
                .fetch_notifications(uaid)
                .await
                .map(Fetched::Simple)
        })
    }

    fn accept_fetched(&mut self, fetched: Fetched) -> Batch {
        let Fetched::Simple(stored) = fetched else {
            warn!("simplepush connection received a webpush fetch result");
            return Batch::default();
        };

        let mut accepted = Vec::new();
        for update in stored {
            if self.is_stale(update.channel_id, update.version) {
                continue;
            }
            self.direct_updates.remove(&update.channel_id);
            self.updates_sent.insert(
                update.channel_id,
                SentVersion {
                    version: update.version,
                    deleting: false,
                },
            );
            accepted.push(update);
        }

        let frames = if accepted.is_empty() {
            Vec::new()
        } else {
            vec![ServerMessage::updates(accepted)]
        };
        Batch {
            frames,
            more: false,
        }
    }

    fn deliver_direct(&mut self, notification: Notification) -> Option<ServerMessage> {
        let chid = notification.channel_id;
        let Some(version) = notification.version.as_u64() else {
            debug!(channel_id = %chid, version = %notification.version, "Dropping non-integer simplepush version");
            return None;
        };
        if self.is_stale(chid, version) {
            return None;
        }
        self.direct_updates.insert(chid, version);
        Some(ServerMessage::updates(vec![SimpleUpdate::new(chid, version)]))
    }

    fn ack(&mut self, uaid: Uaid, channel_id: ChannelId, version: &Version) -> Option<Mutation> {
        let acked = version.as_u64()?;

        if self
            .direct_updates
            .get(&channel_id)
            .is_some_and(|v| *v <= acked)
        {
            self.direct_updates.remove(&channel_id);
            return None;
        }

        let sent = self.updates_sent.get_mut(&channel_id)?;
        if sent.deleting || sent.version > acked {
            return None;
        }
        sent.deleting = true;
        Some(Mutation::DeleteNotification {
            uaid,
            channel_id,
            version: Some(acked),
        })
    }

    fn confirm_delete(&mut self, mutation: &Mutation) {
        if let Mutation::DeleteNotification {
            channel_id,
            version: Some(acked),
            ..
        } = mutation
        {
            let confirmed = self
                .updates_sent
                .get(channel_id)
                .is_some_and(|s| s.deleting && s.version <= *acked);
            if confirmed {
                self.updates_sent.remove(channel_id);
            }
        }
    }

    fn awaiting_acks(&self) -> bool {
        false
    }

    fn clear_channel(&mut self, channel_id: ChannelId) {
        self.updates_sent.remove(&channel_id);
        self.direct_updates.remove(&channel_id);
    }

    fn unregister_mutations(&self, uaid: Uaid, channel_id: ChannelId) -> Vec<Mutation> {
        vec![Mutation::DeleteNotification {
            uaid,
            channel_id,
            version: None,
        }]
    }

    fn prepare_channel(
        &self,
        _backends: Backends,
        _uaid: Uaid,
        _channel_id: ChannelId,
    ) -> BackendFuture<'static, ()> {
        Box::pin(future::ready(Ok(())))
    }

    fn take_direct_updates(&mut self, uaid: Uaid) -> Vec<Mutation> {
        self.direct_updates
            .drain()
            .map(|(channel_id, version)| Mutation::SaveNotification {
                uaid,
                channel_id,
                version,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SentMessage {
    notification: Notification,
    deleting: bool,
}

impl SentMessage {
    fn matches(&self, message_id: &str) -> bool {
        self.notification.version.as_message_id() == message_id
    }
}

/// Webpush: any number of individually acknowledged messages per channel.
#[derive(Debug, Default)]
pub struct WebPushStrategy {
    updates_sent: HashMap<ChannelId, Vec<SentMessage>>,
    direct_updates: HashMap<ChannelId, Vec<Notification>>,
}

impl WebPushStrategy {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages delivered on a channel and not yet forgotten.
    #[must_use]
    pub fn sent_count(&self, channel_id: ChannelId) -> usize {
        self.updates_sent.get(&channel_id).map_or(0, Vec::len)
    }

    /// Number of direct messages on a channel awaiting ack.
    #[must_use]
    pub fn direct_count(&self, channel_id: ChannelId) -> usize {
        self.direct_updates.get(&channel_id).map_or(0, Vec::len)
    }
}

impl DeliveryStrategy for WebPushStrategy {
    fn mode(&self) -> ProtocolMode {
        ProtocolMode::WebPush
    }

    fn fetch(
        &self,
        backends: Backends,
        uaid: Uaid,
        limit: usize,
    ) -> BackendFuture<'static, Fetched> {
        Box::pin(async move {
            backends
                .messages
                .fetch_messages(uaid, limit)
                .await
                .map(Fetched::Messages)
        })
    }

    fn accept_fetched(&mut self, fetched: Fetched) -> Batch {
        let Fetched::Messages(page) = fetched else {
            warn!("webpush connection received a simplepush fetch result");
            return Batch::default();
        };

        let more = !page.is_empty();
        let mut frames = Vec::with_capacity(page.len());
        for notification in page {
            frames.push(ServerMessage::message(&notification));
            self.updates_sent
                .entry(notification.channel_id)
                .or_default()
                .push(SentMessage {
                    notification,
                    deleting: false,
                });
        }
        Batch { frames, more }
    }

    fn deliver_direct(&mut self, notification: Notification) -> Option<ServerMessage> {
        let frame = ServerMessage::message(&notification);
        self.direct_updates
            .entry(notification.channel_id)
            .or_default()
            .push(notification);
        Some(frame)
    }

    fn ack(&mut self, uaid: Uaid, channel_id: ChannelId, version: &Version) -> Option<Mutation> {
        let message_id = version.as_message_id();

        if let Some(direct) = self.direct_updates.get_mut(&channel_id) {
            if let Some(pos) = direct
                .iter()
                .position(|n| n.version.as_message_id() == message_id)
            {
                direct.remove(pos);
                if direct.is_empty() {
                    self.direct_updates.remove(&channel_id);
                }
                return None;
            }
        }

        let sent = self
            .updates_sent
            .get_mut(&channel_id)?
            .iter_mut()
            .find(|s| s.matches(&message_id))?;
        if sent.deleting {
            return None;
        }
        sent.deleting = true;
        Some(Mutation::DeleteMessage {
            uaid,
            channel_id,
            message_id,
        })
    }

    fn confirm_delete(&mut self, mutation: &Mutation) {
        let Mutation::DeleteMessage {
            channel_id,
            message_id,
            ..
        } = mutation
        else {
            return;
        };
        if let Some(sent) = self.updates_sent.get_mut(channel_id) {
            if let Some(pos) = sent
                .iter()
                .position(|s| s.deleting && s.matches(message_id))
            {
                sent.remove(pos);
            }
            if sent.is_empty() {
                self.updates_sent.remove(channel_id);
            }
        }
    }

    fn awaiting_acks(&self) -> bool {
        self.updates_sent.values().any(|sent| !sent.is_empty())
    }

    fn clear_channel(&mut self, channel_id: ChannelId) {
        self.updates_sent.remove(&channel_id);
        self.direct_updates.remove(&channel_id);
    }

    fn unregister_mutations(&self, uaid: Uaid, channel_id: ChannelId) -> Vec<Mutation> {
        vec![
            Mutation::UnregisterChannel { uaid, channel_id },
            Mutation::DeleteMessagesForChannel { uaid, channel_id },
        ]
    }

    fn prepare_channel(
        &self,
        backends: Backends,
        uaid: Uaid,
        channel_id: ChannelId,
    ) -> BackendFuture<'static, ()> {
        Box::pin(async move { backends.messages.register_channel(uaid, channel_id).await })
    }

    fn take_direct_updates(&mut self, uaid: Uaid) -> Vec<Mutation> {
        self.direct_updates
            .drain()
            .flat_map(|(_, notifications)| notifications)
            .map(|notification| Mutation::StoreMessage { uaid, notification })
            .collect()
    }
}
