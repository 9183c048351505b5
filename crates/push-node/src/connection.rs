//! Per-client connection state machine.
//!
//! Each connection runs as one task. Frames, router commands and the
//! completions of its own background work are handled one at a time in
//! [`Connection::run`], so connection state needs no locking. Background work
//! (registry registration, endpoint minting, fetches, ack deletes, delayed
//! pings) runs in a per-connection [`JoinSet`] that is aborted on teardown.
//! Work that must outlive the connection goes through the retry queue or is
//! spawned detached.

use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use push_proto::{
    AckUpdate, ChannelId, ClientMessage, MessageType, Notification, ProtocolMode, ServerMessage,
    Uaid,
};
use push_store::{BackendResult, Mutation, Registration, RegistryRecord};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ServerResult;
use crate::flow::FlowController;
use crate::registry::{Claim, Command, CommandSender, ConnectionHandle};
use crate::retry::RetryOutcome;
use crate::state::NodeState;
use crate::strategy::{self, DeliveryStrategy, Fetched};

/// Frames queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A JSON text frame.
    Text(String),
    /// Close the socket.
    Close,
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, loop not started.
    Connecting,
    /// Waiting for the first frame, which must be a hello.
    AwaitingHello,
    /// Hello received, registry registration in flight.
    Registering,
    /// Hello completed.
    Ready,
    /// Close requested; teardown follows.
    Closing,
    /// Torn down.
    Closed,
}

impl ConnectionState {
    /// Check if the connection is on its way out.
    #[must_use]
    pub const fn is_closing(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Completions of background work, handled on the connection task.
#[derive(Debug)]
enum Event {
    Registered(BackendResult<Registration>),
    ChannelRegistered {
        channel_id: ChannelId,
        raw: String,
        result: BackendResult<String>,
    },
    Fetched {
        generation: u64,
        result: BackendResult<Fetched>,
    },
    AcksSettled(Vec<(Mutation, RetryOutcome)>),
    PingDue,
    RetryFetch,
}

#[derive(Debug)]
struct Client {
    uaid: Uaid,
    strategy: Box<dyn DeliveryStrategy>,
}

/// One client connection.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    node: Arc<NodeState>,
    state: ConnectionState,
    connected_at: i64,
    client: Option<Client>,
    flow: FlowController,
    outbound: mpsc::UnboundedSender<Outbound>,
    commands_tx: CommandSender,
    commands: mpsc::UnboundedReceiver<Command>,
    tasks: JoinSet<Option<Event>>,
    fetch: Option<AbortHandle>,
    fetch_generation: u64,
    check_requested: bool,
    more_pending: bool,
    retry_scheduled: bool,
    last_ping: Option<Instant>,
}

impl Connection {
    /// Create a connection whose replies are written to `outbound`.
    #[must_use]
    pub fn new(node: Arc<NodeState>, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            node,
            state: ConnectionState::Connecting,
            connected_at: Utc::now().timestamp_millis(),
            client: None,
            flow: FlowController::new(),
            outbound,
            commands_tx,
            commands,
            tasks: JoinSet::new(),
            fetch: None,
            fetch_generation: 0,
            check_requested: false,
            more_pending: false,
            retry_scheduled: false,
            last_ping: None,
        }
    }

    /// Override the connection time (milliseconds since the epoch).
    #[must_use]
    pub const fn with_connected_at(mut self, connected_at: i64) -> Self {
        self.connected_at = connected_at;
        self
    }

    /// Unique connection id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Connection time in milliseconds since the epoch.
    #[must_use]
    pub const fn connected_at(&self) -> i64 {
        self.connected_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// The client's uaid, once hello has been received.
    #[must_use]
    pub fn uaid(&self) -> Option<Uaid> {
        self.client.as_ref().map(|c| c.uaid)
    }

    /// Drive the connection until it closes.
    ///
    /// `frames` yields inbound text frames; an error item or the end of the
    /// stream closes the connection. The stream is not polled while the
    /// connection is paused.
    pub async fn run<S>(mut self, mut frames: S)
    where
        S: Stream<Item = ServerResult<String>> + Unpin + Send,
    {
        self.state = ConnectionState::AwaitingHello;
        debug!(connection_id = %self.id, "Connection started");

        while !self.state.is_closing() {
            let paused = self.flow.is_paused();
            tokio::select! {
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Ok(Some(event)) = joined {
                        self.handle_event(event);
                    }
                }
                frame = frames.next(), if !paused => match frame {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(e)) => {
                        debug!(connection_id = %self.id, error = %e, "Dropping client after bad frame");
                        self.close();
                    }
                    None => {
                        debug!(connection_id = %self.id, "Client disconnected");
                        self.close();
                    }
                },
            }
        }

        self.teardown();
    }

    // ==================== Frames ====================

    fn handle_frame(&mut self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection_id = %self.id, error = %e, "Malformed frame");
                self.close();
                return;
            }
        };

        let Some(uaid) = self.uaid() else {
            if let ClientMessage::Hello { uaid, use_webpush } = message {
                self.process_hello(uaid.as_deref(), use_webpush);
            } else {
                debug!(connection_id = %self.id, "Frame received before hello");
                self.close();
            }
            return;
        };

        match message {
            ClientMessage::Hello { .. } => {
                self.send(ServerMessage::error(MessageType::Hello, "duplicate hello", 401));
                self.close();
            }
            ClientMessage::Register { channel_id } => {
                self.process_register(uaid, channel_id.as_deref());
            }
            ClientMessage::Unregister { channel_id, raw } => {
                self.process_unregister(uaid, channel_id.as_deref(), raw);
            }
            ClientMessage::Ack { updates } => self.process_ack(uaid, updates),
            ClientMessage::Ping => self.process_ping(),
            ClientMessage::Unknown(kind) => {
                debug!(uaid = %uaid, message_type = %kind, "Unknown message type");
                self.close();
            }
        }
    }

    fn process_hello(&mut self, offered: Option<&str>, use_webpush: bool) {
        let uaid = Uaid::from_client(offered);
        let mode = ProtocolMode::from_use_webpush(use_webpush);
        self.client = Some(Client {
            uaid,
            strategy: strategy::for_mode(mode),
        });
        self.state = ConnectionState::Registering;
        self.flow.pause();

        debug!(uaid = %uaid, mode = %mode, connection_id = %self.id, "Registering client");
        let record = RegistryRecord::new(uaid, self.node.router_url(), self.connected_at, mode);
        let router = self.node.backends().router.clone();
        self.tasks.spawn(async move {
            Some(Event::Registered(router.register_user(record).await))
        });
    }

    fn on_registered(&mut self, result: BackendResult<Registration>) {
        self.flow.resume();
        let Some(uaid) = self.uaid() else {
            return;
        };

        let registration = match result {
            Ok(registration) => registration,
            Err(e) => {
                warn!(uaid = %uaid, error = %e, "Registry registration failed");
                self.send(ServerMessage::error(MessageType::Hello, "error", 503));
                self.close();
                return;
            }
        };

        if !registration.registered {
            // The connection stays open in Registering; the client has to
            // give up on its own. The uaid is already bound, so register,
            // unregister, ack and ping frames are still handled here.
            info!(uaid = %uaid, "Registry holds a newer connection for client");
            self.send(ServerMessage::error(MessageType::Hello, "already_connected", 500));
            return;
        }

        let handle = ConnectionHandle::new(
            self.id,
            uaid,
            self.connected_at,
            self.flow.clone(),
            self.commands_tx.clone(),
        );
        match self.node.clients().claim(handle) {
            Claim::Superseded => {
                info!(uaid = %uaid, "Newer local connection holds client, closing");
                self.close();
                return;
            }
            Claim::Claimed { displaced } => {
                if let Some(old) = displaced {
                    info!(uaid = %uaid, old_connection_id = %old.id(), "Closing superseded local connection");
                    old.close();
                }
            }
        }

        if let Some(previous) = registration.previous {
            if !previous.node_id.is_empty() && previous.node_id != self.node.router_url() {
                debug!(uaid = %uaid, node = %previous.node_id, "Dropping client from previous node");
                let notifier = self.node.notifier().clone();
                tokio::spawn(async move {
                    notifier
                        .drop_stale(&previous.node_id, uaid, previous.connected_at)
                        .await;
                });
            }
        }

        self.state = ConnectionState::Ready;
        let webpush = self
            .client
            .as_ref()
            .is_some_and(|c| c.strategy.mode().is_webpush());
        info!(uaid = %uaid, connection_id = %self.id, "Client connected");
        self.send(ServerMessage::hello(uaid, webpush));
        self.process_notifications();
    }

    fn process_ping(&mut self) {
        let interval = self.node.config().ping_interval;
        match self.last_ping.map(|at| at.elapsed()) {
            Some(elapsed) if elapsed < interval => {
                let delay = interval.saturating_sub(elapsed);
                self.tasks.spawn(async move {
                    tokio::time::sleep(delay).await;
                    Some(Event::PingDue)
                });
            }
            _ => self.send_pong(),
        }
    }

    fn send_pong(&mut self) {
        self.last_ping = Some(Instant::now());
        self.send(ServerMessage::pong());
    }

    fn process_register(&mut self, uaid: Uaid, raw: Option<&str>) {
        // The reply echoes the client's own spelling of the channel id.
        let parsed = raw.and_then(|s| ChannelId::parse(s).ok().map(|id| (id, s.to_string())));
        let Some((channel_id, raw)) = parsed else {
            self.send(ServerMessage::status(MessageType::Register, 401));
            return;
        };
        let Some(client) = &self.client else {
            return;
        };

        self.flow.pause();
        let backends = self.node.backends().clone();
        let prepare = client
            .strategy
            .prepare_channel(backends.clone(), uaid, channel_id);
        self.tasks.spawn(async move {
            let result: BackendResult<String> = async {
                let endpoint = backends.endpoints.make_endpoint(uaid, channel_id).await?;
                prepare.await?;
                Ok(endpoint)
            }
            .await;
            Some(Event::ChannelRegistered {
                channel_id,
                raw,
                result,
            })
        });
    }

    fn on_channel_registered(
        &mut self,
        channel_id: ChannelId,
        raw: String,
        result: BackendResult<String>,
    ) {
        self.flow.resume();
        match result {
            Ok(endpoint) => {
                debug!(channel_id = %channel_id, "Channel registered");
                self.send(ServerMessage::registered(raw, endpoint));
            }
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "Channel registration failed");
                self.send(ServerMessage::status(MessageType::Register, 500));
            }
        }
        if self.check_requested {
            self.process_notifications();
        }
    }

    fn process_unregister(&mut self, uaid: Uaid, raw: Option<&str>, frame: Map<String, Value>) {
        let Some(channel_id) = raw.and_then(|s| ChannelId::parse(s).ok()) else {
            self.send(ServerMessage::status(MessageType::Unregister, 401));
            return;
        };
        let Some(client) = self.client.as_mut() else {
            return;
        };

        client.strategy.clear_channel(channel_id);
        for mutation in client.strategy.unregister_mutations(uaid, channel_id) {
            self.node.retry().submit(mutation);
        }
        debug!(uaid = %uaid, channel_id = %channel_id, "Channel unregistered");
        self.send(ServerMessage::echo(frame, 200));
    }

    fn process_ack(&mut self, uaid: Uaid, updates: Vec<AckUpdate>) {
        if updates.is_empty() {
            return;
        }
        let Some(client) = self.client.as_mut() else {
            return;
        };

        let mut deletes = Vec::new();
        for update in updates {
            let (Some(raw), Some(version)) = (update.channel_id, update.version) else {
                continue;
            };
            let Ok(channel_id) = ChannelId::parse(&raw) else {
                debug!(uaid = %uaid, channel_id = %raw, "Ignoring ack for malformed channel");
                continue;
            };
            if let Some(mutation) = client.strategy.ack(uaid, channel_id, &version) {
                deletes.push(mutation);
            }
        }

        if deletes.is_empty() {
            self.check_missed();
            return;
        }

        self.flow.pause();
        let waits: Vec<_> = deletes
            .into_iter()
            .map(|mutation| {
                let outcome = self.node.retry().submit_and_wait(mutation.clone());
                async move { (mutation, outcome.await) }
            })
            .collect();
        self.tasks.spawn(async move {
            Some(Event::AcksSettled(futures::future::join_all(waits).await))
        });
    }

    fn on_acks_settled(&mut self, settled: Vec<(Mutation, RetryOutcome)>) {
        self.flow.resume();
        let Some(client) = self.client.as_mut() else {
            return;
        };

        let mut gave_up = false;
        for (mutation, outcome) in settled {
            match outcome {
                RetryOutcome::Applied => client.strategy.confirm_delete(&mutation),
                RetryOutcome::GaveUp => {
                    error!(mutation = %mutation, "Ack delete abandoned, closing connection");
                    gave_up = true;
                }
            }
        }

        if gave_up {
            self.close();
        } else {
            self.check_missed();
        }
    }

    fn check_missed(&mut self) {
        if self.check_requested || self.more_pending {
            self.process_notifications();
        }
    }

    // ==================== Delivery ====================

    fn process_notifications(&mut self) {
        if self.flow.is_stopped() || self.state.is_closing() {
            return;
        }
        let Some(client) = &self.client else {
            return;
        };
        if self.flow.is_paused() || client.strategy.awaiting_acks() {
            self.schedule_retry();
            return;
        }

        let fetch = client.strategy.fetch(
            self.node.backends().clone(),
            client.uaid,
            self.node.config().fetch_limit,
        );
        if let Some(previous) = self.fetch.take() {
            previous.abort();
        }
        self.check_requested = false;
        self.more_pending = true;
        self.fetch_generation = self.fetch_generation.wrapping_add(1);
        let generation = self.fetch_generation;
        self.fetch = Some(self.tasks.spawn(async move {
            Some(Event::Fetched {
                generation,
                result: fetch.await,
            })
        }));
    }

    fn schedule_retry(&mut self) {
        if self.retry_scheduled {
            return;
        }
        self.retry_scheduled = true;
        let delay = self.node.config().retry_delay;
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            Some(Event::RetryFetch)
        });
    }

    fn on_fetched(&mut self, generation: u64, result: BackendResult<Fetched>) {
        if generation != self.fetch_generation {
            return;
        }
        self.fetch = None;

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(uaid = ?self.uaid(), error = %e, "Notification fetch failed, closing");
                self.close();
                return;
            }
        };
        let Some(client) = self.client.as_mut() else {
            return;
        };

        let batch = client.strategy.accept_fetched(fetched);
        self.more_pending = batch.more;
        for frame in batch.frames {
            self.send(frame);
        }
        if self.more_pending || self.check_requested {
            self.process_notifications();
        }
    }

    fn deliver_direct(&mut self, notification: Notification) {
        if self.state != ConnectionState::Ready {
            debug!(connection_id = %self.id, "Dropping direct notification for connection that is not ready");
            return;
        }
        let Some(client) = self.client.as_mut() else {
            return;
        };
        if let Some(frame) = client.strategy.deliver_direct(notification) {
            self.send(frame);
        }
    }

    // ==================== Commands and Events ====================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Deliver(notification) => self.deliver_direct(notification),
            Command::CheckStorage => {
                self.check_requested = true;
                self.process_notifications();
            }
            Command::FlagCheck => {
                self.check_requested = true;
                if !self.flow.is_paused() {
                    self.process_notifications();
                }
            }
            Command::Close => self.close(),
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Registered(result) => self.on_registered(result),
            Event::ChannelRegistered {
                channel_id,
                raw,
                result,
            } => {
                self.on_channel_registered(channel_id, raw, result);
            }
            Event::Fetched { generation, result } => self.on_fetched(generation, result),
            Event::AcksSettled(settled) => self.on_acks_settled(settled),
            Event::PingDue => self.send_pong(),
            Event::RetryFetch => {
                self.retry_scheduled = false;
                self.process_notifications();
            }
        }
    }

    // ==================== Lifecycle ====================

    fn send(&self, message: ServerMessage) {
        match message.to_json() {
            Ok(text) => {
                if self.outbound.send(Outbound::Text(text)).is_err() {
                    debug!(connection_id = %self.id, "Writer gone, dropping frame");
                }
            }
            Err(e) => error!(connection_id = %self.id, error = %e, "Failed to encode frame"),
        }
    }

    fn close(&mut self) {
        if !self.state.is_closing() {
            self.state = ConnectionState::Closing;
        }
    }

    fn teardown(mut self) {
        self.flow.stop();
        self.tasks.abort_all();
        self.state = ConnectionState::Closed;

        if let Some(mut client) = self.client.take() {
            let uaid = client.uaid;
            self.node.clients().remove_if_current(uaid, self.id);

            let saves = client.strategy.take_direct_updates(uaid);
            if !saves.is_empty() {
                debug!(uaid = %uaid, count = saves.len(), "Persisting undelivered direct updates");
                tokio::spawn(redeliver(self.node.clone(), uaid, saves));
            }
            info!(uaid = %uaid, connection_id = %self.id, "Client disconnected");
        }

        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Persist direct updates left by a closed connection, then point whichever
/// connection now owns the client at storage.
async fn redeliver(node: Arc<NodeState>, uaid: Uaid, saves: Vec<Mutation>) {
    let outcomes =
        futures::future::join_all(saves.into_iter().map(|m| node.retry().submit_and_wait(m)))
            .await;
    if outcomes.contains(&RetryOutcome::GaveUp) {
        warn!(uaid = %uaid, "Some direct updates could not be persisted");
    }

    let record = match node.backends().router.get_uaid(uaid).await {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            warn!(uaid = %uaid, error = %e, "Registry lookup for redelivery failed");
            return;
        }
    };

    if record.node_id == node.router_url() {
        if let Some(handle) = node.clients().get(uaid) {
            handle.send(Command::CheckStorage);
        }
    } else if !record.node_id.is_empty() {
        node.notifier().notify_check(&record.node_id, uaid).await;
    }
}
