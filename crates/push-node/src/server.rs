//! Client websocket listener and router HTTP listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{SinkExt, StreamExt, future};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::connection::{Connection, Outbound};
use crate::error::{ServerError, ServerResult};
use crate::router::create_router;
use crate::state::NodeState;

/// Push node server: accepts client websockets and serves the router app.
#[derive(Debug)]
pub struct PushServer {
    /// Shared node state.
    state: Arc<NodeState>,
    /// Number of open client connections.
    active: Arc<AtomicUsize>,
    /// Shutdown signal.
    shutdown_tx: watch::Sender<bool>,
}

impl PushServer {
    /// Create a server over prepared node state.
    #[must_use]
    pub fn new(state: Arc<NodeState>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Get the shared node state.
    #[must_use]
    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Number of open client connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Bind both configured addresses and serve until shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if either address cannot be bound.
    pub async fn serve(&self) -> ServerResult<()> {
        let config = self.state.config();
        let clients = bind(config.bind_addr).await?;
        let router = bind(config.router_bind_addr).await?;
        self.serve_with_listeners(clients, router).await
    }

    /// Serve on already bound listeners until shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the router listener fails.
    pub async fn serve_with_listeners(
        &self,
        clients: TcpListener,
        router: TcpListener,
    ) -> ServerResult<()> {
        if let Ok(addr) = clients.local_addr() {
            info!(addr = %addr, "Client websocket listener started");
        }
        if let Ok(addr) = router.local_addr() {
            info!(addr = %addr, "Router listener started");
        }

        let app = create_router(self.state.clone());
        let router_stop = stopped(self.shutdown_tx.subscribe());
        let router_task = tokio::spawn(async move {
            axum::serve(router, app)
                .with_graceful_shutdown(router_stop)
                .await
        });

        let stop = stopped(self.shutdown_tx.subscribe());
        tokio::pin!(stop);
        loop {
            tokio::select! {
                accept_result = clients.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => self.handle_connection(stream, peer_addr),
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
                () = &mut stop => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        match router_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ServerError::Internal(format!("router failed: {e}"))),
            Err(e) => return Err(ServerError::Internal(format!("router task failed: {e}"))),
        }
        info!("Push server stopped");
        Ok(())
    }

    /// Stop accepting connections and stop the router.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let max = self.state.config().max_connections;
        let current = self.active.load(Ordering::Acquire);
        if current >= max {
            warn!(
                peer = %peer_addr,
                current = current,
                max = max,
                "Connection rejected: max connections reached"
            );
            return;
        }

        self.active.fetch_add(1, Ordering::AcqRel);
        let active = self.active.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            run_client(state, stream, peer_addr).await;
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

/// Resolves once the shutdown flag is set or the server is dropped.
async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn bind(addr: SocketAddr) -> ServerResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::BindFailed(addr, e))
}

/// Map a websocket message to a connection frame. `None` skips the message.
fn to_frame(
    message: Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
    limit: usize,
) -> Option<ServerResult<String>> {
    match message {
        Ok(WsMessage::Text(text)) if text.len() > limit => Some(Err(ServerError::MessageTooLarge {
            size: text.len(),
            limit,
        })),
        Ok(WsMessage::Text(text)) => Some(Ok(text)),
        Ok(WsMessage::Binary(_)) => Some(Err(ServerError::Protocol(
            "binary frames are not supported".into(),
        ))),
        Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) | WsMessage::Close(_)) => {
            None
        }
        Err(e) => Some(Err(e.into())),
    }
}

async fn run_client(state: Arc<NodeState>, stream: TcpStream, peer_addr: SocketAddr) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer_addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    debug!(peer = %peer_addr, "WebSocket connection established");

    let (mut sink, source) = ws_stream.split();
    let limit = state.config().max_message_size;
    let frames = Box::pin(
        source
            .take_while(|message| future::ready(!matches!(message, Ok(WsMessage::Close(_)))))
            .filter_map(move |message| future::ready(to_frame(message, limit))),
    );

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        debug!(error = %e, "Failed to write frame");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    Connection::new(state, outbound_tx).run(frames).await;
    let _ = writer.await;
    debug!(peer = %peer_addr, "Connection closed");
}
