//! Shared harness for push-node integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::Path;
use axum::routing::{delete, put};
use futures::channel::mpsc as frames_mpsc;
use parking_lot::Mutex;
use push_node::{Connection, NodeConfig, NodeState, Outbound, RetryConfig, ServerResult};
use push_proto::Uaid;
use push_store::{Backends, MemoryBackend};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub const ROUTER_URL: &str = "http://node-a.internal:8081";
pub const ENDPOINT_URL: &str = "https://push.example.com";

/// Node config with immediate pings and fast retries.
pub fn test_config() -> NodeConfig {
    NodeConfig::default()
        .with_router_url(ROUTER_URL)
        .with_endpoint_url(ENDPOINT_URL)
        .with_ping_interval(Duration::ZERO)
        .with_retry_delay(Duration::from_millis(10))
        .with_retry(
            RetryConfig::new()
                .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
                .with_breaker(0, Duration::ZERO),
        )
}

pub struct TestNode {
    pub memory: Arc<MemoryBackend>,
    pub state: Arc<NodeState>,
}

impl TestNode {
    pub fn start() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: NodeConfig) -> Self {
        let memory = Arc::new(MemoryBackend::new());
        let backends = Backends::in_memory(memory.clone(), ENDPOINT_URL);
        let state = Arc::new(NodeState::new(config, backends).unwrap());
        Self { memory, state }
    }

    pub fn connect(&self) -> TestClient {
        self.connect_with(|conn| conn)
    }

    pub fn connect_at(&self, connected_at: i64) -> TestClient {
        self.connect_with(|conn| conn.with_connected_at(connected_at))
    }

    fn connect_with(&self, setup: impl FnOnce(Connection) -> Connection) -> TestClient {
        let (out_tx, outbound) = mpsc::unbounded_channel();
        let (frames, rx) = frames_mpsc::unbounded();
        let conn = setup(Connection::new(self.state.clone(), out_tx));
        tokio::spawn(conn.run(rx));
        TestClient { frames, outbound }
    }
}

pub struct TestClient {
    pub frames: frames_mpsc::UnboundedSender<ServerResult<String>>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl TestClient {
    pub fn send(&self, frame: Value) {
        self.send_text(&frame.to_string());
    }

    pub fn send_text(&self, text: &str) {
        self.frames.unbounded_send(Ok(text.to_string())).unwrap();
    }

    /// Hang up from the client side.
    pub fn disconnect(&self) {
        self.frames.close_channel();
    }

    pub async fn recv(&mut self) -> Outbound {
        tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbound channel closed")
    }

    pub async fn recv_json(&mut self) -> Value {
        match self.recv().await {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            Outbound::Close => panic!("connection closed unexpectedly"),
        }
    }

    pub async fn expect_close(&mut self) {
        loop {
            if self.recv().await == Outbound::Close {
                return;
            }
        }
    }

    /// Round-trip a ping. Every frame sent before it has been handled once
    /// the pong arrives.
    pub async fn ping(&mut self) {
        self.send(json!({}));
        assert_eq!(self.recv_json().await, json!({}));
    }

    pub async fn hello(&mut self, webpush: bool) -> Uaid {
        self.send(json!({"messageType": "hello", "use_webpush": webpush}));
        let reply = self.recv_json().await;
        assert_eq!(reply["messageType"], "hello");
        assert_eq!(reply["status"], 200);
        Uaid::parse(reply["uaid"].as_str().unwrap()).unwrap()
    }

    pub async fn hello_as(&mut self, uaid: Uaid, webpush: bool) -> Value {
        self.send(json!({
            "messageType": "hello",
            "uaid": uaid.to_string(),
            "use_webpush": webpush,
        }));
        self.recv_json().await
    }

    /// Assert nothing arrives within a short window.
    pub async fn assert_silent(&mut self) {
        let waited = tokio::time::timeout(Duration::from_millis(50), self.outbound.recv()).await;
        assert!(waited.is_err(), "unexpected frame: {waited:?}");
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Requests seen by a fake peer node.
pub type Seen = Arc<Mutex<Vec<String>>>;

/// Start a fake peer router and return its base URL.
pub async fn spawn_peer() -> (String, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let on_put = seen.clone();
    let on_delete = seen.clone();
    let app = Router::new()
        .route(
            "/notif/{uaid}",
            put(move |Path(uaid): Path<String>| {
                let seen = on_put.clone();
                async move {
                    seen.lock().push(format!("PUT /notif/{uaid}"));
                    "Notification check started"
                }
            }),
        )
        .route(
            "/notif/{uaid}/{connected_at}",
            delete(move |Path((uaid, ts)): Path<(String, String)>| {
                let seen = on_delete.clone();
                async move {
                    seen.lock().push(format!("DELETE /notif/{uaid}/{ts}"));
                    "Terminated duplicate"
                }
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), seen)
}
