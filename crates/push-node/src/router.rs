//! Node-to-node HTTP endpoints.
//!
//! Peer nodes and the endpoint service use these to reach a client connected
//! to this node. They run on the private network and are not authenticated.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{Router, delete, get, put};
use push_proto::{Notification, Uaid};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::registry::{Command, ConnectionHandle};
use crate::state::NodeState;

/// Plain-text handler reply.
type Reply = (StatusCode, &'static str);

const NOT_CONNECTED: Reply = (StatusCode::NOT_FOUND, "Client not connected.");

/// Create the router HTTP app.
pub fn create_router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/push/{uaid}", put(deliver))
        .route("/notif/{uaid}", put(notify_check))
        .route("/notif/{uaid}/{connected_at}", delete(drop_stale))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "ok".
    pub status: &'static str,
    /// Number of locally connected clients.
    pub clients: usize,
    /// Seconds since the node started.
    pub uptime_secs: u64,
}

/// GET /health
pub async fn health_check(State(state): State<Arc<NodeState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        clients: state.clients().len(),
        uptime_secs: state.uptime_secs(),
    })
}

fn lookup(state: &NodeState, uaid: &str) -> Option<ConnectionHandle> {
    Uaid::parse(uaid).ok().and_then(|uaid| state.clients().get(uaid))
}

/// PUT /push/{uaid}
///
/// Hand a notification straight to the client, bypassing storage.
pub async fn deliver(
    State(state): State<Arc<NodeState>>,
    Path(uaid): Path<String>,
    body: Bytes,
) -> Reply {
    let Some(client) = lookup(&state, &uaid) else {
        return NOT_CONNECTED;
    };
    if client.is_paused() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Client busy.");
    }
    let notification: Notification = match serde_json::from_slice(&body) {
        Ok(notification) => notification,
        Err(e) => {
            debug!(uaid = %client.uaid(), error = %e, "Rejecting malformed notification");
            return (StatusCode::BAD_REQUEST, "Invalid notification.");
        }
    };
    if client.send(Command::Deliver(notification)) {
        (StatusCode::OK, "Client accepted for delivery")
    } else {
        NOT_CONNECTED
    }
}

/// PUT /notif/{uaid}
///
/// Ask the client's connection to check storage.
pub async fn notify_check(
    State(state): State<Arc<NodeState>>,
    Path(uaid): Path<String>,
) -> Reply {
    let Some(client) = lookup(&state, &uaid) else {
        return NOT_CONNECTED;
    };
    if client.is_paused() {
        if client.send(Command::FlagCheck) {
            return (StatusCode::ACCEPTED, "Flagged for Notification check");
        }
    } else if client.send(Command::CheckStorage) {
        return (StatusCode::OK, "Notification check started");
    }
    NOT_CONNECTED
}

/// DELETE /notif/{uaid}/{connected_at}
///
/// Close the client's connection if it is the one that started at
/// `connected_at`. Always succeeds.
pub async fn drop_stale(
    State(state): State<Arc<NodeState>>,
    Path((uaid, connected_at)): Path<(String, String)>,
) -> Reply {
    let Some(client) = lookup(&state, &uaid) else {
        return (StatusCode::OK, "");
    };
    if connected_at.parse::<i64>().ok() == Some(client.connected_at()) {
        debug!(uaid = %client.uaid(), connected_at = client.connected_at(), "Peer dropped stale connection");
        client.close();
        return (StatusCode::OK, "Terminated duplicate");
    }
    (StatusCode::OK, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use push_proto::ChannelId;
    use push_store::{Backends, MemoryBackend};
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::config::NodeConfig;
    use crate::flow::FlowController;

    fn make_test_state() -> Arc<NodeState> {
        let backends = Backends::in_memory(Arc::new(MemoryBackend::new()), "http://localhost");
        Arc::new(NodeState::new(NodeConfig::default(), backends).unwrap())
    }

    fn connect(
        state: &NodeState,
        connected_at: i64,
    ) -> (Uaid, FlowController, mpsc::UnboundedReceiver<Command>) {
        let uaid = Uaid::new();
        let flow = FlowController::new();
        let (tx, rx) = mpsc::unbounded_channel();
        state.clients().claim(ConnectionHandle::new(
            Uuid::new_v4(),
            uaid,
            connected_at,
            flow.clone(),
            tx,
        ));
        (uaid, flow, rx)
    }

    async fn call(state: Arc<NodeState>, method: &str, uri: &str, body: Body) -> (StatusCode, String) {
        let app = create_router(state);
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn notification_body(chid: ChannelId) -> Body {
        Body::from(serde_json::to_vec(&Notification::new(chid, 7_u64)).unwrap())
    }

    // ==================== Health ====================

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = make_test_state();
        connect(&state, 1);

        let (status, body) = call(state, "GET", "/health", Body::empty()).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["clients"], 1);
    }

    // ==================== Deliver ====================

    #[tokio::test]
    async fn test_deliver_unknown_client() {
        let state = make_test_state();
        let uri = format!("/push/{}", Uaid::new());

        let (status, body) = call(state, "PUT", &uri, notification_body(ChannelId::new())).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Client not connected.");
    }

    #[tokio::test]
    async fn test_deliver_malformed_uaid_is_not_connected() {
        let state = make_test_state();
        let (status, _) = call(state, "PUT", "/push/not-a-uaid", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_deliver_busy_client() {
        let state = make_test_state();
        let (uaid, flow, _rx) = connect(&state, 1);
        flow.pause();

        let (status, body) = call(
            state,
            "PUT",
            &format!("/push/{uaid}"),
            notification_body(ChannelId::new()),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "Client busy.");
    }

    #[tokio::test]
    async fn test_deliver_hands_over_notification() {
        let state = make_test_state();
        let (uaid, _flow, mut rx) = connect(&state, 1);
        let chid = ChannelId::new();

        let (status, body) =
            call(state, "PUT", &format!("/push/{uaid}"), notification_body(chid)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Client accepted for delivery");
        assert_eq!(
            rx.try_recv().unwrap(),
            Command::Deliver(Notification::new(chid, 7_u64))
        );
    }

    #[tokio::test]
    async fn test_deliver_bad_body() {
        let state = make_test_state();
        let (uaid, _flow, _rx) = connect(&state, 1);

        let (status, _) = call(
            state,
            "PUT",
            &format!("/push/{uaid}"),
            Body::from("{\"nope\":true}"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // ==================== Notify Check ====================

    #[tokio::test]
    async fn test_notify_check_unknown_client() {
        let state = make_test_state();
        let uri = format!("/notif/{}", Uaid::new());
        let (status, body) = call(state, "PUT", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Client not connected.");
    }

    #[tokio::test]
    async fn test_notify_check_starts_check() {
        let state = make_test_state();
        let (uaid, _flow, mut rx) = connect(&state, 1);

        let (status, body) = call(state, "PUT", &format!("/notif/{uaid}"), Body::empty()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Notification check started");
        assert_eq!(rx.try_recv().unwrap(), Command::CheckStorage);
    }

    #[tokio::test]
    async fn test_notify_check_flags_busy_client() {
        let state = make_test_state();
        let (uaid, flow, mut rx) = connect(&state, 1);
        flow.pause();

        let (status, body) = call(state, "PUT", &format!("/notif/{uaid}"), Body::empty()).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, "Flagged for Notification check");
        assert_eq!(rx.try_recv().unwrap(), Command::FlagCheck);
    }

    // ==================== Drop Stale ====================

    #[tokio::test]
    async fn test_drop_stale_matching_timestamp() {
        let state = make_test_state();
        let (uaid, _flow, mut rx) = connect(&state, 1234);

        let (status, body) = call(
            state,
            "DELETE",
            &format!("/notif/{uaid}/1234"),
            Body::empty(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Terminated duplicate");
        assert_eq!(rx.try_recv().unwrap(), Command::Close);
    }

    #[tokio::test]
    async fn test_drop_stale_other_timestamp_is_ignored() {
        let state = make_test_state();
        let (uaid, _flow, mut rx) = connect(&state, 1234);

        let (status, body) = call(
            state,
            "DELETE",
            &format!("/notif/{uaid}/999"),
            Body::empty(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_stale_unknown_client() {
        let state = make_test_state();
        let uri = format!("/notif/{}/1", Uaid::new());
        let (status, _) = call(state, "DELETE", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let state = make_test_state();
        let (status, _) = call(state, "GET", "/nope", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
