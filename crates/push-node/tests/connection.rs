//! Connection state machine tests against the in-memory backend.
//!
//! These tests verify:
//! 1. Hello handshake, uaid minting and registry registration
//! 2. Channel register/unregister replies and backend side effects
//! 3. Simplepush and webpush delivery, acks and delete confirmation
//! 4. Flow control while backend work is in flight
//! 5. Adaptive ping replies

mod helpers;

use std::time::Duration;

use helpers::{ROUTER_URL, TestNode, eventually, test_config};
use push_node::{Command, Outbound};
use push_proto::{ChannelId, Notification, ProtocolMode, Uaid};
use push_store::{MessageStore, Operation, SimpleStorage};
use serde_json::json;

// ==================== Hello ====================

#[tokio::test]
async fn test_hello_mints_uaid_and_registers() {
    let node = TestNode::start();
    let mut client = node.connect();

    let uaid = client.hello(false).await;

    let record = node.memory.record(uaid).unwrap();
    assert_eq!(record.node_id, ROUTER_URL);
    assert_eq!(record.router_type, ProtocolMode::SimplePush);
    assert!(node.state.clients().get(uaid).is_some());
}

#[tokio::test]
async fn test_hello_keeps_offered_uaid() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = Uaid::new();

    let reply = client.hello_as(uaid, true).await;

    assert_eq!(reply["uaid"], uaid.to_string());
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["use_webpush"], true);
}

#[tokio::test]
async fn test_hello_with_malformed_uaid_mints_new_one() {
    let node = TestNode::start();
    let mut client = node.connect();

    client.send(json!({"messageType": "hello", "uaid": "not-a-uuid"}));
    let reply = client.recv_json().await;

    assert_eq!(reply["status"], 200);
    assert!(Uaid::parse(reply["uaid"].as_str().unwrap()).is_ok());
}

#[tokio::test]
async fn test_second_hello_is_rejected_and_closes() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(false).await;

    let reply = client.hello_as(Uaid::new(), false).await;

    assert_eq!(reply["status"], 401);
    client.expect_close().await;
    assert_eq!(node.memory.record(uaid).unwrap().uaid, uaid);
}

#[tokio::test]
async fn test_registration_error_replies_503() {
    let node = TestNode::start();
    node.memory.fail_next(1);
    let mut client = node.connect();

    client.send(json!({"messageType": "hello"}));
    let reply = client.recv_json().await;

    assert_eq!(reply["messageType"], "hello");
    assert_eq!(reply["reason"], "error");
    assert_eq!(reply["status"], 503);
    client.expect_close().await;
}

#[tokio::test]
async fn test_unknown_message_type_closes() {
    let node = TestNode::start();
    let mut client = node.connect();
    client.hello(false).await;

    client.send(json!({"messageType": "subscribe"}));

    client.expect_close().await;
}

#[tokio::test]
async fn test_client_hangup_deregisters() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(false).await;

    client.disconnect();
    client.expect_close().await;

    eventually(|| node.state.clients().get(uaid).is_none()).await;
}

// ==================== Register / Unregister ====================

#[tokio::test]
async fn test_register_mints_endpoint() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(false).await;
    let chid = ChannelId::new();

    client.send(json!({"messageType": "register", "channelID": chid.to_string()}));
    let reply = client.recv_json().await;

    assert_eq!(reply["messageType"], "register");
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["channelID"], chid.to_string());
    assert_eq!(
        reply["pushEndpoint"],
        format!("https://push.example.com/push/{uaid}/{chid}")
    );
}

#[tokio::test]
async fn test_register_reply_echoes_client_channel_spelling() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(false).await;
    let raw = "AAAAAAAA-BBBB-4CCC-8DDD-EEEEEEEEEEEE";

    client.send(json!({"messageType": "register", "channelID": raw}));
    let reply = client.recv_json().await;

    assert_eq!(reply["status"], 200);
    assert_eq!(reply["channelID"], raw);
    let chid = ChannelId::parse(raw).unwrap();
    assert_eq!(
        reply["pushEndpoint"],
        format!("https://push.example.com/push/{uaid}/{chid}")
    );
}

#[tokio::test]
async fn test_register_invalid_channel_is_401() {
    let node = TestNode::start();
    let mut client = node.connect();
    client.hello(true).await;

    client.send(json!({"messageType": "register", "channelID": "abc"}));
    let reply = client.recv_json().await;

    assert_eq!(reply, json!({"messageType": "register", "status": 401}));
    assert!(
        !node
            .memory
            .operations()
            .iter()
            .any(|op| matches!(op, Operation::RegisterChannel { .. }))
    );
    client.ping().await;
}

#[tokio::test]
async fn test_webpush_register_records_channel() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(true).await;
    let chid = ChannelId::new();

    client.send(json!({"messageType": "register", "channelID": chid.to_string()}));
    assert_eq!(client.recv_json().await["status"], 200);

    assert!(node.memory.operations().contains(&Operation::RegisterChannel {
        uaid,
        channel_id: chid
    }));
}

#[tokio::test]
async fn test_register_backend_failure_is_500_and_stays_open() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(true).await;
    eventually(|| {
        node.memory
            .operations()
            .contains(&Operation::FetchMessages(uaid))
    })
    .await;
    node.memory.fail_next(1);

    client.send(json!({"messageType": "register", "channelID": ChannelId::new().to_string()}));
    let reply = client.recv_json().await;

    assert_eq!(reply["status"], 500);
    client.ping().await;
}

#[tokio::test]
async fn test_unregister_echoes_and_cleans_up() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(true).await;
    let chid = ChannelId::new();

    client.send(json!({"messageType": "unregister", "channelID": chid.to_string(), "code": 201}));
    let reply = client.recv_json().await;

    assert_eq!(
        reply,
        json!({"messageType": "unregister", "channelID": chid.to_string(), "code": 201, "status": 200})
    );
    eventually(|| {
        let ops = node.memory.operations();
        ops.contains(&Operation::UnregisterChannel { uaid, channel_id: chid })
            && ops.contains(&Operation::DeleteMessagesForChannel { uaid, channel_id: chid })
    })
    .await;
}

#[tokio::test]
async fn test_unregister_invalid_channel_is_401() {
    let node = TestNode::start();
    let mut client = node.connect();
    client.hello(false).await;

    client.send(json!({"messageType": "unregister", "channelID": 12}));

    assert_eq!(client.recv_json().await["status"], 401);
}

#[tokio::test]
async fn test_unregister_does_not_wait_for_backend() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(false).await;
    node.memory.hold_deletes(true);
    let chid = ChannelId::new();

    client.send(json!({"messageType": "unregister", "channelID": chid.to_string()}));
    assert_eq!(client.recv_json().await["status"], 200);
    client.ping().await;

    node.memory.hold_deletes(false);
    eventually(|| {
        node.memory.operations().contains(&Operation::DeleteNotification {
            uaid,
            channel_id: chid,
            version: None,
        })
    })
    .await;
}

// ==================== Simplepush Delivery ====================

#[tokio::test]
async fn test_simple_stored_notification_delivered_on_hello() {
    let node = TestNode::start();
    let uaid = Uaid::new();
    let chid = ChannelId::new();
    node.memory.save_notification(uaid, chid, 5).await.unwrap();
    let mut client = node.connect();

    client.hello_as(uaid, false).await;
    let frame = client.recv_json().await;

    assert_eq!(
        frame,
        json!({"messageType": "notification", "updates": [{"channelID": chid.to_string(), "version": 5}]})
    );
}

#[tokio::test]
async fn test_simple_ack_deletes_exactly_once() {
    let node = TestNode::start();
    let uaid = Uaid::new();
    let chid = ChannelId::new();
    node.memory.save_notification(uaid, chid, 5).await.unwrap();
    let mut client = node.connect();
    client.hello_as(uaid, false).await;
    client.recv_json().await;

    let ack = json!({"messageType": "ack", "updates": [{"channelID": chid.to_string(), "version": 5}]});
    client.send(ack.clone());
    client.ping().await;
    assert_eq!(node.memory.delete_count(), 1);
    assert!(node.memory.fetch_notifications(uaid).await.unwrap().is_empty());

    client.send(ack);
    client.ping().await;
    assert_eq!(node.memory.delete_count(), 1);
}

#[tokio::test]
async fn test_ack_pauses_frame_intake_until_delete_completes() {
    let node = TestNode::start();
    let uaid = Uaid::new();
    let chid = ChannelId::new();
    node.memory.save_notification(uaid, chid, 3).await.unwrap();
    let mut client = node.connect();
    client.hello_as(uaid, false).await;
    client.recv_json().await;
    node.memory.hold_deletes(true);

    let ack = json!({"messageType": "ack", "updates": [{"channelID": chid.to_string(), "version": 3}]});
    client.send(ack.clone());
    client.send(ack);
    client.send(json!({}));
    client.assert_silent().await;
    assert!(node.state.clients().get(uaid).unwrap().is_paused());

    node.memory.hold_deletes(false);
    assert_eq!(client.recv_json().await, json!({}));
    assert_eq!(node.memory.delete_count(), 1);
}

#[tokio::test]
async fn test_simple_ack_ignores_incomplete_and_unknown_entries() {
    let node = TestNode::start();
    let mut client = node.connect();
    client.hello(false).await;

    client.send(json!({"messageType": "ack", "updates": [
        {"channelID": ChannelId::new().to_string()},
        {"version": 3},
        {"channelID": "bogus", "version": 3},
        {"channelID": ChannelId::new().to_string(), "version": 3},
    ]}));
    client.ping().await;

    assert_eq!(node.memory.delete_count(), 0);
}

#[tokio::test]
async fn test_simple_direct_delivery_and_ack() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(false).await;
    let chid = ChannelId::new();

    let handle = node.state.clients().get(uaid).unwrap();
    assert!(handle.send(Command::Deliver(Notification::new(chid, 8_u64))));
    let frame = client.recv_json().await;
    assert_eq!(frame["updates"][0]["version"], 8);

    // An equal version is stale.
    handle.send(Command::Deliver(Notification::new(chid, 8_u64)));
    client.send(json!({"messageType": "ack", "updates": [{"channelID": chid.to_string(), "version": 8}]}));
    client.ping().await;
    assert_eq!(node.memory.delete_count(), 0);
}

#[tokio::test]
async fn test_check_storage_command_fetches_new_versions() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(false).await;
    let chid = ChannelId::new();
    node.memory.save_notification(uaid, chid, 2).await.unwrap();

    node.state.clients().get(uaid).unwrap().send(Command::CheckStorage);

    let frame = client.recv_json().await;
    assert_eq!(frame["updates"][0]["channelID"], chid.to_string());
    assert_eq!(frame["updates"][0]["version"], 2);
}

#[tokio::test]
async fn test_new_check_supersedes_in_flight_fetch() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(false).await;
    let fetches = || {
        node.memory
            .operations()
            .iter()
            .filter(|op| **op == Operation::FetchNotifications(uaid))
            .count()
    };
    eventually(|| fetches() == 1).await;
    client.ping().await;

    node.memory.hold_fetches(true);
    let chid = ChannelId::new();
    node.memory.save_notification(uaid, chid, 3).await.unwrap();
    let handle = node.state.clients().get(uaid).unwrap();
    handle.send(Command::CheckStorage);
    eventually(|| fetches() == 2).await;
    handle.send(Command::CheckStorage);
    eventually(|| fetches() == 3).await;

    node.memory.hold_fetches(false);

    let frame = client.recv_json().await;
    assert_eq!(
        frame,
        json!({"messageType": "notification", "updates": [{"channelID": chid.to_string(), "version": 3}]})
    );
    client.assert_silent().await;
    assert_eq!(fetches(), 3);
}

#[tokio::test]
async fn test_fetch_failure_closes() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(false).await;
    eventually(|| {
        node.memory
            .operations()
            .contains(&Operation::FetchNotifications(uaid))
    })
    .await;
    node.memory.fail_next(1);

    node.state.clients().get(uaid).unwrap().send(Command::CheckStorage);

    client.expect_close().await;
}

// ==================== Webpush Delivery ====================

#[tokio::test]
async fn test_webpush_delivers_acks_and_drains() {
    let node = TestNode::start();
    let uaid = Uaid::new();
    let chid = ChannelId::new();
    node.memory
        .store_message(uaid, Notification::new(chid, "m1"))
        .await
        .unwrap();
    node.memory
        .store_message(uaid, Notification::new(chid, "m2"))
        .await
        .unwrap();
    let mut client = node.connect();
    client.hello_as(uaid, true).await;

    let first = client.recv_json().await;
    let second = client.recv_json().await;
    assert_eq!(first["version"], "m1");
    assert_eq!(second["version"], "m2");
    assert_eq!(first["channelID"], chid.to_string());

    // Nothing is re-sent while acks are outstanding.
    client.assert_silent().await;

    client.send(json!({"messageType": "ack", "updates": [
        {"channelID": chid.to_string(), "version": "m1"},
        {"channelID": chid.to_string(), "version": "m2"},
    ]}));
    client.ping().await;
    assert_eq!(node.memory.delete_count(), 2);
    eventually(|| node.memory.stored_message_count(uaid) == 0).await;

    node.memory
        .store_message(uaid, Notification::new(chid, "m3"))
        .await
        .unwrap();
    node.state.clients().get(uaid).unwrap().send(Command::CheckStorage);
    assert_eq!(client.recv_json().await["version"], "m3");
}

#[tokio::test]
async fn test_webpush_pages_through_storage() {
    let config = test_config().with_fetch_limit(1);
    let node = TestNode::with_config(config);
    let uaid = Uaid::new();
    let chid = ChannelId::new();
    for id in ["a", "b"] {
        node.memory
            .store_message(uaid, Notification::new(chid, id))
            .await
            .unwrap();
    }
    let mut client = node.connect();
    client.hello_as(uaid, true).await;

    assert_eq!(client.recv_json().await["version"], "a");
    client.assert_silent().await;

    client.send(json!({"messageType": "ack", "updates": [{"channelID": chid.to_string(), "version": "a"}]}));
    assert_eq!(client.recv_json().await["version"], "b");
}

#[tokio::test]
async fn test_webpush_direct_message_ack_needs_no_delete() {
    let node = TestNode::start();
    let mut client = node.connect();
    let uaid = client.hello(true).await;
    let chid = ChannelId::new();

    node.state
        .clients()
        .get(uaid)
        .unwrap()
        .send(Command::Deliver(Notification::new(chid, "d1")));
    assert_eq!(client.recv_json().await["version"], "d1");

    client.send(json!({"messageType": "ack", "updates": [{"channelID": chid.to_string(), "version": "d1"}]}));
    client.ping().await;
    assert_eq!(node.memory.delete_count(), 0);
}

#[tokio::test]
async fn test_abandoned_ack_delete_closes() {
    let config = test_config().with_retry(
        push_node::RetryConfig::new()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(1))
            .with_max_attempts(2)
            .with_breaker(0, Duration::ZERO),
    );
    let node = TestNode::with_config(config);
    let uaid = Uaid::new();
    let chid = ChannelId::new();
    node.memory
        .store_message(uaid, Notification::new(chid, "m1"))
        .await
        .unwrap();
    let mut client = node.connect();
    client.hello_as(uaid, true).await;
    client.recv_json().await;
    node.memory.fail_next(100);

    client.send(json!({"messageType": "ack", "updates": [{"channelID": chid.to_string(), "version": "m1"}]}));

    client.expect_close().await;
}

// ==================== Ping ====================

#[tokio::test]
async fn test_fast_pings_are_delayed() {
    tokio::time::pause();
    let node = TestNode::with_config(test_config().with_ping_interval(Duration::from_secs(9)));
    let mut client = node.connect();
    client.hello(false).await;

    client.send(json!({}));
    assert_eq!(client.outbound.recv().await, Some(Outbound::Text("{}".into())));

    let asked = tokio::time::Instant::now();
    client.send(json!({}));
    assert_eq!(client.outbound.recv().await, Some(Outbound::Text("{}".into())));
    assert!(asked.elapsed() >= Duration::from_secs(9));
}
