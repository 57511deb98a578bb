//! End-to-end scenarios against a live service and an in-process fake host.

mod common;

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use common::*;
use vision_bridge::host::HostProvider;
use vision_bridge::protocol::AskResponseKind;

#[tokio::test]
async fn handshake_then_echo() {
    let (service, ws_port, _) = start_service(None, 10).await;
    let mut ws = connect(ws_port).await;

    let accepted = handshake(&mut ws).await;
    assert!(!accepted["payload"]["connectionId"]
        .as_str()
        .unwrap_or("")
        .is_empty());
    assert_eq!(accepted["payload"]["serverInfo"]["name"], "Roo Code");
    assert_eq!(accepted["payload"]["serverInfo"]["version"], "1.0.0");

    send_json(&mut ws, &json!({"type": "Echo", "payload": {"message": "hi"}})).await;
    let echo = recv_type(&mut ws, "Echo").await;
    assert_eq!(echo["payload"]["message"], "hi");
    assert!(!echo["id"].as_str().unwrap_or("").is_empty());
    assert!(echo["timestamp"].as_u64().unwrap_or(0) > 0);

    // Exactly one reply per echo: the next non-heartbeat frame after a ping
    // must be the pong, not a duplicate echo.
    send_json(&mut ws, &json!({"type": "Ping"})).await;
    let mut echoes_before_pong = 0;
    loop {
        match ws.next().await.expect("frame").expect("ok") {
            Message::Text(text) => {
                let v: Value = serde_json::from_str(text.as_str()).expect("json");
                match v["type"].as_str() {
                    Some("Pong") => break,
                    Some("Echo") => echoes_before_pong += 1,
                    _ => {}
                }
            }
            _ => continue,
        }
    }
    assert_eq!(echoes_before_pong, 0);

    service.stop().await;
}

#[tokio::test]
async fn user_message_creates_task() {
    let provider = FakeProvider::new();
    let (service, ws_port, _) =
        start_service(Some(provider.clone() as Arc<dyn HostProvider>), 10).await;
    let mut ws = connect(ws_port).await;
    handshake(&mut ws).await;

    send_json(
        &mut ws,
        &json!({
            "type": "AIConversation",
            "payload": {"sessionId": "s1", "role": "user", "content": "hello"},
        }),
    )
    .await;

    let ack = recv_type(&mut ws, "AIConversation").await;
    assert_eq!(ack["payload"]["role"], "assistant");
    assert_eq!(ack["payload"]["metadata"]["type"], "task_created");
    assert!(!ack["payload"]["metadata"]["taskId"]
        .as_str()
        .unwrap_or("")
        .is_empty());
    assert_eq!(provider.create_calls(), vec![("hello".to_string(), vec![])]);

    // The new task is watched: a live host message reaches the client.
    let task = provider.current().expect("current task");
    task.emit_created(say(2000, Some("m-live"), "Working on it", false));
    let live = recv_type(&mut ws, "AIConversation").await;
    assert_eq!(live["payload"]["content"], "Working on it");
    assert_eq!(live["streamId"], "m-live");

    // A second message from the same client continues the task it is
    // driving instead of creating another one.
    send_json(
        &mut ws,
        &json!({
            "type": "AIConversation",
            "payload": {"sessionId": "s1", "role": "user", "content": "and then?"},
        }),
    )
    .await;
    let ack = recv_type(&mut ws, "AIConversation").await;
    assert_eq!(ack["payload"]["metadata"]["type"], "task_created");
    assert_eq!(provider.create_calls().len(), 1);
    let calls = task.ask_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].response, AskResponseKind::MessageResponse);
    assert_eq!(calls[0].text.as_deref(), Some("and then?"));
    assert_eq!(calls[0].images.as_deref(), Some(&[][..]));

    service.stop().await;
}

#[tokio::test]
async fn destroyed_task_stops_relaying() {
    let task = FakeTask::new("t1");
    let provider = FakeProvider::with_current(task.clone());
    let (service, ws_port, _) =
        start_service(Some(provider.clone() as Arc<dyn HostProvider>), 10).await;
    let mut ws = connect(ws_port).await;
    handshake(&mut ws).await;

    send_json(
        &mut ws,
        &json!({"type": "TriggerSend", "payload": {"sessionId": "s1", "action": "send"}}),
    )
    .await;
    recv_type(&mut ws, "AIConversation").await;

    task.emit_created(say(100, Some("m1"), "before teardown", false));
    let before = recv_type(&mut ws, "AIConversation").await;
    assert_eq!(before["payload"]["content"], "before teardown");

    // Once the host announces the task destroyed its listener is removed
    // and further events from the stale handle go nowhere.
    provider.destroy_task("t1");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    task.emit_created(say(200, Some("m2"), "after teardown", false));

    send_json(&mut ws, &json!({"type": "Ping"})).await;
    let mut leaked = false;
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("frame before timeout")
            .expect("frame")
            .expect("ok");
        match frame {
            Message::Text(text) => {
                let v: Value = serde_json::from_str(text.as_str()).expect("json");
                match v["type"].as_str() {
                    Some("Pong") => break,
                    Some("AIConversation") if v["payload"]["content"] == "after teardown" => {
                        leaked = true;
                    }
                    _ => {}
                }
            }
            _ => continue,
        }
    }
    assert!(!leaked, "destroyed task must not relay messages");

    service.stop().await;
}

#[tokio::test]
async fn streaming_updates_share_one_stream_id() {
    let task = FakeTask::new("t1");
    let provider = FakeProvider::with_current(task.clone());
    let (service, ws_port, _) =
        start_service(Some(provider.clone() as Arc<dyn HostProvider>), 10).await;
    let mut ws = connect(ws_port).await;
    handshake(&mut ws).await;

    // Register with the bridge via a side-effect-free trigger.
    send_json(
        &mut ws,
        &json!({"type": "TriggerSend", "payload": {"sessionId": "s1", "action": "send"}}),
    )
    .await;
    let ack = recv_type(&mut ws, "AIConversation").await;
    assert_eq!(ack["payload"]["metadata"]["type"], "trigger_result");

    task.emit_updated(say(100, Some("k"), "Hel", true));
    task.emit_updated(say(100, Some("k"), "Hello", true));
    task.emit_updated(say(100, Some("k"), "Hello.", false));

    let mut frames = Vec::new();
    while frames.len() < 3 {
        let v = recv_type(&mut ws, "AIConversation").await;
        if v["streamId"] == "k" {
            frames.push(v);
        }
    }
    assert_eq!(frames[0]["payload"]["content"], "Hel");
    assert_eq!(frames[1]["payload"]["content"], "Hello");
    assert_eq!(frames[2]["payload"]["content"], "Hello.");
    assert_eq!(frames[0]["isFinal"], false);
    assert_eq!(frames[1]["isFinal"], false);
    assert_eq!(frames[2]["isFinal"], true);
    assert_eq!(frames[0]["isStreaming"], true);
    assert_eq!(frames[2]["isStreaming"], false);
    assert_eq!(frames[0]["payload"]["sessionId"], "s1");

    service.stop().await;
}

#[tokio::test]
async fn ask_round_trip() {
    let task = FakeTask::new("t1");
    let provider = FakeProvider::with_current(task.clone());
    let (service, ws_port, _) =
        start_service(Some(provider.clone() as Arc<dyn HostProvider>), 10).await;
    let mut ws = connect(ws_port).await;
    handshake(&mut ws).await;

    send_json(
        &mut ws,
        &json!({"type": "TriggerSend", "payload": {"sessionId": "s1", "action": "send"}}),
    )
    .await;
    recv_type(&mut ws, "AIConversation").await;

    // Host asks a question; the client sees it as a user-role message whose
    // metadata carries the host timestamp as the message id.
    task.emit_created(ask(7777, "Proceed?"));
    let question = recv_type(&mut ws, "AIConversation").await;
    assert_eq!(question["payload"]["role"], "user");
    assert_eq!(question["payload"]["content"], "Proceed?");
    assert_eq!(question["payload"]["metadata"]["messageId"], 7777);

    send_json(
        &mut ws,
        &json!({
            "type": "AskResponse",
            "payload": {"sessionId": "s1", "askResponse": "yesButtonClicked"},
        }),
    )
    .await;
    let ack = recv_type(&mut ws, "AIConversation").await;
    assert_eq!(ack["payload"]["metadata"]["type"], "ask_response_result");
    assert_eq!(ack["payload"]["metadata"]["success"], true);
    assert_eq!(ack["payload"]["metadata"]["askResponse"], "yesButtonClicked");

    let calls = task.ask_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].response, AskResponseKind::YesButtonClicked);
    assert_eq!(calls[0].text, None);
    assert_eq!(calls[0].images, None);

    service.stop().await;
}

#[tokio::test]
async fn capacity_rejects_excess_connection() {
    let (service, ws_port, _) = start_service(None, 1).await;

    let mut first = connect(ws_port).await;
    handshake(&mut first).await;

    let mut second = connect(ws_port).await;
    let rejected = recv_type(&mut second, "ConnectionRejected").await;
    assert_eq!(rejected["reason"], "Server at maximum capacity");
    // The rejection is followed by a 1013 close.
    let mut saw_capacity_close = false;
    while let Some(Ok(frame)) = second.next().await {
        if let Message::Close(Some(close)) = frame {
            assert_eq!(u16::from(close.code), 1013);
            saw_capacity_close = true;
            break;
        }
    }
    assert!(saw_capacity_close);

    // The surviving client is unaffected.
    send_json(&mut first, &json!({"type": "Ping"})).await;
    recv_type(&mut first, "Pong").await;

    service.stop().await;
}

#[tokio::test]
async fn registration_replays_history_in_order() {
    let task = FakeTask::new("t1");
    task.seed(say(100, Some("m1"), "Hello there", false));
    task.seed(ask(200, "Proceed?"));
    let provider = FakeProvider::with_current(task.clone());
    let (service, ws_port, _) =
        start_service(Some(provider.clone() as Arc<dyn HostProvider>), 10).await;
    let mut ws = connect(ws_port).await;
    handshake(&mut ws).await;

    send_json(
        &mut ws,
        &json!({"type": "TriggerSend", "payload": {"sessionId": "s1", "action": "send"}}),
    )
    .await;

    // Replayed messages carry streamId; the trigger ack does not.
    let mut replayed = Vec::new();
    while replayed.len() < 2 {
        let v = recv_type(&mut ws, "AIConversation").await;
        if v["streamId"].is_string() {
            replayed.push(v);
        }
    }
    assert_eq!(replayed[0]["payload"]["content"], "Hello there");
    assert_eq!(replayed[0]["payload"]["role"], "assistant");
    assert_eq!(replayed[1]["payload"]["content"], "Proceed?");
    assert_eq!(replayed[1]["payload"]["role"], "user");
    assert_eq!(replayed[1]["payload"]["sessionId"], "s1");

    // Live updates only reach the client after the snapshot.
    task.emit_created(say(300, Some("m2"), "And now this", false));
    let live = recv_type(&mut ws, "AIConversation").await;
    assert_eq!(live["payload"]["content"], "And now this");

    service.stop().await;
}

#[tokio::test]
async fn trigger_cancel_reaches_webview() {
    let provider = FakeProvider::new();
    let (service, ws_port, _) =
        start_service(Some(provider.clone() as Arc<dyn HostProvider>), 10).await;
    let mut ws = connect(ws_port).await;
    handshake(&mut ws).await;

    send_json(
        &mut ws,
        &json!({"type": "TriggerSend", "payload": {"sessionId": "s1", "action": "cancel"}}),
    )
    .await;
    let ack = recv_type(&mut ws, "AIConversation").await;
    assert_eq!(ack["payload"]["metadata"]["type"], "cancel_result");
    assert_eq!(ack["payload"]["metadata"]["success"], true);

    let posts = provider.webview_posts();
    assert!(posts
        .iter()
        .any(|p| p["type"] == "cancelButtonClicked"));

    service.stop().await;
}

#[tokio::test]
async fn unknown_message_type_does_not_disconnect() {
    let (service, ws_port, _) = start_service(None, 10).await;
    let mut ws = connect(ws_port).await;
    handshake(&mut ws).await;

    send_json(&mut ws, &json!({"type": "Telepathy", "payload": {}})).await;
    send_json(&mut ws, &json!({"type": "Ping"})).await;
    recv_type(&mut ws, "Pong").await;

    service.stop().await;
}

#[tokio::test]
async fn status_push_follows_connection_changes() {
    let provider = FakeProvider::new();
    let (service, ws_port, _) =
        start_service(Some(provider.clone() as Arc<dyn HostProvider>), 10).await;

    let mut ws = connect(ws_port).await;
    handshake(&mut ws).await;
    // Connect push: one connected client in the list.
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let posts = provider.webview_posts();
        if posts.iter().any(|p| {
            p["type"] == "visionSyncStatus" && p["connectedClients"].as_u64() == Some(1)
        }) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no connect status push");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    drop(ws);
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let posts = provider.webview_posts();
        if posts.iter().any(|p| {
            p["type"] == "visionSyncStatus"
                && p["connections"].as_array().map(Vec::len) == Some(0)
        }) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no disconnect status push");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    service.stop().await;
}

#[tokio::test]
async fn disabled_service_binds_nothing() {
    let config = vision_bridge::SyncConfig {
        enabled: false,
        ..Default::default()
    };
    let service = vision_bridge::SyncService::new(config);
    service.start(None).await.expect("disabled start is ok");
    let status = service.status().await;
    assert!(!status.running);
    assert_eq!(status.websocket_port, None);
    // stop() on a never-started service is a no-op.
    service.stop().await;
    service.stop().await;

    // A config update takes effect on the next start().
    service
        .update_config(vision_bridge::SyncConfig {
            enabled: true,
            port: 0,
            discovery_port: 0,
            service_name: "RooCode-test".to_string(),
            max_connections: 10,
        })
        .await;
    service.start(None).await.expect("start after update");
    let status = service.status().await;
    assert!(status.running);
    assert!(status.websocket_port.is_some());
    service.stop().await;
    assert!(!service.status().await.running);
}

#[tokio::test]
async fn stop_closes_clients_with_server_shutdown() {
    let (service, ws_port, _) = start_service(None, 10).await;
    let mut ws = connect(ws_port).await;
    handshake(&mut ws).await;

    service.stop().await;

    let mut saw_shutdown_close = false;
    while let Some(Ok(frame)) = ws.next().await {
        if let Message::Close(Some(close)) = frame {
            assert_eq!(u16::from(close.code), 1000);
            assert_eq!(close.reason.as_str(), "Server shutdown");
            saw_shutdown_close = true;
            break;
        }
    }
    assert!(saw_shutdown_close);
}
