//! Integration tests for the WebSocket server.
//!
//! These tests start a real server and connect real WebSocket clients,
//! verifying sync, the JSON API and the reload signal after a revert.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use folio_history::doc::DEFAULT_ROOT;
use folio_history::{DocumentId, HistoryServer, MessageType, PeerInfo, ServerConfig, SharedDoc, SyncMessage};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port.
async fn start_test_server() -> (Arc<HistoryServer>, SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(HistoryServer::new(ServerConfig::for_testing()).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, addr)
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
    ws
}

async fn send_sync(ws: &mut Ws, msg: &SyncMessage) {
    ws.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();
}

/// Next binary frame, skipping text frames.
async fn next_sync(ws: &mut Ws) -> SyncMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a sync frame")
            .unwrap()
            .unwrap();
        if let Message::Binary(data) = msg {
            return SyncMessage::decode(&data).unwrap();
        }
    }
}

/// Wait for a sync frame of the given type, skipping others.
async fn expect_sync(ws: &mut Ws, msg_type: MessageType) -> SyncMessage {
    loop {
        let msg = next_sync(ws).await;
        if msg.msg_type == msg_type {
            return msg;
        }
    }
}

/// Send an API request and wait for its response, skipping sync frames.
async fn call(ws: &mut Ws, request: Value) -> Value {
    ws.send(Message::Text(request.to_string().into())).await.unwrap();
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for an API response")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Join `doc_id` and return the replica built from the server's state.
async fn join(ws: &mut Ws, doc_id: &str, info: &PeerInfo) -> SharedDoc {
    send_sync(ws, &SyncMessage::join(doc_id, info).unwrap()).await;
    let state = expect_sync(ws, MessageType::SyncStep2).await;
    assert_eq!(state.doc_id, doc_id);
    SharedDoc::from_state(DEFAULT_ROOT, &state.payload).unwrap()
}

#[tokio::test]
async fn test_api_over_websocket() {
    let (_server, addr) = start_test_server().await;
    let mut ws = connect(addr).await;

    let saved = call(
        &mut ws,
        json!({"op": "saveVersion", "requestId": 1, "docId": "api-doc", "user": {"name": "Ann"}}),
    )
    .await;
    assert_eq!(saved["errno"], 0);
    assert_eq!(saved["requestId"], 1);
    assert_eq!(saved["data"]["version"], 1);

    let info = call(&mut ws, json!({"op": "getDocInfo", "docId": "api-doc"})).await;
    assert_eq!(info["data"]["currentVersion"], 1);
    assert_eq!(info["data"]["title"], "Untitled");

    let bad = call(&mut ws, json!({"op": "recoveryVersion", "docId": "api-doc", "version": 7})).await;
    assert_eq!(bad["errno"], 10002);

    let garbage = call(&mut ws, json!({"nothing": true})).await;
    assert_eq!(garbage["errno"], 10000);
}

#[tokio::test]
async fn test_updates_fan_out_to_other_peers() {
    let (server, addr) = start_test_server().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    let alice_info = PeerInfo::new("Alice");

    let alice_doc = join(&mut alice, "shared", &alice_info).await;
    let bob_doc = join(&mut bob, "shared", &PeerInfo::new("Bob")).await;

    let update = alice_doc.insert_text(0, "hi bob");
    send_sync(&mut alice, &SyncMessage::update(alice_info.peer_id, "shared", 1, update)).await;

    let received = expect_sync(&mut bob, MessageType::Update).await;
    assert_eq!(received.peer_id, alice_info.peer_id);
    bob_doc.apply_update(&received.payload).unwrap();
    assert_eq!(bob_doc.text(), "hi bob");

    let d = DocumentId::parse("shared").unwrap();
    let room = server.service().live().open(&d).await.unwrap();
    assert_eq!(room.doc().text(), "hi bob");
}

#[tokio::test]
async fn test_sync_step1_returns_missing_state() {
    let (_server, addr) = start_test_server().await;
    let mut alice = connect(addr).await;
    let mut late = connect(addr).await;
    let alice_info = PeerInfo::new("Alice");

    let alice_doc = join(&mut alice, "catch-up", &alice_info).await;
    let update = alice_doc.insert_text(0, "written earlier");
    send_sync(&mut alice, &SyncMessage::update(alice_info.peer_id, "catch-up", 1, update)).await;
    // Round-trip on the same connection, so the update has been applied
    call(&mut alice, json!({"op": "getDocInfo", "docId": "catch-up"})).await;

    let late_info = PeerInfo::new("Late");
    let local = SharedDoc::new(DEFAULT_ROOT);
    send_sync(&mut late, &SyncMessage::join("catch-up", &late_info).unwrap()).await;
    expect_sync(&mut late, MessageType::SyncStep2).await;

    send_sync(
        &mut late,
        &SyncMessage::sync_step1(late_info.peer_id, "catch-up", local.encode_state_vector()),
    )
    .await;
    let diff = expect_sync(&mut late, MessageType::SyncStep2).await;
    local.apply_update(&diff.payload).unwrap();
    assert_eq!(local.text(), "written earlier");
}

#[tokio::test]
async fn test_ping_pong() {
    let (_server, addr) = start_test_server().await;
    let mut ws = connect(addr).await;
    let peer = Uuid::new_v4();
    send_sync(&mut ws, &SyncMessage::ping(peer)).await;
    let pong = next_sync(&mut ws).await;
    assert_eq!(pong.msg_type, MessageType::Pong);
    assert_eq!(pong.peer_id, peer);
}

#[tokio::test]
async fn test_revert_reaches_every_peer_with_reload() {
    let (server, addr) = start_test_server().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    let alice_info = PeerInfo::new("Alice");

    let alice_doc = join(&mut alice, "revert-doc", &alice_info).await;
    join(&mut bob, "revert-doc", &PeerInfo::new("Bob")).await;

    let saved = call(
        &mut alice,
        json!({"op": "saveVersion", "docId": "revert-doc", "user": {"name": "Alice"}}),
    )
    .await;
    assert_eq!(saved["data"]["version"], 1);

    let update = alice_doc.insert_text(0, "draft");
    send_sync(&mut alice, &SyncMessage::update(alice_info.peer_id, "revert-doc", 1, update)).await;
    expect_sync(&mut bob, MessageType::Update).await;

    let reverted = call(
        &mut alice,
        json!({"op": "recoveryVersion", "docId": "revert-doc", "version": 1}),
    )
    .await;
    assert_eq!(reverted["errno"], 0);

    let reload = expect_sync(&mut bob, MessageType::Reload).await;
    assert_eq!(reload.doc_id, "revert-doc");
    assert!(reload.peer_id.is_nil());
    expect_sync(&mut alice, MessageType::Reload).await;

    let d = DocumentId::parse("revert-doc").unwrap();
    assert_eq!(server.service().live().open(&d).await.unwrap().doc().text(), "");

    // Reloading peers resynchronize from a fresh join
    let mut fresh = connect(addr).await;
    let replica = join(&mut fresh, "revert-doc", &PeerInfo::new("Carol")).await;
    assert_eq!(replica.text(), "");
}

#[tokio::test]
async fn test_malformed_frames_do_not_close_session() {
    let (_server, addr) = start_test_server().await;
    let mut ws = connect(addr).await;
    ws.send(Message::Binary(vec![0xFF, 0xFE, 0xFD].into())).await.unwrap();

    let info = call(&mut ws, json!({"op": "getDocInfo", "docId": "still-alive"})).await;
    assert_eq!(info["errno"], 0);
}
