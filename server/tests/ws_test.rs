//! Integration tests for the live relay: handshake rejection, echo +
//! recipient fan-out, offline notification fallback, supersession, and
//! registry cleanup on disconnect.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;

use courier_server::notify::Notification;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Helper: start the server on a random port.
/// Returns (base_url, addr, notification queue receiver) — the receiver
/// stands in for the notifier worker, so tests observe exactly the jobs the
/// relay submits.
async fn start_test_server() -> (String, SocketAddr, UnboundedReceiver<Notification>) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = courier_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = courier_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");
    let (notifier, notify_rx) = courier_server::notify::channel();

    let state = courier_server::state::AppState {
        db,
        jwt_secret,
        token_expiry_minutes: 30,
        connections: courier_server::ws::ConnectionRegistry::new(),
        notifier,
    };

    let app = courier_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    (format!("http://{}", addr), addr, notify_rx)
}

/// Register a user (optionally with a telegram handle) and log them in.
/// Returns (id, access_token).
async fn register_and_login(
    base_url: &str,
    username: &str,
    telegram_url: Option<&str>,
) -> (i64, String) {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/users/register", base_url))
        .json(&json!({
            "username": username,
            "email": format!("{}@example.com", username),
            "password": "hunter2hunter2",
            "telegram_url": telegram_url,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201, "Registration failed for {}", username);
    let body: serde_json::Value = resp.json().await.unwrap();
    let id = body["id"].as_i64().unwrap();

    let resp = client
        .post(format!("{}/api/auth/token", base_url))
        .form(&[("username", username), ("password", "hunter2hunter2")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200, "Login failed for {}", username);
    let body: serde_json::Value = resp.json().await.unwrap();
    let token = body["access_token"].as_str().unwrap().to_string();

    (id, token)
}

/// Open a relay session from the token's owner to the given recipient.
async fn connect_relay(addr: &SocketAddr, recipient_id: i64, token: &str) -> WsStream {
    let ws_url = format!("ws://{}/ws/messages/{}?token={}", addr, recipient_id, token);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect to relay");
    ws_stream
}

/// Receive the next text frame within a timeout and parse it as JSON.
async fn recv_payload(
    read: &mut futures_util::stream::SplitStream<WsStream>,
) -> serde_json::Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Timed out waiting for frame")
        .expect("Stream ended")
        .expect("WebSocket error");

    match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()).expect("Invalid JSON payload"),
        other => panic!("Expected text frame, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_handshake_rejects_invalid_token() {
    let (_base_url, addr, _notify_rx) = start_test_server().await;

    let ws_url = format!("ws://{}/ws/messages/1?token=not_a_jwt", addr);
    let err = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect_err("Expected handshake rejection");

    // Authorization happens before the upgrade: a plain HTTP 401, no socket
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("Expected HTTP error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_handshake_rejects_unknown_recipient() {
    let (base_url, addr, _notify_rx) = start_test_server().await;
    let (_alice_id, alice_token) = register_and_login(&base_url, "alice", None).await;

    let ws_url = format!("ws://{}/ws/messages/99999?token={}", addr, alice_token);
    let err = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect_err("Expected handshake rejection");

    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("Expected HTTP error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_handshake_rejects_self_messaging() {
    let (base_url, addr, _notify_rx) = start_test_server().await;
    let (alice_id, alice_token) = register_and_login(&base_url, "alice", None).await;

    let ws_url = format!("ws://{}/ws/messages/{}?token={}", addr, alice_id, alice_token);
    let err = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect_err("Expected handshake rejection");

    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("Expected HTTP error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_live_delivery_echoes_sender_and_reaches_recipient() {
    let (base_url, addr, _notify_rx) = start_test_server().await;

    let (alice_id, alice_token) = register_and_login(&base_url, "alice", None).await;
    let (bob_id, bob_token) = register_and_login(&base_url, "bob", None).await;

    let alice_ws = connect_relay(&addr, bob_id, &alice_token).await;
    let bob_ws = connect_relay(&addr, alice_id, &bob_token).await;

    let (mut alice_write, mut alice_read) = alice_ws.split();
    let (_bob_write, mut bob_read) = bob_ws.split();

    alice_write
        .send(Message::Text("hello bob".into()))
        .await
        .expect("Failed to send");

    // Sender gets the echo, recipient gets the delivery — same payload
    let echo = recv_payload(&mut alice_read).await;
    assert_eq!(echo["text"], "hello bob");
    assert_eq!(echo["sender_name"], "alice");
    assert!(echo["timestamp"].as_str().is_some());

    let delivery = recv_payload(&mut bob_read).await;
    assert_eq!(delivery["text"], "hello bob");
    assert_eq!(delivery["sender_name"], "alice");

    // Exactly one record persisted
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/api/messages/with/{}", base_url, bob_id))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    let history: serde_json::Value = resp.json().await.unwrap();
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["sender_id"].as_i64().unwrap(), alice_id);
    assert_eq!(history[0]["recipient_id"].as_i64().unwrap(), bob_id);
    assert_eq!(history[0]["text"], "hello bob");
}

#[tokio::test]
async fn test_offline_recipient_with_handle_gets_notification() {
    let (base_url, addr, mut notify_rx) = start_test_server().await;

    let (_alice_id, alice_token) = register_and_login(&base_url, "alice", None).await;
    let (bob_id, _bob_token) =
        register_and_login(&base_url, "bob", Some("https://t.me/bob_alerts")).await;

    // Bob never connects
    let alice_ws = connect_relay(&addr, bob_id, &alice_token).await;
    let (mut alice_write, mut alice_read) = alice_ws.split();

    alice_write
        .send(Message::Text("are you there?".into()))
        .await
        .expect("Failed to send");

    // Sender still gets the echo
    let echo = recv_payload(&mut alice_read).await;
    assert_eq!(echo["text"], "are you there?");

    // Exactly one notification job, carrying handle + sender + text
    let job = tokio::time::timeout(Duration::from_secs(2), notify_rx.recv())
        .await
        .expect("Timed out waiting for notification")
        .expect("Notifier queue closed");
    assert_eq!(
        job,
        Notification {
            handle: "https://t.me/bob_alerts".to_string(),
            sender_name: "alice".to_string(),
            text: "are you there?".to_string(),
        }
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(notify_rx.try_recv().is_err(), "Expected exactly one job");
}

#[tokio::test]
async fn test_offline_recipient_without_handle_is_silent() {
    let (base_url, addr, mut notify_rx) = start_test_server().await;

    let (_alice_id, alice_token) = register_and_login(&base_url, "alice", None).await;
    let (bob_id, _bob_token) = register_and_login(&base_url, "bob", None).await;

    let alice_ws = connect_relay(&addr, bob_id, &alice_token).await;
    let (mut alice_write, mut alice_read) = alice_ws.split();

    alice_write
        .send(Message::Text("silence".into()))
        .await
        .expect("Failed to send");

    // The echo proves the cycle completed; no notification may follow
    let echo = recv_payload(&mut alice_read).await;
    assert_eq!(echo["text"], "silence");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(notify_rx.try_recv().is_err(), "Expected no notification");

    // Persistence still happened
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/api/messages/with/{}", base_url, bob_id))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    let history: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_empty_frames_are_ignored() {
    let (base_url, addr, _notify_rx) = start_test_server().await;

    let (alice_id, alice_token) = register_and_login(&base_url, "alice", None).await;
    let (bob_id, bob_token) = register_and_login(&base_url, "bob", None).await;

    let alice_ws = connect_relay(&addr, bob_id, &alice_token).await;
    let bob_ws = connect_relay(&addr, alice_id, &bob_token).await;

    let (mut alice_write, _alice_read) = alice_ws.split();
    let (_bob_write, mut bob_read) = bob_ws.split();

    alice_write
        .send(Message::Text("".into()))
        .await
        .expect("Failed to send");
    alice_write
        .send(Message::Text("real".into()))
        .await
        .expect("Failed to send");

    // The first frame bob sees is the non-empty one
    let delivery = recv_payload(&mut bob_read).await;
    assert_eq!(delivery["text"], "real");

    // And only one record exists
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/api/messages/with/{}", base_url, bob_id))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    let history: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_connection_supersedes_first() {
    let (base_url, addr, _notify_rx) = start_test_server().await;

    let (alice_id, alice_token) = register_and_login(&base_url, "alice", None).await;
    let (bob_id, bob_token) = register_and_login(&base_url, "bob", None).await;

    // Bob opens two sessions; the second replaces the first
    let bob_ws_old = connect_relay(&addr, alice_id, &bob_token).await;
    let (_bob_old_write, mut bob_old_read) = bob_ws_old.split();

    let bob_ws_new = connect_relay(&addr, alice_id, &bob_token).await;
    let (_bob_new_write, mut bob_new_read) = bob_ws_new.split();

    // The superseded connection is told to close with code 4000
    let msg = tokio::time::timeout(Duration::from_secs(2), bob_old_read.next())
        .await
        .expect("Expected close on superseded connection")
        .expect("Stream ended")
        .expect("WebSocket error");
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(
                frame.code,
                tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(4000),
                "Expected close code 4000 (superseded)"
            );
        }
        other => panic!("Expected close frame, got: {:?}", other),
    }

    // Deliveries to bob now arrive only on the newest connection
    let alice_ws = connect_relay(&addr, bob_id, &alice_token).await;
    let (mut alice_write, _alice_read) = alice_ws.split();
    alice_write
        .send(Message::Text("to the new session".into()))
        .await
        .expect("Failed to send");

    let delivery = recv_payload(&mut bob_new_read).await;
    assert_eq!(delivery["text"], "to the new session");

    // The superseded session's unwind must not evict its successor
    drop(bob_old_read);
    drop(_bob_old_write);
    tokio::time::sleep(Duration::from_millis(200)).await;

    alice_write
        .send(Message::Text("still here?".into()))
        .await
        .expect("Failed to send");
    let delivery = recv_payload(&mut bob_new_read).await;
    assert_eq!(delivery["text"], "still here?");
}

#[tokio::test]
async fn test_disconnect_cleans_up_registry() {
    let (base_url, addr, mut notify_rx) = start_test_server().await;

    let (alice_id, alice_token) = register_and_login(&base_url, "alice", None).await;
    let (bob_id, bob_token) =
        register_and_login(&base_url, "bob", Some("https://t.me/bob_alerts")).await;

    let alice_ws = connect_relay(&addr, bob_id, &alice_token).await;
    let (mut alice_write, mut alice_read) = alice_ws.split();

    // Bob connects, then disconnects
    {
        let bob_ws = connect_relay(&addr, alice_id, &bob_token).await;
        let (mut bob_write, _bob_read) = bob_ws.split();
        bob_write
            .send(Message::Close(None))
            .await
            .expect("Failed to send close");
    }

    // Give the server a moment to clean up
    tokio::time::sleep(Duration::from_millis(200)).await;

    // With bob's entry gone, delivery falls back to the notifier
    alice_write
        .send(Message::Text("anyone there?".into()))
        .await
        .expect("Failed to send");

    let echo = recv_payload(&mut alice_read).await;
    assert_eq!(echo["text"], "anyone there?");

    let job = tokio::time::timeout(Duration::from_secs(2), notify_rx.recv())
        .await
        .expect("Timed out waiting for notification")
        .expect("Notifier queue closed");
    assert_eq!(job.handle, "https://t.me/bob_alerts");
    assert_eq!(job.text, "anyone there?");
}

#[tokio::test]
async fn test_client_ping_is_answered() {
    let (base_url, addr, _notify_rx) = start_test_server().await;

    let (_alice_id, alice_token) = register_and_login(&base_url, "alice", None).await;
    let (bob_id, _bob_token) = register_and_login(&base_url, "bob", None).await;

    let alice_ws = connect_relay(&addr, bob_id, &alice_token).await;
    let (mut alice_write, mut alice_read) = alice_ws.split();

    alice_write
        .send(Message::Ping(vec![42, 43, 44].into()))
        .await
        .expect("Failed to send ping");

    let msg = tokio::time::timeout(Duration::from_secs(2), alice_read.next())
        .await
        .expect("Expected pong within timeout")
        .expect("Stream ended")
        .expect("WebSocket error");

    match msg {
        Message::Pong(data) => {
            assert_eq!(data.as_ref(), &[42, 43, 44], "Pong data should match ping");
        }
        other => panic!("Expected Pong message, got: {:?}", other),
    }
}
