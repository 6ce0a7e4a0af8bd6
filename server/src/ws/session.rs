//! The per-connection relay session: reads text frames addressed to the
//! session's fixed recipient, persists each one, then fans the delivery out
//! to the sender's and recipient's live connections — or to the offline
//! notifier when the recipient has no connection.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::auth::middleware::Claims;
use crate::db::models::MessageRecord;
use crate::messages::store::{self, StoreError};
use crate::notify::Notification;
use crate::state::AppState;
use crate::users::crud;

/// Close code sent to a connection replaced by a newer one for the same user.
const CLOSE_SUPERSEDED: u16 = 4000;

/// Upper bound on one persistence call, so a stalled store cannot block this
/// session's frame loop indefinitely. Other sessions are unaffected either
/// way — each runs its own loop.
const PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum RelayError {
    #[error("recipient {0} no longer exists")]
    RecipientNotFound(i64),
    #[error("sender {0} no longer exists")]
    SenderNotFound(i64),
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error("message store timed out")]
    PersistenceTimeout,
    #[error("persistence task failed to complete")]
    TaskFailed,
}

/// Payload delivered to live connections on both ends of a message.
#[derive(Debug, Serialize)]
struct OutboundMessage {
    text: String,
    sender_name: String,
    timestamp: String,
}

/// Everything the fan-out step needs, produced by one persistence cycle.
struct PersistedFrame {
    message: MessageRecord,
    sender_name: String,
    recipient_telegram: Option<String>,
}

/// Run an authenticated relay session until the peer disconnects.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards frames from an mpsc channel
/// - Reader loop: processes inbound frames strictly in arrival order
///
/// The mpsc sender is what the registry hands to other sessions, so anyone
/// can push frames to this client by cloning it.
pub async fn run_session(socket: WebSocket, state: AppState, user: Claims, recipient_id: i64) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Entering the open state is the only place a registry entry is created.
    // A prior connection for this user is superseded and explicitly closed;
    // its own unwind becomes a no-op.
    if let Some(superseded) = state.connections.register(user.id, tx.clone()) {
        let _ = superseded.send(Message::Close(Some(CloseFrame {
            code: CLOSE_SUPERSEDED,
            reason: "superseded by a newer connection".into(),
        })));
        tracing::debug!(user_id = user.id, "superseded previous connection");
    }

    // Spawn writer task: forwards mpsc frames to the WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    tracing::info!(user_id = user.id, recipient_id, "relay session started");

    // Reader loop: one persist+fan-out cycle completes before the next frame
    // is read, so frames on a single session are handled in arrival order.
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    relay_frame(&state, &user, recipient_id, text.as_str()).await;
                }
                Message::Binary(_) => {
                    tracing::debug!(user_id = user.id, "ignoring binary frame on text relay");
                }
                Message::Ping(data) => {
                    // Respond to client pings with pong
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Pong(_) => {}
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = user.id,
                        reason = ?frame,
                        "client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = user.id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                // Stream ended — client disconnected
                tracing::info!(user_id = user.id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Cleanup runs on every exit path of the loop above: abort the writer
    // and release this session's registry entry.
    writer_handle.abort();
    state.connections.unregister(user.id, &tx);

    tracing::info!(user_id = user.id, "relay session stopped");
}

/// Writer task: receives frames from the mpsc channel and forwards them to
/// the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}

/// One message cycle: persist, then fan out. A failed cycle drops the frame
/// and leaves the session open for the next one.
async fn relay_frame(state: &AppState, user: &Claims, recipient_id: i64, text: &str) {
    if text.is_empty() {
        // Empty frames are a no-op rather than a protocol error.
        tracing::debug!(user_id = user.id, "ignoring empty message frame");
        return;
    }

    match persist_frame(state, user.id, recipient_id, text).await {
        Ok(frame) => fan_out(state, user.id, recipient_id, frame),
        Err(err) => {
            tracing::error!(
                user_id = user.id,
                recipient_id,
                error = %err,
                "message frame dropped"
            );
        }
    }
}

/// Persist one frame, re-resolving both parties so display-name and
/// telegram-handle changes take effect mid-session and a vanished recipient
/// fails the frame before anything is written.
///
/// Bounded by PERSIST_TIMEOUT: on expiry the session stops waiting and drops
/// the frame (the blocking task itself is not cancelled).
async fn persist_frame(
    state: &AppState,
    sender_id: i64,
    recipient_id: i64,
    text: &str,
) -> Result<PersistedFrame, RelayError> {
    let db = state.db.clone();
    let text = text.to_string();

    let task = tokio::task::spawn_blocking(move || -> Result<PersistedFrame, RelayError> {
        let conn = db
            .lock()
            .map_err(|_| RelayError::Persistence(StoreError::Poisoned))?;

        let recipient = crud::find_by_id(&conn, recipient_id)
            .map_err(StoreError::from)?
            .ok_or(RelayError::RecipientNotFound(recipient_id))?;
        let sender = crud::find_by_id(&conn, sender_id)
            .map_err(StoreError::from)?
            .ok_or(RelayError::SenderNotFound(sender_id))?;

        let timestamp = Utc::now().to_rfc3339();
        let message = store::insert_message(&conn, sender_id, recipient_id, &text, &timestamp)?;

        Ok(PersistedFrame {
            message,
            sender_name: sender.username,
            recipient_telegram: recipient.telegram_url,
        })
    });

    match timeout(PERSIST_TIMEOUT, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(_join_err)) => Err(RelayError::TaskFailed),
        Err(_elapsed) => Err(RelayError::PersistenceTimeout),
    }
}

/// Deliver a persisted message: echo to the sender's live connection, then
/// to the recipient's — falling back to exactly one offline notification
/// when the recipient is not connected and has a telegram handle.
fn fan_out(state: &AppState, sender_id: i64, recipient_id: i64, frame: PersistedFrame) {
    let payload = OutboundMessage {
        text: frame.message.text.clone(),
        sender_name: frame.sender_name.clone(),
        timestamp: frame.message.timestamp.clone(),
    };
    let json = match serde_json::to_string(&payload) {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode delivery payload");
            return;
        }
    };
    let msg = Message::Text(json.into());

    // Self-echo: the sender's own UI confirms delivery without a read-back.
    if let Some(sender_conn) = state.connections.lookup(sender_id) {
        let _ = sender_conn.send(msg.clone());
    }

    match state.connections.lookup(recipient_id) {
        Some(recipient_conn) => {
            let _ = recipient_conn.send(msg);
        }
        None => match frame.recipient_telegram {
            Some(handle) => state.notifier.submit(Notification {
                handle,
                sender_name: frame.sender_name,
                text: frame.message.text,
            }),
            None => {
                tracing::debug!(recipient_id, "recipient offline with no notification handle");
            }
        },
    }
}
