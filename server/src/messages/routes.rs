//! REST surface for message history. This is the request/response path:
//! it persists records but never touches the live relay or the notifier.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::db::models::MessageRecord;
use crate::messages::store::{self, StoreError};
use crate::state::AppState;
use crate::users::crud;

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: i64,
    pub sender_id: i64,
    pub recipient_id: i64,
    pub text: String,
    pub timestamp: String,
}

impl From<MessageRecord> for MessageResponse {
    fn from(message: MessageRecord) -> Self {
        Self {
            id: message.id,
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            text: message.text,
            timestamp: message.timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub recipient_id: i64,
    pub text: String,
}

/// GET /api/messages -- Every message the caller has sent or received.
pub async fn get_dialog_messages(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<MessageResponse>>, StatusCode> {
    let db = state.db.clone();

    let messages = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        store::dialog_messages(&conn, claims.id).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(messages.into_iter().map(MessageResponse::from).collect()))
}

/// GET /api/messages/with/{user_id} -- Conversation history between the
/// caller and another user, oldest first. Backs the conversation view.
pub async fn get_messages_with(
    State(state): State<AppState>,
    claims: Claims,
    Path(other_user_id): Path<i64>,
) -> Result<Json<Vec<MessageResponse>>, StatusCode> {
    let db = state.db.clone();

    let messages = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        store::messages_between(&conn, claims.id, other_user_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(messages.into_iter().map(MessageResponse::from).collect()))
}

/// POST /api/messages -- Persist a message without live delivery.
/// 404 for an unknown recipient, 422 for empty text.
pub async fn send_message(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), StatusCode> {
    let db = state.db.clone();

    let message = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        crud::find_by_id(&conn, body.recipient_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::NOT_FOUND)?;

        let timestamp = Utc::now().to_rfc3339();
        store::insert_message(&conn, claims.id, body.recipient_id, &body.text, &timestamp).map_err(
            |err| match err {
                StoreError::EmptyText => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        )
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok((StatusCode::CREATED, Json(message.into())))
}

/// DELETE /api/messages/{id} -- Senders may delete their own messages.
pub async fn delete_message(
    State(state): State<AppState>,
    claims: Claims,
    Path(message_id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    let db = state.db.clone();

    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        let message = store::message_by_id(&conn, message_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::NOT_FOUND)?;

        if message.sender_id != claims.id {
            return Err(StatusCode::FORBIDDEN);
        }

        store::delete_message(&conn, message_id).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        Ok::<(), StatusCode>(())
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(StatusCode::NO_CONTENT)
}
