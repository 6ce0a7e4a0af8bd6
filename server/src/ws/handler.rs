use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;

use crate::auth::jwt;
use crate::state::AppState;
use crate::users::crud;
use crate::ws::session;

/// Query parameters for WebSocket connection.
/// Auth is via query param ?token=JWT — browsers cannot set headers on
/// WebSocket upgrades.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

/// GET /ws/messages/{recipient_id}?token=JWT
/// Relay endpoint: one session per conversation, the recipient is fixed by
/// the path for the lifetime of the connection.
///
/// The credential and the recipient are both checked BEFORE the upgrade
/// completes, so a failed handshake is a plain HTTP error and never holds
/// an open socket or touches the registry.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(recipient_id): Path<i64>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let claims = match jwt::validate_access_token(&state.jwt_secret, &params.token) {
        Ok(claims) => claims,
        Err(err) => {
            tracing::warn!(error = %err, "WebSocket auth failed");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    if recipient_id == claims.id {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Resolve the recipient up front: sessions to unknown users are refused
    // rather than silently persisting into the void.
    let db = state.db.clone();
    let recipient = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        crud::find_by_id(&conn, recipient_id).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    if recipient.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    tracing::info!(
        user_id = claims.id,
        recipient_id,
        "WebSocket connection authenticated"
    );

    Ok(ws.on_upgrade(move |socket| session::run_session(socket, state, claims, recipient_id)))
}
