//! Contact directory: the users someone has ever exchanged messages with,
//! derived from the messages table rather than stored separately.

use axum::{extract::State, http::StatusCode, Json};
use rusqlite::Connection;

use crate::auth::middleware::Claims;
use crate::db::models::User;
use crate::state::AppState;
use crate::users::crud::UserResponse;

/// Distinct counterparties of the given user, in either direction,
/// excluding the user themselves.
pub fn contacts_of(conn: &Connection, user_id: i64) -> rusqlite::Result<Vec<User>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT u.id, u.username, u.email, u.telegram_url, u.password_hash, u.role, u.created_at
         FROM users u
         JOIN messages m ON (m.sender_id = u.id AND m.recipient_id = ?1)
                         OR (m.recipient_id = u.id AND m.sender_id = ?1)
         WHERE u.id != ?1
         ORDER BY u.id",
    )?;
    let users = stmt
        .query_map(rusqlite::params![user_id], User::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(users)
}

/// GET /api/contacts -- Contact list of the authenticated user.
pub async fn list_contacts(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<UserResponse>>, StatusCode> {
    let db = state.db.clone();

    let contacts = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        contacts_of(&conn, claims.id).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(contacts.into_iter().map(UserResponse::from).collect()))
}
