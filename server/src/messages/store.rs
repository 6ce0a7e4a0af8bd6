//! Message persistence. All functions are synchronous over a
//! `&rusqlite::Connection` and run under `tokio::task::spawn_blocking`.
//! Records are append-only: there is no update operation.

use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

use crate::db::models::MessageRecord;

const MESSAGE_COLUMNS: &str = "id, sender_id, recipient_id, text, timestamp";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message text must not be empty")]
    EmptyText,
    #[error("database unavailable: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
}

/// Persist a new message. The non-empty-text invariant is enforced here so
/// no caller can slip an empty record past it.
pub fn insert_message(
    conn: &Connection,
    sender_id: i64,
    recipient_id: i64,
    text: &str,
    timestamp: &str,
) -> Result<MessageRecord, StoreError> {
    if text.is_empty() {
        return Err(StoreError::EmptyText);
    }

    conn.execute(
        "INSERT INTO messages (sender_id, recipient_id, text, timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![sender_id, recipient_id, text, timestamp],
    )?;

    Ok(MessageRecord {
        id: conn.last_insert_rowid(),
        sender_id,
        recipient_id,
        text: text.to_string(),
        timestamp: timestamp.to_string(),
    })
}

pub fn message_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<MessageRecord>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        rusqlite::params![id],
        MessageRecord::from_row,
    )
    .optional()
}

/// Conversation history between two users, both directions, oldest first.
/// The id tiebreak keeps ordering stable when timestamps collide.
pub fn messages_between(
    conn: &Connection,
    first_user_id: i64,
    second_user_id: i64,
) -> rusqlite::Result<Vec<MessageRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE (sender_id = ?1 AND recipient_id = ?2)
            OR (sender_id = ?2 AND recipient_id = ?1)
         ORDER BY timestamp, id"
    ))?;
    let messages = stmt
        .query_map(
            rusqlite::params![first_user_id, second_user_id],
            MessageRecord::from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

pub fn messages_by_sender(conn: &Connection, user_id: i64) -> rusqlite::Result<Vec<MessageRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE sender_id = ?1 ORDER BY timestamp, id"
    ))?;
    let messages = stmt
        .query_map(rusqlite::params![user_id], MessageRecord::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

/// Everything the user has sent or received, oldest first.
pub fn dialog_messages(conn: &Connection, user_id: i64) -> rusqlite::Result<Vec<MessageRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE sender_id = ?1 OR recipient_id = ?1
         ORDER BY timestamp, id"
    ))?;
    let messages = stmt
        .query_map(rusqlite::params![user_id], MessageRecord::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

/// Delete a message by id. Returns the number of rows removed (0 or 1).
pub fn delete_message(conn: &Connection, id: i64) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM messages WHERE id = ?1", rusqlite::params![id])
}
