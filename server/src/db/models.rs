//! Database row types for all tables.
//! These correspond 1:1 to the SQLite schema defined in migrations.rs.

use serde::{Deserialize, Serialize};

/// Account role, stored as TEXT in the users table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

/// User record in the users table
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub telegram_url: Option<String>,
    pub password_hash: String,
    pub role: Role,
    pub created_at: String,
}

impl User {
    /// Map a row selected with the canonical column order
    /// (id, username, email, telegram_url, password_hash, role, created_at).
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let role: String = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            telegram_url: row.get(3)?,
            password_hash: row.get(4)?,
            role: Role::from_str(&role).unwrap_or(Role::User),
            created_at: row.get(6)?,
        })
    }
}

/// Message record in the messages table. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: i64,
    pub sender_id: i64,
    pub recipient_id: i64,
    pub text: String,
    pub timestamp: String,
}

impl MessageRecord {
    /// Map a row selected with the canonical column order
    /// (id, sender_id, recipient_id, text, timestamp).
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            recipient_id: row.get(2)?,
            text: row.get(3)?,
            timestamp: row.get(4)?,
        })
    }
}
