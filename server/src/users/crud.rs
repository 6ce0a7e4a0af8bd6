//! User accounts: registration, lookup, update, deletion.
//!
//! Row-level helpers are synchronous over `&rusqlite::Connection` and run
//! inside `tokio::task::spawn_blocking` from the axum handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::auth::password;
use crate::db::models::{Role, User};
use crate::state::AppState;

const USER_COLUMNS: &str = "id, username, email, telegram_url, password_hash, role, created_at";

// --- Row helpers ---

pub fn find_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        rusqlite::params![id],
        User::from_row,
    )
    .optional()
}

pub fn find_by_username(conn: &Connection, username: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
        rusqlite::params![username],
        User::from_row,
    )
    .optional()
}

pub fn username_taken(conn: &Connection, username: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE username = ?1",
        rusqlite::params![username],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn email_taken(conn: &Connection, email: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE email = ?1",
        rusqlite::params![email],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn user_count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
}

pub fn list_users(conn: &Connection) -> rusqlite::Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))?;
    let users = stmt
        .query_map([], User::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(users)
}

pub struct NewUser {
    pub username: String,
    pub email: String,
    pub telegram_url: Option<String>,
    pub password_hash: String,
    pub role: Role,
}

pub fn insert_user(conn: &Connection, new_user: &NewUser) -> rusqlite::Result<User> {
    let created_at = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO users (username, email, telegram_url, password_hash, role, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            new_user.username,
            new_user.email,
            new_user.telegram_url,
            new_user.password_hash,
            new_user.role.as_str(),
            created_at,
        ],
    )?;

    Ok(User {
        id: conn.last_insert_rowid(),
        username: new_user.username.clone(),
        email: new_user.email.clone(),
        telegram_url: new_user.telegram_url.clone(),
        password_hash: new_user.password_hash.clone(),
        role: new_user.role,
        created_at,
    })
}

// --- DTOs ---

/// Public view of a user. Never exposes the password hash.
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub telegram_url: Option<String>,
    pub role: Role,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            telegram_url: user.telegram_url,
            role: user.role,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub telegram_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub telegram_url: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub new_username: Option<String>,
    pub new_email: Option<String>,
    pub new_password: Option<String>,
    pub new_telegram_url: Option<String>,
    pub new_role: Option<Role>,
}

// --- Handlers ---

/// POST /api/users/register -- Public self-registration (rate limited).
/// The very first account becomes the admin; everyone after that is a
/// regular user regardless of what they ask for.
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserResponse>), StatusCode> {
    let db = state.db.clone();

    let user = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        if email_taken(&conn, &body.email).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)? {
            return Err(StatusCode::BAD_REQUEST);
        }
        if username_taken(&conn, &body.username).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)? {
            return Err(StatusCode::BAD_REQUEST);
        }

        let role = if user_count(&conn).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)? == 0 {
            Role::Admin
        } else {
            Role::User
        };

        let password_hash =
            password::hash_password(&body.password).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        insert_user(
            &conn,
            &NewUser {
                username: body.username,
                email: body.email,
                telegram_url: body.telegram_url,
                password_hash,
                role,
            },
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    tracing::info!(user_id = user.id, role = user.role.as_str(), "user registered");

    Ok((StatusCode::CREATED, Json(user.into())))
}

/// POST /api/users -- Authenticated user creation.
/// Only admins may create admin accounts.
pub async fn create_user(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), StatusCode> {
    let role = body.role.unwrap_or(Role::User);
    if role == Role::Admin && !claims.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.db.clone();

    let user = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        if email_taken(&conn, &body.email).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)? {
            return Err(StatusCode::BAD_REQUEST);
        }
        if username_taken(&conn, &body.username).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)? {
            return Err(StatusCode::BAD_REQUEST);
        }

        let password_hash =
            password::hash_password(&body.password).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        insert_user(
            &conn,
            &NewUser {
                username: body.username,
                email: body.email,
                telegram_url: body.telegram_url,
                password_hash,
                role,
            },
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok((StatusCode::CREATED, Json(user.into())))
}

/// GET /api/users -- Admins see every account; everyone else sees only
/// their own.
pub async fn get_users(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<UserResponse>>, StatusCode> {
    let db = state.db.clone();

    let users = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        if claims.is_admin() {
            list_users(&conn).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
        } else {
            let user = find_by_id(&conn, claims.id)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
                .ok_or(StatusCode::NOT_FOUND)?;
            Ok(vec![user])
        }
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(users.into_iter().map(UserResponse::from).collect()))
}

/// GET /api/users/{id} -- Self or admin.
pub async fn get_user(
    State(state): State<AppState>,
    claims: Claims,
    Path(user_id): Path<i64>,
) -> Result<Json<UserResponse>, StatusCode> {
    if claims.id != user_id && !claims.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.db.clone();

    let user = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        find_by_id(&conn, user_id).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??
    .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(user.into()))
}

/// PUT /api/users/{id} -- Self or admin; role changes are admin-only.
pub async fn update_user(
    State(state): State<AppState>,
    claims: Claims,
    Path(user_id): Path<i64>,
    Json(body): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, StatusCode> {
    if claims.id != user_id && !claims.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }
    if body.new_role.is_some() && !claims.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.db.clone();

    let user = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        let old_user = find_by_id(&conn, user_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::NOT_FOUND)?;

        if let Some(new_username) = &body.new_username {
            if *new_username != old_user.username
                && username_taken(&conn, new_username)
                    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            {
                return Err(StatusCode::BAD_REQUEST);
            }
            conn.execute(
                "UPDATE users SET username = ?1 WHERE id = ?2",
                rusqlite::params![new_username, user_id],
            )
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        }

        if let Some(new_email) = &body.new_email {
            if *new_email != old_user.email
                && email_taken(&conn, new_email).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            {
                return Err(StatusCode::BAD_REQUEST);
            }
            conn.execute(
                "UPDATE users SET email = ?1 WHERE id = ?2",
                rusqlite::params![new_email, user_id],
            )
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        }

        if let Some(new_telegram_url) = &body.new_telegram_url {
            conn.execute(
                "UPDATE users SET telegram_url = ?1 WHERE id = ?2",
                rusqlite::params![new_telegram_url, user_id],
            )
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        }

        if let Some(new_password) = &body.new_password {
            let password_hash = password::hash_password(new_password)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            conn.execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                rusqlite::params![password_hash, user_id],
            )
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        }

        if let Some(new_role) = body.new_role {
            conn.execute(
                "UPDATE users SET role = ?1 WHERE id = ?2",
                rusqlite::params![new_role.as_str(), user_id],
            )
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        }

        find_by_id(&conn, user_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::NOT_FOUND)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(user.into()))
}

/// DELETE /api/users/{id} -- Admin only.
pub async fn delete_user(
    State(state): State<AppState>,
    claims: Claims,
    Path(user_id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    if !claims.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.db.clone();

    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        conn.execute("DELETE FROM users WHERE id = ?1", rusqlite::params![user_id])
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        Ok::<(), StatusCode>(())
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(StatusCode::NO_CONTENT)
}
