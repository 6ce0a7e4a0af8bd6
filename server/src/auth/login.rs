//! Credential login: exchanges username + password for an access token.

use axum::{extract::State, http::StatusCode, Form, Json};
use serde::{Deserialize, Serialize};

use crate::auth::{jwt, password};
use crate::state::AppState;
use crate::users::crud;

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

/// POST /api/auth/token -- OAuth2-style password login (form encoded).
/// Returns a bearer token on success, 401 on bad credentials.
pub async fn login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Result<Json<TokenResponse>, StatusCode> {
    let db = state.db.clone();
    let username = form.username.clone();

    let user = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        let user = crud::find_by_username(&conn, &username)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        // Argon2 verification is CPU-bound — keep it on the blocking pool.
        if !password::verify_password(&form.password, &user.password_hash) {
            return Err(StatusCode::UNAUTHORIZED);
        }

        Ok(user)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    let token = jwt::issue_access_token(&state.jwt_secret, &user, state.token_expiry_minutes)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    tracing::info!(user_id = user.id, "user logged in");

    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer".to_string(),
    }))
}
