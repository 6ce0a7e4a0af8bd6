use axum::{middleware, Router};
use std::sync::Arc;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::auth::login;
use crate::auth::middleware::JwtSecret;
use crate::messages::routes as message_routes;
use crate::state::AppState;
use crate::users::{contacts, crud as user_crud};
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Rate limiting: 10 requests per minute per IP on credential endpoints.
    // Uses PeerIpKeyExtractor which reads from ConnectInfo<SocketAddr>.
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(6) // 1 token every 6 seconds = 10 per minute
            .burst_size(10)
            .finish()
            .expect("Failed to build governor config"),
    );
    let governor_limiter = governor_config.limiter().clone();

    // Spawn background task to clean up rate limiter state
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
        }
    });

    // Credential routes with rate limiting
    let auth_routes = Router::new()
        .route("/api/auth/token", axum::routing::post(login::login))
        .route(
            "/api/users/register",
            axum::routing::post(user_crud::register),
        )
        .layer(GovernorLayer {
            config: governor_config,
        });

    // Authenticated routes (JWT required — Claims extractor validates token)
    let user_routes = Router::new()
        .route("/api/users", axum::routing::get(user_crud::get_users))
        .route("/api/users", axum::routing::post(user_crud::create_user))
        .route("/api/users/{id}", axum::routing::get(user_crud::get_user))
        .route("/api/users/{id}", axum::routing::put(user_crud::update_user))
        .route(
            "/api/users/{id}",
            axum::routing::delete(user_crud::delete_user),
        )
        .route("/api/contacts", axum::routing::get(contacts::list_contacts));

    let message_api_routes = Router::new()
        .route(
            "/api/messages",
            axum::routing::get(message_routes::get_dialog_messages),
        )
        .route(
            "/api/messages",
            axum::routing::post(message_routes::send_message),
        )
        .route(
            "/api/messages/with/{user_id}",
            axum::routing::get(message_routes::get_messages_with),
        )
        .route(
            "/api/messages/{id}",
            axum::routing::delete(message_routes::delete_message),
        );

    // WebSocket relay endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route(
        "/ws/messages/{recipient_id}",
        axum::routing::get(ws_handler::ws_upgrade),
    );

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(auth_routes)
        .merge(user_routes)
        .merge(message_api_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
