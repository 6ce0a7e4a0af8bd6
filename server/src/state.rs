use crate::db::DbPool;
use crate::notify::NotifierHandle;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Access token lifetime handed out by the login endpoint
    pub token_expiry_minutes: i64,
    /// Live WebSocket connection per user
    pub connections: ConnectionRegistry,
    /// Submit side of the offline notification queue
    pub notifier: NotifierHandle,
}
