pub mod auth;
pub mod buffer;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod permissions;
pub mod relay;
pub mod rooms;
pub mod store;

use livechat_db::DbPool;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    /// Live rooms, buffers and conversation lifecycle.
    pub conversations: Arc<lifecycle::ConversationManager>,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    /// State backed by the sqlx store on `db`.
    pub fn new(db: DbPool, config: AppConfig) -> Self {
        let conversations =
            lifecycle::ConversationManager::with_sql_store(store::SqlStore::new(db.clone()));
        Self {
            db,
            config,
            conversations: Arc::new(conversations),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub jwt_secret: String,
    /// Frames buffered per socket before new ones are dropped.
    pub outbound_queue_capacity: usize,
    /// Largest inbound text frame accepted by the gateway, in bytes.
    pub max_frame_bytes: usize,
    /// Snowflake worker id for newly created conversations.
    pub worker_id: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            outbound_queue_capacity: 256,
            max_frame_bytes: 64 * 1024,
            worker_id: 1,
        }
    }
}
