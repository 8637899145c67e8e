pub mod auth;
pub mod error;
pub mod presence;
pub mod rooms;
pub mod router;
pub mod thread_locks;
pub mod thread_store;

use parley_db::DbPool;
use parley_media::{MediaConfig, MediaStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Limits applied to every real-time connection.
#[derive(Clone, Debug)]
pub struct GatewayLimits {
    pub max_connections_per_user: usize,
    /// Events buffered per connection before new ones are dropped.
    pub outbound_buffer: usize,
    /// How long a connection may stay unauthenticated.
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            max_connections_per_user: 5,
            outbound_buffer: 256,
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub media_storage_path: String,
    pub max_upload_size: u64,
    /// Worker bits of generated snowflake ids.
    pub worker_id: u16,
    pub gateway: GatewayLimits,
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub identity: Arc<dyn auth::IdentityProvider>,
    pub threads: thread_store::ThreadStore,
    pub presence: presence::PresenceRegistry,
    pub rooms: Arc<dyn rooms::RoomHub>,
    pub router: router::MessageRouter,
    pub media: Arc<MediaStore>,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    /// Wire the default components: JWT identities, in-memory presence and
    /// process-local rooms.
    pub fn new(db: DbPool, config: AppConfig) -> Self {
        let identity: Arc<dyn auth::IdentityProvider> =
            Arc::new(auth::JwtIdentityProvider::new(config.jwt_secret.clone()));
        let presence =
            presence::PresenceRegistry::in_memory(config.gateway.max_connections_per_user);
        let rooms: Arc<dyn rooms::RoomHub> = Arc::new(rooms::LocalRoomHub::new());
        Self::with_components(db, config, identity, presence, rooms)
    }

    pub fn with_components(
        db: DbPool,
        config: AppConfig,
        identity: Arc<dyn auth::IdentityProvider>,
        presence: presence::PresenceRegistry,
        rooms: Arc<dyn rooms::RoomHub>,
    ) -> Self {
        let threads = thread_store::ThreadStore::new(db, config.worker_id);
        let router = router::MessageRouter::new(threads.clone(), rooms.clone());
        let media = Arc::new(MediaStore::new(MediaConfig {
            base_path: config.media_storage_path.clone().into(),
            max_file_size: config.max_upload_size,
            public_prefix: "/media".to_string(),
        }));
        Self {
            config,
            identity,
            threads,
            presence,
            rooms,
            router,
            media,
            shutdown: Arc::new(Notify::new()),
        }
    }
}
